// SPDX-License-Identifier: MPL-2.0

//! Zones: cooperative single-threaded execution contexts.
//!
//! Every component of the engine is pinned to a zone, and each zone
//! serves its work items strictly in FIFO order off an unbounded
//! channel. A data-VIO travels the pipeline by being sent, by value,
//! from one zone's thread to the next; it never runs on two zones at
//! once.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::data_vio::DataVio;
use crate::prelude::*;

/// Which zone a work item is bound for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum ZoneKind {
    Logical(usize),
    Physical(usize),
    Hash(usize),
    Cpu,
    Packer,
    Journal,
    BioAck,
}

/// One unit of zone work.
pub(super) enum Work {
    /// Run the data-VIO's current phase.
    Vio(Box<DataVio>),
    /// Run an arbitrary chore on the zone's thread.
    Task(Box<dyn FnOnce() + Send + 'static>),
    /// Stop serving.
    Shutdown,
}

/// The sending side of one zone's work queue.
pub(super) struct ZoneHandle {
    kind: ZoneKind,
    sender: Sender<Work>,
}

impl ZoneHandle {
    pub fn kind(&self) -> ZoneKind {
        self.kind
    }

    pub fn send_vio(&self, vio: Box<DataVio>) {
        let _ = self.sender.send(Work::Vio(vio));
    }

    pub fn send_task(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        let _ = self.sender.send(Work::Task(task));
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Work::Shutdown);
    }
}

/// All the engine's zones.
pub(super) struct ZoneSet {
    pub logical: Vec<ZoneHandle>,
    pub physical: Vec<ZoneHandle>,
    pub hash: Vec<ZoneHandle>,
    pub cpu: ZoneHandle,
    pub packer: ZoneHandle,
    pub journal: ZoneHandle,
    pub bio_ack: ZoneHandle,
}

impl ZoneSet {
    /// Create the zone channels. The receivers are handed back for the
    /// caller to bind to threads.
    pub fn build(
        logical: usize,
        physical: usize,
        hash: usize,
    ) -> (Self, Vec<(ZoneKind, Receiver<Work>)>) {
        debug_assert!(logical > 0 && physical > 0 && hash > 0);
        let mut receivers = Vec::new();
        let mut make = |kind: ZoneKind| {
            let (sender, receiver) = unbounded();
            receivers.push((kind, receiver));
            ZoneHandle { kind, sender }
        };

        let set = ZoneSet {
            logical: (0..logical).map(|id| make(ZoneKind::Logical(id))).collect(),
            physical: (0..physical).map(|id| make(ZoneKind::Physical(id))).collect(),
            hash: (0..hash).map(|id| make(ZoneKind::Hash(id))).collect(),
            cpu: make(ZoneKind::Cpu),
            packer: make(ZoneKind::Packer),
            journal: make(ZoneKind::Journal),
            bio_ack: make(ZoneKind::BioAck),
        };
        (set, receivers)
    }

    /// The handle for `kind`.
    pub fn handle(&self, kind: ZoneKind) -> &ZoneHandle {
        match kind {
            ZoneKind::Logical(id) => &self.logical[id],
            ZoneKind::Physical(id) => &self.physical[id],
            ZoneKind::Hash(id) => &self.hash[id],
            ZoneKind::Cpu => &self.cpu,
            ZoneKind::Packer => &self.packer,
            ZoneKind::Journal => &self.journal,
            ZoneKind::BioAck => &self.bio_ack,
        }
    }

    /// Ask every zone to stop serving.
    pub fn shutdown_all(&self) {
        for handle in self
            .logical
            .iter()
            .chain(self.physical.iter())
            .chain(self.hash.iter())
        {
            handle.shutdown();
        }
        self.cpu.shutdown();
        self.packer.shutdown();
        self.journal.shutdown();
        self.bio_ack.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_channels_are_fifo() {
        let (set, receivers) = ZoneSet::build(2, 2, 1);
        let mut vio_a = Box::new(DataVio::new(0).unwrap());
        vio_a.lbn = 1;
        let mut vio_b = Box::new(DataVio::new(1).unwrap());
        vio_b.lbn = 2;

        set.logical[0].send_vio(vio_a);
        set.logical[0].send_vio(vio_b);
        set.logical[0].shutdown();

        let receiver = receivers
            .iter()
            .find(|(kind, _)| *kind == ZoneKind::Logical(0))
            .map(|(_, r)| r)
            .unwrap();
        match receiver.recv().unwrap() {
            Work::Vio(vio) => assert_eq!(vio.lbn, 1),
            _ => panic!("expected a data-VIO"),
        }
        match receiver.recv().unwrap() {
            Work::Vio(vio) => assert_eq!(vio.lbn, 2),
            _ => panic!("expected a data-VIO"),
        }
        assert!(matches!(receiver.recv().unwrap(), Work::Shutdown));
    }
}
