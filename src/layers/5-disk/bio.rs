// SPDX-License-Identifier: MPL-2.0

//! Block I/O (BIO) requests at the device's upstream boundary.
//!
//! Requests are sector-addressed; the engine is block-addressed
//! internally and supports partial-block operations at either end of a
//! request.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    layers::bio::{SECTOR_SIZE},
    os::{Condvar, CvarMutex, Mutex},
    prelude::*,
};

/// The type of a block request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BioType {
    /// A read request.
    Read,
    /// A write request.
    Write,
    /// A discard (trim) request.
    Discard,
    /// A flush request.
    Flush,
}

/// Request flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BioFlags(u32);

impl BioFlags {
    /// Acknowledge only once durable.
    pub const SYNC: BioFlags = BioFlags(1 << 0);
    /// Force this request's data down before acknowledging.
    pub const FUA: BioFlags = BioFlags(1 << 1);
    /// Flush everything acknowledged earlier before starting this one.
    pub const PREFLUSH: BioFlags = BioFlags(1 << 2);

    pub const fn empty() -> Self {
        BioFlags(0)
    }

    pub const fn contains(self, other: BioFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: BioFlags) -> Self {
        BioFlags(self.0 | other.0)
    }
}

/// A response from the device.
pub type BioResp = core::result::Result<(), crate::Error>;

/// The type of the callback function invoked upon the completion of
/// a block I/O request.
pub type BioReqOnCompleteFn = fn(/* req = */ &BioReq, /* resp = */ &BioResp);

/// The status describing a block I/O request.
#[derive(Clone, Debug)]
enum BioStatus {
    Init,
    Submitted,
    Completed(BioResp),
}

/// A block I/O request.
pub struct BioReq {
    type_: BioType,
    sector: u64,
    nsectors: u32,
    flags: BioFlags,
    data: Mutex<Vec<u8>>,
    status: CvarMutex<BioStatus>,
    done: Condvar,
    on_complete: Option<BioReqOnCompleteFn>,
}

impl BioReq {
    /// Returns the type of the request.
    pub fn type_(&self) -> BioType {
        self.type_
    }

    /// Returns the starting sector of the request.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Returns the length of the request in sectors.
    pub fn nsectors(&self) -> usize {
        self.nsectors as usize
    }

    /// Returns the request flags.
    pub fn flags(&self) -> BioFlags {
        self.flags
    }

    /// The byte range the request covers on the device.
    pub fn byte_range(&self) -> core::ops::Range<u64> {
        let start = self.sector * SECTOR_SIZE as u64;
        start..start + self.nsectors as u64 * SECTOR_SIZE as u64
    }

    /// Access the request payload with a closure.
    pub fn access_data_with<F, R>(&self, mut f: F) -> R
    where
        F: FnMut(&[u8]) -> R,
    {
        let data = self.data.lock();
        (f)(&data)
    }

    /// Access the mutable payload with a closure.
    pub(super) fn access_mut_data_with<F, R>(&self, mut f: F) -> R
    where
        F: FnMut(&mut [u8]) -> R,
    {
        let mut data = self.data.lock();
        (f)(&mut data)
    }

    /// Take the payload out of the request.
    pub fn take_data(&self) -> Vec<u8> {
        let mut data = self.data.lock();
        core::mem::take(&mut *data)
    }

    /// Block until the request completes; returns the response.
    pub fn wait(&self) -> BioResp {
        let mut status = self.status.lock().unwrap();
        loop {
            if let BioStatus::Completed(resp) = &*status {
                return resp.clone();
            }
            status = self.done.wait(status).unwrap();
        }
    }

    /// Update the status of the request to "completed" by giving the
    /// response to the request.
    ///
    /// # Panics
    ///
    /// If the request has not been submitted yet, or has been completed
    /// already, this method will panic.
    pub(super) fn complete(&self, resp: BioResp) {
        let mut status = self.status.lock().unwrap();
        match *status {
            BioStatus::Submitted => {
                if let Some(on_complete) = self.on_complete {
                    (on_complete)(self, &resp);
                }
                *status = BioStatus::Completed(resp);
                self.done.notify_all();
            }
            _ => panic!("cannot complete before submitting or complete twice"),
        }
    }

    /// Mark the request as submitted.
    pub(super) fn submit(&self) {
        let mut status = self.status.lock().unwrap();
        match *status {
            BioStatus::Init => *status = BioStatus::Submitted,
            _ => unreachable!(),
        }
    }
}

impl Debug for BioReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BioReq")
            .field("type", &self.type_)
            .field("sector", &self.sector)
            .field("nsectors", &self.nsectors)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A builder for `BioReq`.
pub struct BioReqBuilder {
    type_: BioType,
    sector: Option<u64>,
    nsectors: Option<u32>,
    flags: BioFlags,
    data: Option<Vec<u8>>,
    on_complete: Option<BioReqOnCompleteFn>,
}

impl BioReqBuilder {
    /// Creates a builder of a block request of the given type.
    pub fn new(type_: BioType) -> Self {
        Self {
            type_,
            sector: None,
            nsectors: None,
            flags: BioFlags::empty(),
            data: None,
            on_complete: None,
        }
    }

    /// Specify the starting sector of the request.
    pub fn sector(mut self, sector: u64) -> Self {
        self.sector = Some(sector);
        self
    }

    /// Specify the length in sectors (only meaningful for a discard;
    /// reads and writes derive it from the payload).
    pub fn nsectors(mut self, nsectors: u32) -> Self {
        self.nsectors = Some(nsectors);
        self
    }

    /// Specify the request flags.
    pub fn flags(mut self, flags: BioFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Give the payload of the request.
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Specify a callback invoked when the request is complete.
    pub fn on_complete(mut self, on_complete: BioReqOnCompleteFn) -> Self {
        self.on_complete = Some(on_complete);
        self
    }

    /// Build the request.
    pub fn build(mut self) -> BioReq {
        let type_ = self.type_;
        if type_ == BioType::Flush {
            debug_assert!(
                self.data.is_none(),
                "data is only meaningful for a read or write",
            );
        }

        let data = self.data.take().unwrap_or_default();
        debug_assert!(data.len() % SECTOR_SIZE == 0, "payload must be sector aligned");
        let nsectors = self
            .nsectors
            .unwrap_or((data.len() / SECTOR_SIZE) as u32);

        BioReq {
            type_,
            sector: self.sector.unwrap_or(0),
            nsectors,
            flags: self.flags,
            data: Mutex::new(data),
            status: CvarMutex::new(BioStatus::Init),
            done: Condvar::new(),
            on_complete: self.on_complete.take(),
        }
    }
}

/// The engine-side handle shared by the data-VIOs carved out of one
/// upstream request: counts children down and records the first failure.
pub(super) struct BioShare {
    pub req: Arc<BioReq>,
    remaining: AtomicUsize,
    first_error: Mutex<Option<crate::Error>>,
}

impl BioShare {
    pub fn new(req: Arc<BioReq>, children: usize) -> Self {
        debug_assert!(children > 0);
        Self {
            req,
            remaining: AtomicUsize::new(children),
            first_error: Mutex::new(None),
        }
    }

    /// One child finished; the last one completes the upstream request.
    pub fn complete_child(&self, result: core::result::Result<(), crate::Error>) {
        if let Err(e) = result {
            self.first_error.lock().get_or_insert(e);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let resp = match self.first_error.lock().take() {
                Some(e) => Err(e),
                None => Ok(()),
            };
            self.req.complete(resp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_derives_sectors_from_payload() {
        let req = BioReqBuilder::new(BioType::Write)
            .sector(8)
            .data(vec![0u8; 3 * SECTOR_SIZE])
            .build();
        assert_eq!(req.nsectors(), 3);
        assert_eq!(req.byte_range(), 8 * 512..11 * 512);
    }

    #[test]
    fn share_completes_once_with_first_error() {
        let req = Arc::new(BioReqBuilder::new(BioType::Write).data(vec![0u8; 512]).build());
        req.submit();
        let share = BioShare::new(req.clone(), 3);
        share.complete_child(Ok(()));
        share.complete_child(Err(crate::Error::new(crate::Errno::OutOfSpace)));
        share.complete_child(Err(crate::Error::new(crate::Errno::IoFailed)));

        let resp = req.wait();
        assert_eq!(resp.unwrap_err().errno(), crate::Errno::OutOfSpace);
    }

    #[test]
    fn flags_compose() {
        let flags = BioFlags::SYNC.union(BioFlags::FUA);
        assert!(flags.contains(BioFlags::SYNC));
        assert!(flags.contains(BioFlags::FUA));
        assert!(!flags.contains(BioFlags::PREFLUSH));
    }
}
