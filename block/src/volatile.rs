// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Volatile write overlay.
//!
//! Guest writes land in an anonymous memory region the size of the disk and
//! are discarded with the dispatcher. A sector bitmap records which sectors
//! were written: those are served from the overlay, all others from the
//! wrapped dispatcher.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;
use vm_memory::{MmapRegion, VolatileMemory};

use crate::buffer::IoBuffer;
use crate::io_guard::IoGuard;
use crate::sector_bitmap::SectorBitmap;
use crate::{
    check_sector_aligned, BlockDispatcher, Completion, Error, Result, SECTOR_SHIFT, SECTOR_SIZE,
};

/// Largest run of unwritten sectors forwarded to the base in one read.
pub const MAX_BATCH_SECTORS: u64 = 2048;

pub struct VolatileWriteBlockDispatcher {
    base: Arc<dyn BlockDispatcher>,
    capacity: u64,
    overlay: MmapRegion<()>,
    written: Mutex<SectorBitmap>,
}

impl VolatileWriteBlockDispatcher {
    pub fn new(base: Arc<dyn BlockDispatcher>) -> Result<Self> {
        let capacity = base.capacity();
        if capacity == 0 {
            return Err(Error::EmptyDisk);
        }
        let size = usize::try_from(capacity).map_err(|_| Error::OutOfRange {
            offset: 0,
            len: capacity,
            capacity: usize::MAX as u64,
        })?;
        let overlay = MmapRegion::<()>::new(size).map_err(Error::OverlayAllocation)?;
        debug!("Allocated {} byte volatile write overlay", capacity);

        Ok(VolatileWriteBlockDispatcher {
            base,
            capacity,
            overlay,
            written: Mutex::new(SectorBitmap::new()),
        })
    }

    /// Number of sectors currently served from the overlay.
    pub fn written_sectors(&self) -> u64 {
        self.lock_written().count()
    }

    fn lock_written(&self) -> MutexGuard<'_, SectorBitmap> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_access(&self, offset: u64, len: u64) -> Result<()> {
        check_sector_aligned(offset, len)?;
        if offset >= self.capacity || len > self.capacity - offset {
            return Err(Error::InvalidAccess { offset, len });
        }
        Ok(())
    }

    fn copy_from_overlay(&self, buf: &IoBuffer, offset: u64) -> Result<()> {
        let slice = self
            .overlay
            .get_slice(offset as usize, buf.len())
            .map_err(Error::MemoryAccess)?;
        buf.with_mut(|data| slice.copy_to(data));
        Ok(())
    }

    /// Copies the written runs of sectors `[first, last)` into `buf` and
    /// returns the unwritten runs left for the base dispatcher.
    fn serve_written(
        &self,
        buf: &IoBuffer,
        first: u64,
        last: u64,
    ) -> Result<SmallVec<[(u64, u64); 4]>> {
        let mut delegated = SmallVec::new();
        let written = self.lock_written();
        let mut sector = first;
        while sector < last {
            let (is_written, run_end) = written.run_at(sector, last);
            if is_written {
                let window = buf.slice(
                    ((sector - first) * SECTOR_SIZE) as usize,
                    ((run_end - sector) * SECTOR_SIZE) as usize,
                );
                self.copy_from_overlay(&window, sector * SECTOR_SIZE)?;
                sector = run_end;
            } else {
                let run_end = run_end.min(sector + MAX_BATCH_SECTORS);
                delegated.push((sector, run_end));
                sector = run_end;
            }
        }
        Ok(delegated)
    }
}

impl BlockDispatcher for VolatileWriteBlockDispatcher {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn sync(&self, completion: Completion) {
        completion(Ok(()))
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        if let Err(e) = self.check_access(offset, buf.len() as u64) {
            return completion(Err(e));
        }

        let first = offset >> SECTOR_SHIFT;
        let last = (offset + buf.len() as u64) >> SECTOR_SHIFT;
        let delegated = match self.serve_written(&buf, first, last) {
            Ok(delegated) => delegated,
            Err(e) => return completion(Err(e)),
        };

        let guard = IoGuard::new(delegated.len(), completion);
        for (start, end) in delegated {
            if guard.has_failed() {
                guard.skip();
                continue;
            }
            let window = buf.slice(
                ((start - first) * SECTOR_SIZE) as usize,
                ((end - start) * SECTOR_SIZE) as usize,
            );
            self.base.read_at(window, start * SECTOR_SIZE, guard.part());
        }
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        if let Err(e) = self.check_access(offset, buf.len() as u64) {
            return completion(Err(e));
        }

        let slice = match self.overlay.get_slice(offset as usize, buf.len()) {
            Ok(slice) => slice,
            Err(e) => return completion(Err(Error::MemoryAccess(e))),
        };
        {
            let mut written = self.lock_written();
            buf.with(|data| slice.copy_from(data));
            // Sectors are marked once their content is in place.
            written.set(
                offset >> SECTOR_SHIFT,
                (offset + buf.len() as u64) >> SECTOR_SHIFT,
            );
        }

        completion(Ok(()))
    }
}
