// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;
use std::sync::Arc;

use crate::buffer::IoBuffer;
use crate::host_file::{HostCompletion, HostFile};
use crate::io_guard::IoGuard;
use crate::{check_range, BlockDispatcher, Completion, Error, Result};

/// Largest transfer issued to the host file in one operation.
pub const DEFAULT_MAX_TRANSFER: usize = 8192;

/// Serves a disk straight from the bytes of a host file.
pub struct RawBlockDispatcher {
    file: Arc<dyn HostFile>,
    capacity: u64,
    read_only: bool,
    max_transfer: usize,
}

impl RawBlockDispatcher {
    pub fn new(file: Arc<dyn HostFile>, read_only: bool) -> Result<Self> {
        Self::with_max_transfer(file, read_only, DEFAULT_MAX_TRANSFER)
    }

    pub fn with_max_transfer(
        file: Arc<dyn HostFile>,
        read_only: bool,
        max_transfer: usize,
    ) -> Result<Self> {
        let capacity = file.size().map_err(Error::GetFileSize)?;
        Ok(RawBlockDispatcher {
            file,
            capacity,
            read_only,
            max_transfer: max_transfer.max(1),
        })
    }

    /// Splits `buf` in chunks of at most `max_transfer` bytes and issues
    /// `op` for each of them. Chunks run concurrently.
    fn split<F>(
        &self,
        buf: IoBuffer,
        offset: u64,
        completion: Completion,
        host_error: fn(io::Error) -> Error,
        op: F,
    ) where
        F: Fn(IoBuffer, u64, HostCompletion),
    {
        if let Err(e) = check_range(offset, buf.len() as u64, self.capacity) {
            return completion(Err(e));
        }

        let chunks = buf.len().div_ceil(self.max_transfer);
        let guard = IoGuard::new(chunks, completion);
        for i in 0..chunks {
            if guard.has_failed() {
                guard.skip();
                continue;
            }
            let start = i * self.max_transfer;
            let len = self.max_transfer.min(buf.len() - start);
            let part = guard.part();
            op(
                buf.slice(start, len),
                offset + start as u64,
                Box::new(move |result| {
                    part(match result {
                        Ok(actual) if actual == len => Ok(()),
                        Ok(actual) => Err(Error::ShortTransfer {
                            expected: len,
                            actual,
                        }),
                        Err(e) => Err(host_error(e)),
                    })
                }),
            );
        }
    }
}

impl BlockDispatcher for RawBlockDispatcher {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn sync(&self, completion: Completion) {
        if self.read_only {
            return completion(Ok(()));
        }
        self.file
            .sync(Box::new(move |result| completion(result.map_err(Error::HostSync))))
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        self.split(buf, offset, completion, Error::HostRead, |buf, offset, c| {
            self.file.read_at(buf, offset, c)
        })
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        if self.read_only {
            return completion(Err(Error::ReadOnly));
        }
        self.split(buf, offset, completion, Error::HostWrite, |buf, offset, c| {
            self.file.write_at(buf, offset, c)
        })
    }
}
