// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Disk served from a shared memory mapping of the host file.

use std::io;
use std::sync::Arc;

use vm_memory::guest_memory::FileOffset;
use vm_memory::{MmapRegion, VolatileMemory};

use crate::buffer::IoBuffer;
use crate::host_file::HostFile;
use crate::raw::RawBlockDispatcher;
use crate::{check_range, BlockDispatcher, Completion, Error, Result};

struct MappedFile {
    file: Arc<dyn HostFile>,
    region: MmapRegion<()>,
    read_only: bool,
}

impl MappedFile {
    fn map(file: Arc<dyn HostFile>, read_only: bool) -> Result<Option<Self>> {
        let size = file.size().map_err(Error::GetFileSize)?;
        let Some(handle) = file.mappable_file() else {
            return Ok(None);
        };
        if size == 0 {
            return Ok(None);
        }
        let Ok(size) = usize::try_from(size) else {
            return Ok(None);
        };

        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let region = MmapRegion::<()>::build(
            Some(FileOffset::new(handle, 0)),
            size,
            prot,
            libc::MAP_SHARED,
        )
        .map_err(Error::MapFile)?;

        Ok(Some(MappedFile {
            file,
            region,
            read_only,
        }))
    }

    fn capacity(&self) -> u64 {
        self.region.size() as u64
    }

    fn read_at(&self, buf: &IoBuffer, offset: u64) -> Result<()> {
        check_range(offset, buf.len() as u64, self.capacity())?;
        let slice = self
            .region
            .get_slice(offset as usize, buf.len())
            .map_err(Error::MemoryAccess)?;
        buf.with_mut(|data| slice.copy_to(data));
        Ok(())
    }

    fn write_at(&self, buf: &IoBuffer, offset: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_range(offset, buf.len() as u64, self.capacity())?;
        let slice = self
            .region
            .get_slice(offset as usize, buf.len())
            .map_err(Error::MemoryAccess)?;
        buf.with(|data| slice.copy_from(data));
        Ok(())
    }

    fn sync(&self, completion: Completion) {
        if self.read_only {
            return completion(Ok(()));
        }
        // SAFETY: FFI call with the address and length of a mapping owned by
        // `self.region`, which outlives the call.
        let ret = unsafe {
            libc::msync(
                self.region.as_ptr() as *mut libc::c_void,
                self.region.size(),
                libc::MS_SYNC,
            )
        };
        if ret < 0 {
            return completion(Err(Error::SyncMapping(io::Error::last_os_error())));
        }
        self.file
            .sync(Box::new(move |result| completion(result.map_err(Error::HostSync))))
    }
}

enum Backend {
    Mapped(MappedFile),
    Raw(RawBlockDispatcher),
}

/// Serves a disk from a shared mapping of the host file when the file can be
/// mapped, and through a [`RawBlockDispatcher`] otherwise.
///
/// Mapped accesses are plain memory copies completing inline.
pub struct VmoBlockDispatcher {
    backend: Backend,
}

impl VmoBlockDispatcher {
    pub fn new(file: Arc<dyn HostFile>, read_only: bool) -> Result<Self> {
        let backend = match MappedFile::map(file.clone(), read_only) {
            Ok(Some(mapped)) => {
                debug!("Serving disk from a {} byte mapping", mapped.capacity());
                Backend::Mapped(mapped)
            }
            Ok(None) => {
                debug!("Host file cannot be mapped, serving disk through reads");
                Backend::Raw(RawBlockDispatcher::new(file, read_only)?)
            }
            Err(e) => {
                warn!("Failed to map host file, serving disk through reads: {}", e);
                Backend::Raw(RawBlockDispatcher::new(file, read_only)?)
            }
        };
        Ok(VmoBlockDispatcher { backend })
    }

    /// Whether accesses are served from a mapping of the file.
    pub fn is_mapped(&self) -> bool {
        matches!(self.backend, Backend::Mapped(_))
    }
}

impl BlockDispatcher for VmoBlockDispatcher {
    fn capacity(&self) -> u64 {
        match &self.backend {
            Backend::Mapped(mapped) => mapped.capacity(),
            Backend::Raw(raw) => raw.capacity(),
        }
    }

    fn sync(&self, completion: Completion) {
        match &self.backend {
            Backend::Mapped(mapped) => mapped.sync(completion),
            Backend::Raw(raw) => raw.sync(completion),
        }
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        match &self.backend {
            Backend::Mapped(mapped) => completion(mapped.read_at(&buf, offset)),
            Backend::Raw(raw) => raw.read_at(buf, offset, completion),
        }
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        match &self.backend {
            Backend::Mapped(mapped) => completion(mapped.write_at(&buf, offset)),
            Backend::Raw(raw) => raw.write_at(buf, offset, completion),
        }
    }
}
