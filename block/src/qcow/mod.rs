// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Read only QCOW2 image support.
//!
//! A [`QcowFile`] parses the header and the whole cluster lookup table of an
//! image served by another [`BlockDispatcher`], then translates reads of the
//! virtual disk into reads of the image. [`QcowBlockDispatcher`] exposes a
//! loaded image as a dispatcher.

pub mod header;
pub mod table;
#[cfg(test)]
pub(crate) mod test_image;
mod util;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use remain::sorted;
use smallvec::SmallVec;
use thiserror::Error;

pub use self::header::{IncompatFeatures, MissingFeatureError, QcowHeader, QCOW_MAGIC};
use self::header::HEADER_READ_SIZE;
pub use self::table::LookupTable;
use crate::buffer::IoBuffer;
use crate::io_guard::IoGuard;
use crate::{check_range, check_sector_aligned, BlockDispatcher, Completion, Status};

#[sorted]
#[derive(Debug, Error)]
pub enum Error {
    #[error("Backing files are not supported")]
    BackingFileUnsupported,
    #[error("Compressed cluster at linear offset {0:#x} is not supported")]
    CompressedCluster(u64),
    #[error("Encryption method {0} is not supported")]
    EncryptionUnsupported(u32),
    #[error("Header truncated: only {0} bytes available")]
    HeaderTruncated(usize),
    #[error("Invalid cluster bits: {0}")]
    InvalidClusterBits(u32),
    #[error("Invalid header length: {0}")]
    InvalidHeaderLength(u32),
    #[error("Invalid L1 table offset: {0:#x}")]
    InvalidL1TableOffset(u64),
    #[error("Invalid L2 table offset: {0:#x}")]
    InvalidL2TableOffset(u64),
    #[error("Invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("L1 index {0} out of range")]
    L1IndexOutOfRange(u64),
    #[error("L1 table too small: {declared} entries declared, {required} required")]
    L1TableTooSmall { declared: u32, required: u64 },
    #[error("Failed to read header")]
    ReadingHeader(#[source] Box<crate::Error>),
    #[error("Failed to read L1 table")]
    ReadingL1Table(#[source] Box<crate::Error>),
    #[error("Failed to read L2 table")]
    ReadingL2Table(#[source] Box<crate::Error>),
    #[error("L1 entry table too large: {0}")]
    TooManyL1Entries(u64),
    #[error("Cluster offset {0:#x} is not cluster aligned")]
    UnalignedClusterOffset(u64),
    #[error("Unsupported incompatible features")]
    UnsupportedFeatures(#[source] MissingFeatureError),
    #[error("Unsupported QCOW version: {0}")]
    UnsupportedVersion(u32),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::BackingFileUnsupported => Status::NotSupported,
            Error::CompressedCluster(_) => Status::NotSupported,
            Error::EncryptionUnsupported(_) => Status::NotSupported,
            Error::HeaderTruncated(_) => Status::InvalidArgs,
            Error::InvalidClusterBits(_) => Status::InvalidArgs,
            Error::InvalidHeaderLength(_) => Status::InvalidArgs,
            Error::InvalidL1TableOffset(_) => Status::InvalidArgs,
            Error::InvalidL2TableOffset(_) => Status::InvalidArgs,
            Error::InvalidMagic(_) => Status::WrongType,
            Error::L1IndexOutOfRange(_) => Status::OutOfRange,
            Error::L1TableTooSmall { .. } => Status::InvalidArgs,
            Error::ReadingHeader(e) => e.status(),
            Error::ReadingL1Table(e) => e.status(),
            Error::ReadingL2Table(e) => e.status(),
            Error::TooManyL1Entries(_) => Status::NotSupported,
            Error::UnalignedClusterOffset(_) => Status::Io,
            Error::UnsupportedFeatures(_) => Status::NotSupported,
            Error::UnsupportedVersion(_) => Status::NotSupported,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct LoadedImage {
    header: QcowHeader,
    table: LookupTable,
}

enum LoadState {
    Unloaded,
    Loading,
    Loaded(Arc<LoadedImage>),
}

// A contiguous part of a read, either unallocated or mapped to contiguous
// bytes of the image.
struct Extent {
    buf_offset: usize,
    len: usize,
    physical: Option<u64>,
}

/// A QCOW2 image read through a base dispatcher serving the image file.
pub struct QcowFile {
    state: Mutex<LoadState>,
}

impl Default for QcowFile {
    fn default() -> Self {
        Self::new()
    }
}

impl QcowFile {
    pub fn new() -> Self {
        QcowFile {
            state: Mutex::new(LoadState::Unloaded),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded(&self) -> Option<Arc<LoadedImage>> {
        match &*self.lock_state() {
            LoadState::Loaded(image) => Some(image.clone()),
            LoadState::Unloaded | LoadState::Loading => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }

    /// Header of the loaded image.
    pub fn header(&self) -> Option<QcowHeader> {
        self.loaded().map(|image| image.header.clone())
    }

    /// Size of the virtual disk, once loaded.
    pub fn virtual_size(&self) -> Option<u64> {
        self.loaded().map(|image| image.header.size)
    }

    /// Reads and validates the header and the lookup table of the image
    /// served by `base`.
    ///
    /// Reads must not be issued before `completion` fires. A failed load
    /// leaves the file unloaded.
    pub fn load(
        self: &Arc<Self>,
        base: Arc<dyn BlockDispatcher>,
        completion: Completion<QcowHeader>,
    ) {
        {
            let mut state = self.lock_state();
            if !matches!(*state, LoadState::Unloaded) {
                drop(state);
                return completion(Err(crate::Error::AlreadyLoaded));
            }
            *state = LoadState::Loading;
        }

        let file = self.clone();
        let done: Completion<LoadedImage> = Box::new(move |result| {
            let mut state = file.lock_state();
            match result {
                Ok(image) => {
                    let header = image.header.clone();
                    *state = LoadState::Loaded(Arc::new(image));
                    drop(state);
                    completion(Ok(header))
                }
                Err(e) => {
                    *state = LoadState::Unloaded;
                    drop(state);
                    completion(Err(e))
                }
            }
        });

        let header_len = base.capacity().min(HEADER_READ_SIZE) as usize;
        let header_buf = IoBuffer::new(header_len);
        let reader = base.clone();
        base.read_at(
            header_buf.clone(),
            0,
            Box::new(move |result| {
                if let Err(e) = result {
                    let e = Error::ReadingHeader(Box::new(e));
                    return done(Err(crate::Error::Qcow(e)));
                }
                let header = match header_buf.with(|bytes| -> Result<QcowHeader> {
                    let header = QcowHeader::new(bytes)?;
                    header.validate(bytes)?;
                    Ok(header)
                }) {
                    Ok(header) => header,
                    Err(e) => return done(Err(crate::Error::Qcow(e))),
                };
                debug!(
                    "QCOW{} image: {} bytes, {} byte clusters",
                    header.version,
                    header.size,
                    header.cluster_size()
                );

                let table = LookupTable::new(header.cluster_bits, header.size);
                let (l1_size, l1_table_offset) = (header.l1_size, header.l1_table_offset);
                table.load(
                    l1_size,
                    l1_table_offset,
                    reader,
                    Box::new(move |result| {
                        done(result.map(|table| LoadedImage { header, table }))
                    }),
                );
            }),
        );
    }

    /// Reads `buf.len()` bytes of the virtual disk at `offset` into `buf`.
    ///
    /// Every cluster of the range is resolved before any I/O is issued, so a
    /// read touching an unsupported cluster fails as a whole. Unallocated
    /// clusters read as zeros without I/O.
    pub fn read_at(
        &self,
        base: &Arc<dyn BlockDispatcher>,
        buf: IoBuffer,
        offset: u64,
        completion: Completion,
    ) {
        let Some(image) = self.loaded() else {
            return completion(Err(crate::Error::NotLoaded));
        };
        let extents = match image.extents(offset, buf.len()) {
            Ok(extents) => extents,
            Err(e) => return completion(Err(e)),
        };

        // Zero the unallocated extents first, the completion may run as soon
        // as the last read is issued.
        let mut mapped: SmallVec<[(IoBuffer, u64); 8]> = SmallVec::new();
        for extent in extents {
            let window = buf.slice(extent.buf_offset, extent.len);
            match extent.physical {
                None => window.fill(0),
                Some(physical) => mapped.push((window, physical)),
            }
        }

        let guard = IoGuard::new(mapped.len(), completion);
        for (window, physical) in mapped {
            if guard.has_failed() {
                guard.skip();
                continue;
            }
            base.read_at(window, physical, guard.part());
        }
    }
}

impl LoadedImage {
    /// Splits `[offset, offset + len)` into extents, merging clusters that
    /// are contiguous in the image or both unallocated.
    fn extents(&self, offset: u64, len: usize) -> crate::Result<SmallVec<[Extent; 8]>> {
        check_sector_aligned(offset, len as u64)?;
        check_range(offset, len as u64, self.header.size)?;

        let cluster_size = self.table.cluster_size();
        let mut extents: SmallVec<[Extent; 8]> = SmallVec::new();
        let mut done = 0usize;
        while done < len {
            let linear = offset + done as u64;
            let in_cluster = cluster_size - (linear & (cluster_size - 1));
            let chunk = (len - done).min(in_cluster as usize);
            let physical = self.table.walk(linear).map_err(crate::Error::Qcow)?;

            let merged = match (extents.last_mut(), physical) {
                (Some(last), None) if last.physical.is_none() => {
                    last.len += chunk;
                    true
                }
                (Some(last), Some(physical)) => match last.physical {
                    Some(start) if start + last.len as u64 == physical => {
                        last.len += chunk;
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
            if !merged {
                extents.push(Extent {
                    buf_offset: done,
                    len: chunk,
                    physical,
                });
            }
            done += chunk;
        }
        Ok(extents)
    }
}

/// Serves the virtual disk of a loaded QCOW2 image. Writes are rejected.
pub struct QcowBlockDispatcher {
    base: Arc<dyn BlockDispatcher>,
    file: Arc<QcowFile>,
    capacity: u64,
}

impl QcowBlockDispatcher {
    /// Loads the image served by `base` and returns a dispatcher for it.
    pub fn create(base: Arc<dyn BlockDispatcher>, completion: Completion<QcowBlockDispatcher>) {
        let file = Arc::new(QcowFile::new());
        let loaded = file.clone();
        let dispatcher_base = base.clone();
        file.load(
            base,
            Box::new(move |result| {
                completion(result.map(|header| QcowBlockDispatcher {
                    base: dispatcher_base,
                    file: loaded,
                    capacity: header.size,
                }))
            }),
        );
    }

    pub fn file(&self) -> &Arc<QcowFile> {
        &self.file
    }
}

impl BlockDispatcher for QcowBlockDispatcher {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn sync(&self, completion: Completion) {
        completion(Ok(()))
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        self.file.read_at(&self.base, buf, offset, completion)
    }

    fn write_at(&self, _buf: IoBuffer, _offset: u64, completion: Completion) {
        completion(Err(crate::Error::WriteUnsupported))
    }
}
