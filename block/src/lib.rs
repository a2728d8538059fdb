// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Layered block dispatchers backing a virtio-blk device.
//!
//! A disk is exposed to the device as a chain of [`BlockDispatcher`]s, each
//! one decorating the next: an optional volatile write overlay, an optional
//! QCOW2 decoder and finally a raw or memory mapped view of the host file.
//! Every operation is asynchronous and reports its outcome through a
//! [`Completion`] invoked exactly once.

#[macro_use]
extern crate log;

pub mod buffer;
pub mod file_pool;
pub mod file_sync;
pub mod host_file;
pub mod io_guard;
pub mod qcow;
pub mod raw;
pub mod sector_bitmap;
#[cfg(test)]
mod test_util;
pub mod vmo;
pub mod volatile;

use std::fmt::{self, Display, Formatter};
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::result;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use virtio_bindings::virtio_blk::{VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_UNSUPP};
use vm_memory::mmap::MmapRegionError;
use vm_memory::VolatileMemoryError;

pub use crate::buffer::IoBuffer;
use crate::file_pool::PooledFile;
use crate::host_file::HostFile;
pub use crate::io_guard::IoGuard;
use crate::qcow::{QcowBlockDispatcher, QCOW_MAGIC};
use crate::raw::RawBlockDispatcher;
use crate::vmo::VmoBlockDispatcher;
use crate::volatile::VolatileWriteBlockDispatcher;

const SECTOR_SHIFT: u8 = 9;
pub const SECTOR_SIZE: u64 = 0x01 << SECTOR_SHIFT;

/// Default number of worker threads serving a pooled host file.
pub const DEFAULT_IO_THREADS: usize = 4;

/// Coarse classification of a failed operation, as seen by the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Short transfer or host I/O fault.
    Io,
    /// The request exceeds the addressable range of the dispatcher.
    OutOfRange,
    /// Misaligned or malformed request.
    InvalidArgs,
    /// Unsupported image feature or operation.
    NotSupported,
    /// The dispatcher is not in a state allowing the operation.
    BadState,
    /// The image does not have the expected format.
    WrongType,
}

impl Status {
    /// Status byte to report to the guest for a request failing with `self`.
    pub fn virtio_status(self) -> u8 {
        let status = match self {
            Status::Io => VIRTIO_BLK_S_IOERR,
            Status::OutOfRange => VIRTIO_BLK_S_IOERR,
            Status::InvalidArgs => VIRTIO_BLK_S_IOERR,
            Status::NotSupported => VIRTIO_BLK_S_UNSUPP,
            Status::BadState => VIRTIO_BLK_S_IOERR,
            Status::WrongType => VIRTIO_BLK_S_IOERR,
        };
        status as u8
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Operation abandoned before it completed")]
    Abandoned,
    #[error("Disk image already loaded")]
    AlreadyLoaded,
    #[error("Disk has no addressable sectors")]
    EmptyDisk,
    #[error("Failed to get host file size")]
    GetFileSize(#[source] io::Error),
    #[error("Failed to read from host file")]
    HostRead(#[source] io::Error),
    #[error("Failed to sync host file")]
    HostSync(#[source] io::Error),
    #[error("Failed to write to host file")]
    HostWrite(#[source] io::Error),
    #[error("Invalid access: offset {offset:#x}, length {len:#x}")]
    InvalidAccess { offset: u64, len: u64 },
    #[error("Failed to map disk file")]
    MapFile(#[source] MmapRegionError),
    #[error("Failed to access mapped memory")]
    MemoryAccess(#[source] VolatileMemoryError),
    #[error("Disk image not loaded")]
    NotLoaded,
    #[error("Failed to open disk image {1:?}")]
    OpenImage(#[source] io::Error, PathBuf),
    #[error("Access out of range: offset {offset:#x}, length {len:#x}, capacity {capacity:#x}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },
    #[error("Failed to allocate the write overlay")]
    OverlayAllocation(#[source] MmapRegionError),
    #[error("Failure in qcow")]
    Qcow(#[source] qcow::Error),
    #[error("Device is read only")]
    ReadOnly,
    #[error("Short transfer: expected {expected} bytes, transferred {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("Failed to sync the file mapping")]
    SyncMapping(#[source] io::Error),
    #[error("Unknown block mode: {0}")]
    UnknownBlockMode(String),
    #[error("Unknown image format: {0}")]
    UnknownImageFormat(String),
    #[error("Failed to start I/O workers")]
    WorkerSpawn(#[source] io::Error),
    #[error("Writes are not supported by the qcow2 layer")]
    WriteUnsupported,
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::Abandoned => Status::BadState,
            Error::AlreadyLoaded => Status::BadState,
            Error::EmptyDisk => Status::InvalidArgs,
            Error::GetFileSize(_) => Status::Io,
            Error::HostRead(_) => Status::Io,
            Error::HostSync(_) => Status::Io,
            Error::HostWrite(_) => Status::Io,
            Error::InvalidAccess { .. } => Status::InvalidArgs,
            Error::MapFile(_) => Status::Io,
            Error::MemoryAccess(_) => Status::Io,
            Error::NotLoaded => Status::BadState,
            Error::OpenImage(..) => Status::Io,
            Error::OutOfRange { .. } => Status::OutOfRange,
            Error::OverlayAllocation(_) => Status::Io,
            Error::Qcow(e) => e.status(),
            Error::ReadOnly => Status::NotSupported,
            Error::ShortTransfer { .. } => Status::Io,
            Error::SyncMapping(_) => Status::Io,
            Error::UnknownBlockMode(_) => Status::InvalidArgs,
            Error::UnknownImageFormat(_) => Status::InvalidArgs,
            Error::WorkerSpawn(_) => Status::Io,
            Error::WriteUnsupported => Status::NotSupported,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Callback receiving the outcome of an asynchronous operation.
///
/// It is invoked exactly once, either before the issuing call returns or
/// later from another thread.
pub type Completion<T = ()> = Box<dyn FnOnce(Result<T>) + Send>;

/// A byte addressable virtual disk.
///
/// Implementations are composed as decorators: each one may serve a request
/// itself or forward it, possibly split or translated, to the dispatcher it
/// wraps. Requests are bounded by [`BlockDispatcher::capacity`].
pub trait BlockDispatcher: Send + Sync {
    /// Size of the addressable range, in bytes.
    fn capacity(&self) -> u64;
    /// Flushes completed writes to durable storage.
    fn sync(&self, completion: Completion);
    /// Fills `buf` with the bytes starting at `offset`.
    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion);
    /// Stores the content of `buf` starting at `offset`.
    fn write_at(&self, buf: IoBuffer, offset: u64, completion: Completion);
}

/// Checks that `[offset, offset + len)` lies within `capacity`.
pub(crate) fn check_range(offset: u64, len: u64, capacity: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(Error::OutOfRange {
            offset,
            len,
            capacity,
        }),
    }
}

/// Checks that both `offset` and `len` are whole sectors.
pub(crate) fn check_sector_aligned(offset: u64, len: u64) -> Result<()> {
    if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
        return Err(Error::InvalidAccess { offset, len });
    }
    Ok(())
}

/// Issues an operation and blocks the calling thread until it completes.
///
/// This must not be called from a thread the operation itself depends on,
/// such as a worker of the host file it targets.
pub fn wait_for<T, F>(issue: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let (tx, rx) = flume::bounded(1);
    issue(Box::new(move |result| {
        tx.send(result).ok();
    }));
    rx.recv().unwrap_or_else(|_| Err(Error::Abandoned))
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Raw,
    Qcow2,
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Raw => write!(f, "raw"),
            ImageFormat::Qcow2 => write!(f, "qcow2"),
        }
    }
}

impl FromStr for ImageFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            _ => Err(Error::UnknownImageFormat(s.to_string())),
        }
    }
}

/// How guest writes reach the image.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlockMode {
    /// Writes are rejected.
    #[default]
    ReadOnly,
    /// Writes go to the image.
    ReadWrite,
    /// Writes are kept in memory and discarded with the device.
    VolatileWrite,
}

impl Display for BlockMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockMode::ReadOnly => write!(f, "read-only"),
            BlockMode::ReadWrite => write!(f, "read-write"),
            BlockMode::VolatileWrite => write!(f, "volatile-write"),
        }
    }
}

impl FromStr for BlockMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read-only" => Ok(BlockMode::ReadOnly),
            "read-write" => Ok(BlockMode::ReadWrite),
            "volatile-write" => Ok(BlockMode::VolatileWrite),
            _ => Err(Error::UnknownBlockMode(s.to_string())),
        }
    }
}

fn default_direct_map() -> bool {
    true
}

fn default_io_threads() -> usize {
    DEFAULT_IO_THREADS
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub path: PathBuf,
    // If this is None, the format is detected from the image content.
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub mode: BlockMode,
    // Serve the image from a shared mapping of the file when possible.
    #[serde(default = "default_direct_map")]
    pub direct_map: bool,
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,
}

impl DiskConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiskConfig {
            path: path.into(),
            format: None,
            mode: BlockMode::default(),
            direct_map: default_direct_map(),
            io_threads: default_io_threads(),
        }
    }
}

/// Determines the format of the image served by `disk` from its first sector.
pub fn detect_image_format(disk: &dyn BlockDispatcher, completion: Completion<ImageFormat>) {
    let magic_len = std::mem::size_of::<u32>() as u64;
    if disk.capacity() < magic_len {
        return completion(Ok(ImageFormat::Raw));
    }

    let buf = IoBuffer::new(disk.capacity().min(SECTOR_SIZE) as usize);
    disk.read_at(
        buf.clone(),
        0,
        Box::new(move |result| {
            completion(result.map(|()| {
                let magic = buf.with(|data| u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                if magic == QCOW_MAGIC {
                    ImageFormat::Qcow2
                } else {
                    ImageFormat::Raw
                }
            }))
        }),
    );
}

/// Opens the host file described by `config` and returns the dispatcher
/// serving its raw bytes.
pub fn open_base(config: &DiskConfig) -> Result<Arc<dyn BlockDispatcher>> {
    let writable = config.mode == BlockMode::ReadWrite;
    let file = OpenOptions::new()
        .read(true)
        .write(writable)
        .open(&config.path)
        .map_err(|e| Error::OpenImage(e, config.path.clone()))?;
    let host: Arc<dyn HostFile> = Arc::new(
        PooledFile::new(file, config.io_threads.max(1)).map_err(Error::WorkerSpawn)?,
    );

    let base: Arc<dyn BlockDispatcher> = if config.direct_map {
        Arc::new(VmoBlockDispatcher::new(host, !writable)?)
    } else {
        Arc::new(RawBlockDispatcher::new(host, !writable)?)
    };
    Ok(base)
}

/// Builds the complete dispatcher chain for `config`.
///
/// Fails if the image cannot be opened, or if it is a QCOW2 image that
/// cannot be served; the device must not start in that case.
pub fn open_disk(config: &DiskConfig, completion: Completion<Arc<dyn BlockDispatcher>>) {
    let base = match open_base(config) {
        Ok(base) => base,
        Err(e) => return completion(Err(e)),
    };

    let mode = config.mode;
    let path = config.path.clone();
    let detect_base = base.clone();
    let with_format: Completion<ImageFormat> = Box::new(move |result| {
        let format = match result {
            Ok(format) => format,
            Err(e) => return completion(Err(e)),
        };
        info!("Opening {:?} as {} ({})", path, format, mode);
        match format {
            ImageFormat::Raw => completion(apply_mode(base, mode)),
            ImageFormat::Qcow2 => QcowBlockDispatcher::create(
                base,
                Box::new(move |result| match result {
                    Ok(qcow) => completion(apply_mode(Arc::new(qcow), mode)),
                    Err(e) => {
                        error!("Failed to load qcow2 image {:?}: {}", path, e);
                        completion(Err(e))
                    }
                }),
            ),
        }
    });

    match config.format {
        Some(format) => with_format(Ok(format)),
        None => detect_image_format(detect_base.as_ref(), with_format),
    }
}

fn apply_mode(
    disk: Arc<dyn BlockDispatcher>,
    mode: BlockMode,
) -> Result<Arc<dyn BlockDispatcher>> {
    match mode {
        BlockMode::VolatileWrite => Ok(Arc::new(VolatileWriteBlockDispatcher::new(disk)?)),
        BlockMode::ReadOnly | BlockMode::ReadWrite => Ok(disk),
    }
}
