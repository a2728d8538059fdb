// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Positional access to the host file backing a disk.

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::fs::FileExt;

use crate::buffer::IoBuffer;

/// Callback receiving the outcome of a host file operation, the number of
/// bytes transferred for reads and writes.
pub type HostCompletion<T = usize> = Box<dyn FnOnce(io::Result<T>) + Send>;

/// A host file accessed at explicit offsets.
///
/// Operations never move a shared file cursor, so any number of them may be
/// outstanding on the same file at once.
pub trait HostFile: Send + Sync {
    fn size(&self) -> io::Result<u64>;
    fn read_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion);
    fn write_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion);
    fn sync(&self, completion: HostCompletion<()>);
    /// A handle suitable for mapping the file in memory, if supported.
    fn mappable_file(&self) -> Option<File> {
        None
    }
}

/// Reads into `data` until it is full or the end of the file is reached.
pub(crate) fn read_full_at(file: &File, data: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < data.len() {
        match file.read_at(&mut data[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

pub(crate) fn write_full_at(file: &File, data: &[u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < data.len() {
        match file.write_at(&data[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// A host file operation, run inline or handed to a worker.
pub(crate) enum HostOp {
    Read {
        buf: IoBuffer,
        offset: u64,
        completion: HostCompletion,
    },
    Write {
        buf: IoBuffer,
        offset: u64,
        completion: HostCompletion,
    },
    Sync {
        completion: HostCompletion<()>,
    },
}

impl HostOp {
    pub(crate) fn run(self, file: &File) {
        match self {
            HostOp::Read {
                buf,
                offset,
                completion,
            } => {
                // The buffer lock is not held across the syscall, other
                // windows of the same buffer may be in flight.
                let mut data = vec![0u8; buf.len()];
                let result = read_full_at(file, &mut data, offset).map(|n| {
                    buf.copy_from_slice(&data[..n]);
                    n
                });
                completion(result)
            }
            HostOp::Write {
                buf,
                offset,
                completion,
            } => {
                let data = buf.to_vec();
                completion(write_full_at(file, &data, offset))
            }
            HostOp::Sync { completion } => completion(file.sync_data()),
        }
    }

    /// Completes the operation with `error` without running it.
    pub(crate) fn fail(self, error: io::Error) {
        match self {
            HostOp::Read { completion, .. } | HostOp::Write { completion, .. } => {
                completion(Err(error))
            }
            HostOp::Sync { completion } => completion(Err(error)),
        }
    }
}
