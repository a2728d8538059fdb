// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Host file served by a pool of worker threads.

use std::fs::File;
use std::io;
use std::sync::Arc;
use std::thread;

use flume::Sender;

use crate::buffer::IoBuffer;
use crate::host_file::{HostCompletion, HostFile, HostOp};

/// A host file whose operations are queued to worker threads.
///
/// Completions run on the worker that served the operation. Dropping the
/// pool closes the queue; workers still serve what was queued before they
/// exit, so no completion is lost.
pub struct PooledFile {
    file: Arc<File>,
    sender: Sender<HostOp>,
}

impl PooledFile {
    pub fn new(file: File, threads: usize) -> io::Result<Self> {
        let file = Arc::new(file);
        let (sender, receiver) = flume::unbounded::<HostOp>();

        for i in 0..threads {
            let file = file.clone();
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("disk_io{i}"))
                .spawn(move || {
                    for op in receiver.iter() {
                        op.run(&file);
                    }
                    debug!("Disk I/O worker exiting");
                })?;
        }

        Ok(PooledFile { file, sender })
    }

    fn submit(&self, op: HostOp) {
        if let Err(e) = self.sender.send(op) {
            error!("Failed to queue host file operation: no worker running");
            e.into_inner()
                .fail(io::Error::new(io::ErrorKind::BrokenPipe, "no disk I/O worker"));
        }
    }
}

impl HostFile for PooledFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion) {
        self.submit(HostOp::Read {
            buf,
            offset,
            completion,
        })
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion) {
        self.submit(HostOp::Write {
            buf,
            offset,
            completion,
        })
    }

    fn sync(&self, completion: HostCompletion<()>) {
        self.submit(HostOp::Sync { completion })
    }

    fn mappable_file(&self) -> Option<File> {
        self.file.try_clone().ok()
    }
}
