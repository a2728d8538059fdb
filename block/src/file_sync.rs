// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fs::File;
use std::io;

use crate::buffer::IoBuffer;
use crate::host_file::{HostCompletion, HostFile, HostOp};

/// A host file whose operations run on the calling thread and complete
/// before they return.
pub struct SyncFile {
    file: File,
}

impl SyncFile {
    pub fn new(file: File) -> Self {
        SyncFile { file }
    }
}

impl HostFile for SyncFile {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion) {
        HostOp::Read {
            buf,
            offset,
            completion,
        }
        .run(&self.file)
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: HostCompletion) {
        HostOp::Write {
            buf,
            offset,
            completion,
        }
        .run(&self.file)
    }

    fn sync(&self, completion: HostCompletion<()>) {
        HostOp::Sync { completion }.run(&self.file)
    }

    fn mappable_file(&self) -> Option<File> {
        self.file.try_clone().ok()
    }
}
