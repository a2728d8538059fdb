// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::buffer::IoBuffer;
use crate::{check_range, BlockDispatcher, Completion, Error};

/// In-memory dispatcher completing inline and counting the I/O it serves.
pub struct MemDispatcher {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
}

impl MemDispatcher {
    pub fn new(size: u64) -> Self {
        Self::from_vec(vec![0u8; size as usize])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemDispatcher {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDispatcher for MemDispatcher {
    fn capacity(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn sync(&self, completion: Completion) {
        completion(Ok(()))
    }

    fn read_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return completion(Err(Error::HostRead(io::Error::from(
                io::ErrorKind::UnexpectedEof,
            ))));
        }
        let data = self.data.lock().unwrap();
        if let Err(e) = check_range(offset, buf.len() as u64, data.len() as u64) {
            drop(data);
            return completion(Err(e));
        }
        let offset = offset as usize;
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        drop(data);
        completion(Ok(()))
    }

    fn write_at(&self, buf: IoBuffer, offset: u64, completion: Completion) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock().unwrap();
        if let Err(e) = check_range(offset, buf.len() as u64, data.len() as u64) {
            drop(data);
            return completion(Err(e));
        }
        let offset = offset as usize;
        buf.with(|src| data[offset..offset + src.len()].copy_from_slice(src));
        drop(data);
        completion(Ok(()))
    }
}
