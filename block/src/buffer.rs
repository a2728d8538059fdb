// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A shareable byte buffer handed down a dispatcher chain.
///
/// Cloning an `IoBuffer` or taking a [`IoBuffer::slice`] of it never copies:
/// all views share the same storage, so a layer can split a request into
/// sub-requests targeting disjoint windows of the caller's buffer and hand
/// them to I/O running on other threads.
#[derive(Clone)]
pub struct IoBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl IoBuffer {
    /// Creates a zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        IoBuffer {
            data: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a view of `len` bytes starting at `offset` within this view.
    ///
    /// # Panics
    ///
    /// Panics if the window does not fit within this view.
    pub fn slice(&self, offset: usize, len: usize) -> IoBuffer {
        assert!(
            offset
                .checked_add(len)
                .is_some_and(|end| end <= self.len),
            "slice {offset:#x}+{len:#x} exceeds buffer of {:#x} bytes",
            self.len
        );
        IoBuffer {
            data: self.data.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        // The storage holds plain bytes, a panicking holder cannot break it.
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.lock();
        f(&data[self.offset..self.offset + self.len])
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.lock();
        f(&mut data[self.offset..self.offset + self.len])
    }

    pub fn fill(&self, value: u8) {
        self.with_mut(|data| data.fill(value))
    }

    /// Copies `src` to the start of the view. `src` must not be longer than the view.
    pub fn copy_from_slice(&self, src: &[u8]) {
        self.with_mut(|data| data[..src.len()].copy_from_slice(src))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with(|data| data.to_vec())
    }
}

impl Debug for IoBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slices_share_storage() {
        let buf = IoBuffer::new(16);
        let tail = buf.slice(8, 8);
        tail.fill(0xab);
        buf.slice(0, 4).copy_from_slice(&[1, 2, 3, 4]);

        let data = buf.to_vec();
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
        assert_eq!(&data[4..8], &[0; 4]);
        assert!(data[8..].iter().all(|&b| b == 0xab));

        let nested = tail.slice(4, 2);
        nested.fill(0x11);
        assert_eq!(buf.to_vec()[12..14], [0x11, 0x11]);
    }

    #[test]
    #[should_panic]
    fn slice_out_of_bounds() {
        IoBuffer::new(8).slice(4, 8);
    }
}
