// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

//! Aggregation of sub-operations into a single completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Completion, Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks a fixed number of outstanding parts of one operation.
///
/// The completion of the whole operation fires once, when the last part
/// reports, carrying the first error any part reported.
pub struct IoGuard {
    pending: AtomicUsize,
    first_error: Mutex<Option<Error>>,
    completion: Mutex<Option<Completion>>,
}

impl IoGuard {
    /// Creates a guard waiting for `parts` completions.
    ///
    /// With zero parts there is nothing to wait for and `completion` fires
    /// before this returns.
    pub fn new(parts: usize, completion: Completion) -> Arc<Self> {
        let guard = Arc::new(IoGuard {
            pending: AtomicUsize::new(parts),
            first_error: Mutex::new(None),
            completion: Mutex::new(Some(completion)),
        });
        if parts == 0 {
            guard.finish();
        }
        guard
    }

    /// Records the outcome of one part.
    pub fn complete(&self, result: Result<()>) {
        if let Err(e) = result {
            let mut first_error = lock(&self.first_error);
            if first_error.is_none() {
                *first_error = Some(e);
            } else {
                debug!("Dropping subsequent error: {}", e);
            }
        }

        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.finish(),
            Ok(_) => {}
            Err(_) => warn!("I/O part completed after its operation finished"),
        }
    }

    /// Records a part that was never issued because an earlier part failed.
    pub fn skip(&self) {
        self.complete(Ok(()))
    }

    /// Whether any part reported an error so far.
    pub fn has_failed(&self) -> bool {
        lock(&self.first_error).is_some()
    }

    /// Returns a completion reporting one part to this guard.
    pub fn part(self: &Arc<Self>) -> Completion {
        let guard = self.clone();
        Box::new(move |result| guard.complete(result))
    }

    fn finish(&self) {
        let result = match lock(&self.first_error).take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        // Run the completion without holding any lock, it may issue more I/O.
        let completion = lock(&self.completion).take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}
