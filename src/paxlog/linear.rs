//! The crate `linear` tracks the contiguous watermark of a set of sequences
//! which arrive in any order.

// Copyright 2021 The paxlog Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug)]
struct Watermark {
    lower_bound: u64,
    upper_bound: u64,

    // Values arrived ahead of `upper_bound`, never contains a value less than
    // or equals to `upper_bound`.
    disjoint: BTreeSet<u64>,
}

impl Watermark {
    fn contains(&self, n: u64) -> bool {
        n <= self.upper_bound || self.disjoint.contains(&n)
    }
}

/// `LinearSequence` records sequences and exposes the highest sequence `n`
/// such that every sequence in `(lower_bound, n]` was recorded.
///
/// Waiters are woken up by `add()`, so the blocking queries never poll.
#[derive(Debug)]
pub struct LinearSequence {
    inner: Mutex<Watermark>,
    cond: Condvar,
}

impl LinearSequence {
    pub fn new(lower_bound: u64) -> LinearSequence {
        LinearSequence {
            inner: Mutex::new(Watermark {
                lower_bound,
                upper_bound: lower_bound,
                disjoint: BTreeSet::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Watermark> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `n`, returns true if the upper bound is advanced.
    pub fn add(&self, n: u64) -> bool {
        let mut w = self.lock();
        if w.contains(n) {
            return false;
        }

        let advanced = if w.upper_bound + 1 == n {
            w.upper_bound = n;
            loop {
                let next = w.upper_bound + 1;
                if !w.disjoint.remove(&next) {
                    break;
                }
                w.upper_bound = next;
            }
            true
        } else {
            w.disjoint.insert(n);
            false
        };
        drop(w);

        self.cond.notify_all();
        advanced
    }

    pub fn upper_bound(&self) -> u64 {
        self.lock().upper_bound
    }

    pub fn lower_bound(&self) -> u64 {
        self.lock().lower_bound
    }

    /// The number of recorded sequences which are not connected to the upper
    /// bound yet.
    pub fn n_disjoint(&self) -> usize {
        self.lock().disjoint.len()
    }

    /// The highest sequence recorded, contiguous or not.
    pub fn highest(&self) -> u64 {
        let w = self.lock();
        w.disjoint.iter().next_back().cloned().unwrap_or(w.upper_bound)
    }

    pub fn contains(&self, n: u64) -> bool {
        self.lock().contains(n)
    }

    /// Block until `n` is recorded.
    pub fn wait_for_added(&self, n: u64) {
        let w = self.lock();
        let _w = self
            .cond
            .wait_while(w, |w| !w.contains(n))
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Like `wait_for_added()`, but gives up after `timeout`. Returns whether
    /// `n` is recorded.
    pub fn wait_for_added_timeout(&self, n: u64, timeout: Duration) -> bool {
        let w = self.lock();
        let (w, _) = self
            .cond
            .wait_timeout_while(w, timeout, |w| !w.contains(n))
            .unwrap_or_else(|e| e.into_inner());
        w.contains(n)
    }

    /// Block until the upper bound reaches at least `n`.
    pub fn wait_for_upper_bound(&self, n: u64) {
        let w = self.lock();
        let _w = self
            .cond
            .wait_while(w, |w| w.upper_bound < n)
            .unwrap_or_else(|e| e.into_inner());
    }

    /// Like `wait_for_upper_bound()`, but gives up after `timeout`. Returns
    /// whether the upper bound reaches `n`.
    pub fn wait_for_upper_bound_timeout(&self, n: u64, timeout: Duration) -> bool {
        let w = self.lock();
        let (w, _) = self
            .cond
            .wait_timeout_while(w, timeout, |w| w.upper_bound < n)
            .unwrap_or_else(|e| e.into_inner());
        w.upper_bound >= n
    }
}
