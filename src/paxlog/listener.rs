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

use crate::constant::*;
use crate::error::Error;

/// The derived state of the decided values.
///
/// `receive()` is called once per sequence, strictly in sequence order, by
/// the apply path of a group.
pub trait Listener<T> {
    /// The result of a read-only query.
    type View: Default;

    fn receive(&mut self, sequence: u64, value: &T) -> Result<(), Error>;

    /// Answer a read-only query against the current state.
    fn map(&self, query: &T, view: &mut Self::View) -> Result<(), Error>;

    /// The highest sequence received, used to decide where the replay starts.
    fn highest_sequence(&self) -> u64;
}

/// A listener which remembers every value it receives.
#[derive(Debug, Clone)]
pub struct MemListener<T> {
    applied: Vec<(u64, T)>,
}

impl<T> MemListener<T> {
    pub fn new() -> MemListener<T> {
        MemListener {
            applied: Vec::new(),
        }
    }

    pub fn applied(&self) -> &[(u64, T)] {
        &self.applied
    }

    pub fn values(&self) -> Vec<&T> {
        self.applied.iter().map(|(_, v)| v).collect()
    }
}

impl<T> Default for MemListener<T> {
    fn default() -> Self {
        MemListener::new()
    }
}

impl<T: Clone> Listener<T> for MemListener<T> {
    /// All values applied so far.
    type View = Vec<T>;

    fn receive(&mut self, sequence: u64, value: &T) -> Result<(), Error> {
        let expected = self.highest_sequence() + 1;
        if sequence < expected {
            return Err(Error::Inconsistent {
                expected,
                actual: sequence,
            });
        }
        self.applied.push((sequence, value.clone()));
        Ok(())
    }

    fn map(&self, _query: &T, view: &mut Vec<T>) -> Result<(), Error> {
        view.extend(self.applied.iter().map(|(_, v)| v.clone()));
        Ok(())
    }

    fn highest_sequence(&self) -> u64 {
        self.applied
            .last()
            .map(|(s, _)| *s)
            .unwrap_or(INVALID_SEQUENCE)
    }
}
