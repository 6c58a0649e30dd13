//! The crate `constant` defines a set constant used by paxlog.

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

/// A special value is used to mark illegal or invalid id of node.
pub const INVALID_NODE_ID: u64 = std::u64::MAX;

/// A special value is used to mark invalid sequence, any valid sequence will
/// large than zero.
pub const INVALID_SEQUENCE: u64 = 0;

/// The proposal counter reserved for the optimistic accept which skips the
/// prepare phase. Every escalated round uses a counter above it.
pub const FAST_ROUND_COUNTER: u64 = 0;

/// The number of the first round of each instance.
pub const INITIAL_ROUND: u64 = 0;

pub const DEFAULT_ROUND_TIMEOUT_MS: u64 = 200;
pub const DEFAULT_LEARN_TIMEOUT_MS: u64 = 400;
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 20;
pub const DEFAULT_MAX_APPLY_BATCH: usize = 1024;

/// Is the counter reserved for the optimistic accept?
pub fn is_fast_counter(counter: u64) -> bool {
    counter == FAST_ROUND_COUNTER
}
