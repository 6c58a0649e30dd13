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

use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// A log write targets a sequence which isn't exactly one past the
    /// highest sequence of the log.
    #[error("inconsistent log write: expect sequence {expected}, but got {actual}")]
    Inconsistent { expected: u64, actual: u64 },

    #[error("sequence {0} not found")]
    NotFound(u64),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("instance of sequence {0} not exists")]
    UnknownInstance(u64),

    /// Only the node who created the instance could propose on it.
    #[error("I am not the proposer of sequence {0}")]
    NotProposer(u64),

    #[error("sequence {0} already decided")]
    AlreadyDecided(u64),

    #[error("sequence {0} already has a proposed value")]
    AlreadyProposed(u64),

    /// A round received more votes than the nodes it was created with.
    #[error("round of sequence {sequence} overflow by vote of node {node_id}")]
    RoundOverflow { sequence: u64, node_id: u64 },

    /// Two different values are decided for the same sequence.
    #[error("sequence {0} is decided with a different value")]
    DecisionConflict(u64),

    #[error("listener rejects value: {0}")]
    Listener(String),

    #[error("read request {0} is cancelled")]
    ReadCancelled(u64),

    #[error("broken io request")]
    Io(Arc<std::io::Error>),

    #[error("codec: {0}")]
    Codec(String),

    #[error("invalid config: {0}")]
    Config(String),

    /// The completion loop of the replica already exited.
    #[error("replica is stopped")]
    Stopped,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Error {
        Error::Codec(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Error {
        Error::Config(err.to_string())
    }
}
