//! # paxlog
//!
//! `paxlog` is a Paxos instance engine for small replicated logs. Each
//! sequence of the log is decided by an independent Paxos instance, so
//! several sequences could be decided concurrently.
//!
//! A proposer starts at the fast round, which sends the value to all members
//! without the prepare phase. Once the fast round collides, the proposer
//! escalates to the classic rounds and adopts the value chosen by the
//! promises it received. A sequence which nobody drives anymore is recovered
//! by any member, and filled with a noop if no value was accepted on it.
//!
//! Decided values are persisted in sequence order and then applied to a
//! [`Listener`]. A query value is logged like a mutation, but its result is
//! only mapped from the listener state, which gives a linearizable read.
//!
//! The [`Group`] is a single-threaded engine driven by messages and ticks,
//! the [`Replica`] wraps it with a completion loop and blocking waits.

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

extern crate chrono;
extern crate futures;
extern crate log;
extern crate rand;
extern crate serde;
extern crate thiserror;
extern crate toml;

mod error;
mod future;
mod round;

#[cfg(test)]
mod testing;

pub mod constant;
pub mod group;
pub mod instance;
pub mod linear;
pub mod listener;
pub mod registry;
pub mod replica;
pub mod storage;
pub mod transport;
pub mod types;

pub use crate::error::Error;
pub use crate::future::{ReadFuture, ReadPromise};
pub use crate::group::{Group, GroupOption, Node, ReadResult};
pub use crate::instance::{Instance, Phase, Role};
pub use crate::linear::LinearSequence;
pub use crate::listener::{Listener, MemListener};
pub use crate::registry::{RegistryCommand, RegistryView, Topic, TopicRegistry};
pub use crate::replica::Replica;
pub use crate::round::{fast_quorum, majority, Adoption};
pub use crate::storage::{FileLog, MemLog, PersistentLog};
pub use crate::transport::{LocalNetwork, Transport};
pub use crate::types::*;
