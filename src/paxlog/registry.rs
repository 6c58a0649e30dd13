//! The crate `registry` defines the topic registry, the shared metadata
//! replicated by a group.

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

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::listener::Listener;
use crate::types::{MembershipChange, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryCommand {
    CreateTopic { name: String, partitions: u32 },
    DeleteTopic { name: String },
    /// A linearized read of all topics and members.
    ListTopics { read_id: u64 },
    Join { node_id: u64 },
    Leave { node_id: u64 },
    /// Fills a sequence abandoned by its proposer.
    Noop,
}

impl Value for RegistryCommand {
    fn noop() -> Self {
        RegistryCommand::Noop
    }

    fn is_noop(&self) -> bool {
        matches!(self, RegistryCommand::Noop)
    }

    fn query_id(&self) -> Option<u64> {
        match self {
            RegistryCommand::ListTopics { read_id } => Some(*read_id),
            _ => None,
        }
    }

    fn membership(&self) -> Option<MembershipChange> {
        match self {
            RegistryCommand::Join { node_id } => Some(MembershipChange::Join(*node_id)),
            RegistryCommand::Leave { node_id } => Some(MembershipChange::Leave(*node_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub partitions: u32,
    /// The sequence of the command which created this topic.
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryView {
    pub topics: Vec<Topic>,
    pub members: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: BTreeMap<String, Topic>,
    members: BTreeSet<u64>,
    applied: u64,
}

impl TopicRegistry {
    pub fn new() -> TopicRegistry {
        TopicRegistry::default()
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn num_topics(&self) -> usize {
        self.topics.len()
    }

    pub fn members(&self) -> Vec<u64> {
        self.members.iter().cloned().collect()
    }
}

impl Listener<RegistryCommand> for TopicRegistry {
    type View = RegistryView;

    fn receive(&mut self, sequence: u64, command: &RegistryCommand) -> Result<(), Error> {
        if sequence <= self.applied {
            return Err(Error::Inconsistent {
                expected: self.applied + 1,
                actual: sequence,
            });
        }
        self.applied = sequence;

        match command {
            RegistryCommand::CreateTopic { name, partitions } => {
                if self.topics.contains_key(name) {
                    warn!("seq {} create topic {}, which already exists", sequence, name);
                    return Ok(());
                }
                debug!(
                    "seq {} create topic {} with {} partitions",
                    sequence, name, partitions
                );
                self.topics.insert(
                    name.clone(),
                    Topic {
                        name: name.clone(),
                        partitions: *partitions,
                        created_at: sequence,
                    },
                );
            }
            RegistryCommand::DeleteTopic { name } => {
                if self.topics.remove(name).is_none() {
                    warn!("seq {} delete topic {}, which not exists", sequence, name);
                }
            }
            RegistryCommand::Join { node_id } => {
                self.members.insert(*node_id);
            }
            RegistryCommand::Leave { node_id } => {
                self.members.remove(node_id);
            }
            RegistryCommand::Noop => {}
            RegistryCommand::ListTopics { read_id } => {
                return Err(Error::Listener(format!(
                    "query {} is applied as a mutation",
                    read_id
                )));
            }
        }
        Ok(())
    }

    fn map(&self, query: &RegistryCommand, view: &mut RegistryView) -> Result<(), Error> {
        match query {
            RegistryCommand::ListTopics { .. } => {
                view.topics = self.topics.values().cloned().collect();
                view.members = self.members();
                Ok(())
            }
            _ => Err(Error::Listener(format!("{:?} isn't a query", query))),
        }
    }

    fn highest_sequence(&self) -> u64 {
        self.applied
    }
}
