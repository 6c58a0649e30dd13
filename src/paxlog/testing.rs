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

use std::collections::{BTreeMap, VecDeque};

use log::{Metadata, Record};

use crate::group::{Group, GroupOption};
use crate::listener::Listener;
use crate::storage::MemLog;
use crate::types::{Message, Value};

struct SimpleLogger;
impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        println!(
            "[{} - {} - {}:{}] {}",
            record.level(),
            record.target(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;
static SETUP_LOGGER: std::sync::Once = std::sync::Once::new();

pub fn setup_logger() {
    SETUP_LOGGER.call_once(|| {
        log::set_logger(&LOGGER)
            .map(|()| log::set_max_level(log::LevelFilter::Trace))
            .expect("init logger");
    });
}

const MAX_DELIVERIES: usize = 100_000;

/// Groups connected by a message queue, messages are delivered in FIFO order
/// by `run()`.
pub struct Cluster<T, L>
where
    T: Value,
    L: Listener<T>,
{
    groups: BTreeMap<u64, Group<T, MemLog<T>, L>>,
    queue: VecDeque<Message<T>>,
    duplicate: bool,
}

impl<T, L> Cluster<T, L>
where
    T: Value,
    L: Listener<T>,
{
    pub fn new() -> Self {
        setup_logger();
        Cluster {
            groups: BTreeMap::new(),
            queue: VecDeque::new(),
            duplicate: false,
        }
    }

    pub fn add_group(&mut self, id: u64, members: &[u64], listener: L) {
        let mut group = Group::new(id, GroupOption::default(), MemLog::new(), listener).unwrap();
        for member in members {
            group.add_node(*member);
        }
        self.groups.insert(id, group);
    }

    pub fn group(&self, id: u64) -> &Group<T, MemLog<T>, L> {
        self.groups.get(&id).unwrap()
    }

    pub fn group_mut(&mut self, id: u64) -> &mut Group<T, MemLog<T>, L> {
        self.groups.get_mut(&id).unwrap()
    }

    /// Deliver each message twice.
    pub fn set_duplicate(&mut self, duplicate: bool) {
        self.duplicate = duplicate;
    }

    pub fn send(&mut self, msgs: Vec<Message<T>>) {
        self.queue.extend(msgs);
    }

    /// Create an instance on node `id` and propose `value`, returns the
    /// sequence of the instance.
    pub fn propose(&mut self, id: u64, value: T) -> u64 {
        let group = self.group_mut(id);
        let sequence = group.create_instance().sequence();
        let msgs = group.propose(sequence, value).unwrap();
        self.send(msgs);
        sequence
    }

    pub fn run(&mut self) {
        self.run_with(|_| true);
    }

    /// Deliver messages until the queue is empty, the messages which `keep`
    /// returns false are dropped.
    pub fn run_with<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Message<T>) -> bool,
    {
        let mut deliveries = 0;
        while let Some(msg) = self.queue.pop_front() {
            deliveries += 1;
            assert!(deliveries < MAX_DELIVERIES, "messages never converge");
            if !keep(&msg) {
                continue;
            }
            let group = match self.groups.get_mut(&msg.to) {
                Some(group) => group,
                None => continue,
            };
            let sequence = msg.sequence;
            if self.duplicate {
                let outputs = group.receive(sequence, vec![msg.clone()]).unwrap();
                self.queue.extend(outputs);
            }
            let outputs = group.receive(sequence, vec![msg]).unwrap();
            self.queue.extend(outputs);
        }
    }
}
