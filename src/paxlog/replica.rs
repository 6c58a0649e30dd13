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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::executor::block_on;
use log::{debug, error, info, warn};

use crate::error::Error;
use crate::future::ReadFuture;
use crate::group::{Group, Node, ReadResult};
use crate::linear::LinearSequence;
use crate::listener::Listener;
use crate::storage::PersistentLog;
use crate::transport::Transport;
use crate::types::{Message, Value};

fn lock<T, P, L>(group: &Mutex<Group<T, P, L>>) -> MutexGuard<'_, Group<T, P, L>>
where
    T: Value,
    P: PersistentLog<T>,
    L: Listener<T>,
{
    group.lock().unwrap_or_else(|e| e.into_inner())
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// A thread-safe handle of a group, which drives the group with a dedicated
/// completion loop.
///
/// The blocking waits never hold the lock of the group, they are woken up by
/// the watermarks advanced in the completion loop.
pub struct Replica<T, P, L>
where
    T: Value,
    P: PersistentLog<T> + Send + 'static,
    L: Listener<T> + Send + 'static,
    L::View: Send + 'static,
{
    id: u64,
    group: Arc<Mutex<Group<T, P, L>>>,
    decided: Arc<LinearSequence>,
    journaled: Arc<LinearSequence>,
    transport: Arc<dyn Transport<T>>,

    stopped: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<(), Error>>>,
}

impl<T, P, L> Replica<T, P, L>
where
    T: Value,
    P: PersistentLog<T> + Send + 'static,
    L: Listener<T> + Send + 'static,
    L::View: Send + 'static,
{
    /// Start the completion loop of `group`, which receives messages from
    /// `inbox` and sends messages through `transport`.
    pub fn spawn(
        group: Group<T, P, L>,
        inbox: Receiver<Message<T>>,
        transport: Arc<dyn Transport<T>>,
    ) -> Replica<T, P, L> {
        let id = group.id();
        let interval = Duration::from_millis(group.option().tick_interval_ms);
        let decided = group.decided_sequence();
        let journaled = group.journaled_sequence();
        let group = Arc::new(Mutex::new(group));
        let stopped = Arc::new(AtomicBool::new(false));

        let handle = {
            let group = group.clone();
            let transport = transport.clone();
            let stopped = stopped.clone();
            thread::spawn(move || {
                info!("node {} completion loop is started", id);
                let result = run_completion_loop(&group, &inbox, &*transport, &stopped, interval);
                stopped.store(true, Ordering::Release);
                match &result {
                    Ok(()) => info!("node {} completion loop is stopped", id),
                    Err(e) => error!("node {} completion loop exits: {}", id, e),
                }
                result
            })
        };

        Replica {
            id,
            group,
            decided,
            journaled,
            transport,
            stopped,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.is_stopped() {
            Err(Error::Stopped)
        } else {
            Ok(())
        }
    }

    /// Run `f` with the group locked.
    pub fn inspect<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Group<T, P, L>) -> R,
    {
        f(&lock(&self.group))
    }

    pub fn add_node(&self, id: u64) -> Node {
        lock(&self.group).add_node(id)
    }

    pub fn remove_node(&self, id: u64) -> Option<Node> {
        lock(&self.group).remove_node(id)
    }

    /// Propose `value` under a freshly allocated sequence, returns the
    /// sequence.
    pub fn propose(&self, value: T) -> Result<u64, Error> {
        self.check_running()?;
        let (sequence, msgs) = {
            let mut group = lock(&self.group);
            let sequence = group.create_instance().sequence();
            let msgs = group.propose(sequence, value)?;
            (sequence, msgs)
        };
        self.transport.send(msgs);
        Ok(sequence)
    }

    /// Propose `value` until it is decided by some sequence, a value displaced
    /// by a foreign one is proposed again under a new sequence. Returns
    /// `None` if the value isn't decided before `timeout`.
    pub fn propose_until_decided(&self, value: T, timeout: Duration) -> Result<Option<u64>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let sequence = self.propose(value.clone())?;
            if !self.decided.wait_for_added_timeout(sequence, remaining(deadline)) {
                warn!(
                    "node {} seq {} isn't decided before deadline, abandon it",
                    self.id, sequence
                );
                lock(&self.group).abandon(sequence).ok();
                return Ok(None);
            }

            let mut group = lock(&self.group);
            if group.decided_value(sequence).as_ref() == Some(&value) {
                return Ok(Some(sequence));
            }
            group.forget_displaced(&value);
            drop(group);
            debug!(
                "node {} seq {} is taken by others, propose again",
                self.id, sequence
            );
            self.check_running()?;
        }
    }

    /// Propose the query `value` and wait for the view it maps. Returns
    /// `None` if the query isn't applied before `timeout`.
    pub fn query(&self, value: T, timeout: Duration) -> Result<Option<L::View>, Error> {
        let id = match value.query_id() {
            Some(id) => id,
            None => return Err(Error::Listener(format!("{:?} isn't a query", value))),
        };

        let deadline = Instant::now() + timeout;
        let future = self.read_value(id);
        let applied = match self.propose_until_decided(value, timeout)? {
            Some(sequence) => self.wait_for_journaled_timeout(sequence, remaining(deadline)),
            None => false,
        };
        if !applied {
            self.clear_value(id);
            return Ok(None);
        }
        block_on(future).map(Some)
    }

    pub fn read_value(&self, id: u64) -> ReadFuture<ReadResult<L::View>> {
        lock(&self.group).read_value(id)
    }

    pub fn clear_value(&self, id: u64) {
        lock(&self.group).clear_value(id)
    }

    pub fn abandon(&self, sequence: u64) -> Result<(), Error> {
        lock(&self.group).abandon(sequence)
    }

    pub fn take_displaced(&self) -> Vec<T> {
        lock(&self.group).take_displaced()
    }

    pub fn wait_for_journaled(&self, sequence: u64) {
        self.journaled.wait_for_upper_bound(sequence);
    }

    pub fn wait_for_journaled_timeout(&self, sequence: u64, timeout: Duration) -> bool {
        self.journaled.wait_for_upper_bound_timeout(sequence, timeout)
    }

    pub fn wait_for_decided(&self, sequence: u64) {
        self.decided.wait_for_added(sequence);
    }

    pub fn wait_for_decided_timeout(&self, sequence: u64, timeout: Duration) -> bool {
        self.decided.wait_for_added_timeout(sequence, timeout)
    }

    /// Stop the completion loop and wait until it exits, returns the error
    /// which stopped the loop, if any.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.stopped.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(Err(Error::Stopped)),
            None => Ok(()),
        }
    }
}

impl<T, P, L> Drop for Replica<T, P, L>
where
    T: Value,
    P: PersistentLog<T> + Send + 'static,
    L: Listener<T> + Send + 'static,
    L::View: Send + 'static,
{
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("node {} shutdown: {}", self.id, e);
        }
    }
}

fn run_completion_loop<T, P, L>(
    group: &Mutex<Group<T, P, L>>,
    inbox: &Receiver<Message<T>>,
    transport: &dyn Transport<T>,
    stopped: &AtomicBool,
    interval: Duration,
) -> Result<(), Error>
where
    T: Value,
    P: PersistentLog<T>,
    L: Listener<T>,
{
    while !stopped.load(Ordering::Acquire) {
        let mut msgs = match inbox.recv_timeout(interval) {
            Ok(msg) => vec![msg],
            Err(RecvTimeoutError::Timeout) => vec![],
            Err(RecvTimeoutError::Disconnected) => break,
        };
        msgs.extend(inbox.try_iter());

        let outputs = {
            let mut group = lock(group);
            let mut outputs = Vec::new();
            for msg in msgs {
                let sequence = msg.sequence;
                match group.receive(sequence, vec![msg]) {
                    Ok(replies) => outputs.extend(replies),
                    Err(Error::InvalidMessage(reason)) => {
                        warn!("node {} drop invalid message: {}", group.id(), reason);
                    }
                    Err(e) => return Err(e),
                }
            }
            outputs.extend(group.tick(Utc::now())?);
            outputs
        };
        if !outputs.is_empty() {
            transport.send(outputs);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use crate::group::GroupOption;
    use crate::listener::MemListener;
    use crate::registry::{RegistryCommand, TopicRegistry};
    use crate::storage::MemLog;
    use crate::testing::setup_logger;
    use crate::transport::LocalNetwork;

    const WAIT: Duration = Duration::from_secs(10);

    fn fast_option() -> GroupOption {
        GroupOption {
            round_timeout_ms: 20,
            learn_timeout_ms: 50,
            tick_interval_ms: 5,
            ..GroupOption::default()
        }
    }

    fn start<T, L, F>(
        ids: &[u64],
        net: &Arc<LocalNetwork<T>>,
        new_listener: F,
    ) -> Vec<Replica<T, MemLog<T>, L>>
    where
        T: Value,
        L: Listener<T> + Send + 'static,
        L::View: Send + 'static,
        F: Fn() -> L,
    {
        setup_logger();
        ids.iter()
            .map(|id| {
                let mut group =
                    Group::new(*id, fast_option(), MemLog::new(), new_listener()).unwrap();
                for member in ids {
                    group.add_node(*member);
                }
                let inbox = net.register(*id);
                let transport: Arc<dyn Transport<T>> = net.clone();
                Replica::spawn(group, inbox, transport)
            })
            .collect()
    }

    fn values(r: &Replica<String, MemLog<String>, MemListener<String>>) -> Vec<String> {
        r.inspect(|g| g.listener().values().into_iter().cloned().collect())
    }

    #[test]
    fn replicate_hello() {
        let net = Arc::new(LocalNetwork::<String>::new());
        let mut replicas = start(&[0, 1, 2], &net, MemListener::<String>::new);

        let sequence = replicas[0]
            .propose_until_decided("hello".to_owned(), WAIT)
            .unwrap();
        assert_eq!(sequence, Some(1));
        for r in &replicas {
            assert!(r.wait_for_journaled_timeout(1, WAIT));
            assert!(r.wait_for_decided_timeout(1, WAIT));
            assert_eq!(values(r), vec!["hello".to_owned()]);
        }

        for r in &mut replicas {
            r.shutdown().unwrap();
            assert!(r.is_stopped());
            assert!(matches!(r.propose("x".to_owned()), Err(Error::Stopped)));
        }
    }

    #[test]
    fn isolated_replica_catches_up() {
        let net = Arc::new(LocalNetwork::<String>::new());
        let replicas = start(&[0, 1, 2], &net, MemListener::<String>::new);

        net.isolate(2);
        let s1 = replicas[0].propose_until_decided("a".to_owned(), WAIT).unwrap();
        assert_eq!(s1, Some(1));
        assert!(replicas[1].wait_for_journaled_timeout(1, WAIT));
        assert!(!replicas[2].wait_for_journaled_timeout(1, Duration::from_millis(100)));

        net.recover(2);
        let s2 = replicas[1].propose_until_decided("b".to_owned(), WAIT).unwrap();
        assert_eq!(s2, Some(2));
        for r in &replicas {
            assert!(r.wait_for_journaled_timeout(2, WAIT));
            assert_eq!(values(r), vec!["a".to_owned(), "b".to_owned()]);
        }
    }

    #[test]
    fn concurrent_proposers_agree() {
        let net = Arc::new(LocalNetwork::<String>::new());
        let replicas = Arc::new(start(&[0, 1, 2], &net, MemListener::<String>::new));

        let handles = (0..3)
            .map(|i| {
                let replicas = replicas.clone();
                thread::spawn(move || {
                    for n in 0..5 {
                        let value = format!("{}-{}", i, n);
                        let sequence = replicas[i].propose_until_decided(value, WAIT).unwrap();
                        assert!(sequence.is_some());
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        for r in replicas.iter() {
            assert!(r.wait_for_journaled_timeout(15, WAIT));
        }
        let expected = values(&replicas[0]);
        assert_eq!(expected.len(), 15);
        assert_eq!(expected.iter().collect::<HashSet<_>>().len(), 15);
        for r in replicas.iter() {
            assert_eq!(values(r), expected);
            assert!(r.take_displaced().is_empty());
        }
    }

    #[test]
    fn query_registry() {
        let net = Arc::new(LocalNetwork::<RegistryCommand>::new());
        let replicas = start(&[0, 1, 2], &net, TopicRegistry::new);

        let create = RegistryCommand::CreateTopic {
            name: "orders".to_owned(),
            partitions: 4,
        };
        assert!(replicas[0]
            .propose_until_decided(create, WAIT)
            .unwrap()
            .is_some());

        let view = replicas[2]
            .query(RegistryCommand::ListTopics { read_id: 1 }, WAIT)
            .unwrap()
            .unwrap();
        assert_eq!(view.topics.len(), 1);
        assert_eq!(view.topics[0].partitions, 4);

        let not_query = RegistryCommand::DeleteTopic {
            name: "orders".to_owned(),
        };
        assert!(replicas[2].query(not_query, WAIT).is_err());
    }
}
