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

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, trace, warn};
use serde::Deserialize;

use crate::constant::*;
use crate::error::Error;
use crate::future::{create_promise, ReadFuture, ReadPromise};
use crate::instance::{Instance, Role};
use crate::linear::LinearSequence;
use crate::listener::Listener;
use crate::storage::PersistentLog;
use crate::types::*;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GroupOption {
    /// Specify the base timeout of a round, so an instance will randomly
    /// choose a value between [`round_timeout_ms`, `2 * round_timeout_ms`]
    /// as the timeout of each round. If a round hasn't reached quorum when
    /// the timeout is elapsed, the proposer escalates its proposal and
    /// prepares again.
    ///
    /// default: 200
    pub round_timeout_ms: u64,

    /// Specify how long an accepted but undecided instance, or a gap below
    /// the highest decided sequence, could stay before the node asks the
    /// others for the decided value. An instance still undecided after
    /// another round timeout is recovered by this node.
    ///
    /// default: 400
    pub learn_timeout_ms: u64,

    /// Specify the interval of ticks issued by the completion loop.
    ///
    /// default: 20
    pub tick_interval_ms: u64,

    /// Specify the limit of number of values applied by each call.
    ///
    /// default: 1024
    pub max_apply_batch: usize,
}

impl Default for GroupOption {
    fn default() -> GroupOption {
        GroupOption {
            round_timeout_ms: DEFAULT_ROUND_TIMEOUT_MS,
            learn_timeout_ms: DEFAULT_LEARN_TIMEOUT_MS,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_apply_batch: DEFAULT_MAX_APPLY_BATCH,
        }
    }
}

impl GroupOption {
    /// Load the option from a toml document, absent fields use the default.
    pub fn from_toml(content: &str) -> Result<GroupOption, Error> {
        let option: GroupOption = toml::from_str(content)?;
        option.validate()?;
        Ok(option)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.round_timeout_ms == 0 {
            return Err(Error::Config("round_timeout_ms must be positive".to_owned()));
        }
        if self.learn_timeout_ms == 0 {
            return Err(Error::Config("learn_timeout_ms must be positive".to_owned()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::Config("tick_interval_ms must be positive".to_owned()));
        }
        if self.max_apply_batch == 0 {
            return Err(Error::Config("max_apply_batch must be positive".to_owned()));
        }
        Ok(())
    }
}

/// A member of the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u64,
    pub joined_at: DateTime<Utc>,
}

pub type ReadResult<V> = Result<V, Error>;

/// `Group` owns all instances of the local node, and drives them by the
/// messages received and the ticks issued.
///
/// Decided values are written to the `PersistentLog` and applied to the
/// `Listener` strictly in sequence order, no matter in which order the
/// instances are decided.
pub struct Group<T, P, L>
where
    T: Value,
    P: PersistentLog<T>,
    L: Listener<T>,
{
    id: u64,
    option: GroupOption,

    nodes: BTreeMap<u64, Node>,
    instances: BTreeMap<u64, Instance<T>>,
    next_sequence: u64,

    // Fed once a sequence is decided, in any order.
    decided: Arc<LinearSequence>,
    // Fed once a sequence is written and applied, in order.
    journaled: Arc<LinearSequence>,
    stalled_since: Option<(u64, DateTime<Utc>)>,

    log: P,
    listener: L,

    displaced: Vec<T>,

    local_queries: HashSet<u64>,
    pending_reads: HashMap<u64, ReadPromise<ReadResult<L::View>>>,
    read_results: HashMap<u64, ReadResult<L::View>>,
}

impl<T, P, L> Group<T, P, L>
where
    T: Value,
    P: PersistentLog<T>,
    L: Listener<T>,
{
    /// Create a group, the values in `log` which the listener hasn't received
    /// yet are replayed.
    pub fn new(id: u64, option: GroupOption, log: P, listener: L) -> Result<Self, Error> {
        option.validate()?;

        let highest = log.highest_sequence();
        let applied = listener.highest_sequence();
        if applied > highest {
            error!(
                "node {} listener applied sequence {} is ahead of log {}",
                id, applied, highest
            );
            return Err(Error::Inconsistent {
                expected: highest,
                actual: applied,
            });
        }

        let mut g = Group {
            id,
            option,
            nodes: BTreeMap::new(),
            instances: BTreeMap::new(),
            next_sequence: highest + 1,
            decided: Arc::new(LinearSequence::new(highest)),
            journaled: Arc::new(LinearSequence::new(highest)),
            stalled_since: None,
            log,
            listener,
            displaced: Vec::new(),
            local_queries: HashSet::new(),
            pending_reads: HashMap::new(),
            read_results: HashMap::new(),
        };
        g.replay(applied)?;
        Ok(g)
    }

    fn replay(&mut self, applied: u64) -> Result<(), Error> {
        let highest = self.log.highest_sequence();
        info!(
            "node {} replay log until {}, listener applied {}",
            self.id, highest, applied
        );
        for sequence in (INVALID_SEQUENCE + 1)..=highest {
            let value = self.log.get(sequence)?;
            if let Some(change) = value.membership() {
                self.apply_membership(change);
            }
            if sequence > applied && value.query_id().is_none() && !value.is_noop() {
                self.listener.receive(sequence, &value)?;
            }
        }
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn option(&self) -> &GroupOption {
        &self.option
    }

    pub fn add_node(&mut self, id: u64) -> Node {
        let local_id = self.id;
        self.nodes
            .entry(id)
            .or_insert_with(|| {
                info!("node {} add node {} to membership", local_id, id);
                Node {
                    id,
                    joined_at: Utc::now(),
                }
            })
            .clone()
    }

    pub fn remove_node(&mut self, id: u64) -> Option<Node> {
        let node = self.nodes.remove(&id);
        if node.is_some() {
            info!("node {} remove node {} from membership", self.id, id);
        }
        node
    }

    pub fn node(&self, id: u64) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_ids(&self) -> Vec<u64> {
        self.nodes.keys().cloned().collect()
    }

    fn apply_membership(&mut self, change: MembershipChange) {
        match change {
            MembershipChange::Join(id) => {
                self.add_node(id);
            }
            MembershipChange::Leave(id) => {
                self.remove_node(id);
            }
        }
    }

    fn allocate_sequence(&mut self) -> u64 {
        let mut sequence = std::cmp::max(self.next_sequence, self.decided.highest() + 1);
        if let Some(last) = self.instances.keys().next_back() {
            sequence = std::cmp::max(sequence, last + 1);
        }
        self.next_sequence = sequence + 1;
        sequence
    }

    /// Allocate the next sequence and setup an instance as the proposer on
    /// it, the targets of the instance are the current members.
    pub fn create_instance(&mut self) -> &Instance<T> {
        let sequence = self.allocate_sequence();
        let targets = self.nodes.keys().cloned().collect::<BTreeSet<_>>();
        let instance = Instance::new(
            self.id,
            sequence,
            targets,
            Role::Proposer,
            self.option.round_timeout_ms,
            Utc::now(),
        );
        self.instances.entry(sequence).or_insert(instance)
    }

    pub fn instance(&self, sequence: u64) -> Option<&Instance<T>> {
        self.instances.get(&sequence)
    }

    /// Start proposing `value` on an instance created by `create_instance()`.
    pub fn propose(&mut self, sequence: u64, value: T) -> Result<Vec<Message<T>>, Error> {
        let query_id = value.query_id();
        let instance = self
            .instances
            .get_mut(&sequence)
            .ok_or(Error::UnknownInstance(sequence))?;
        let msgs = instance.propose(value, Utc::now())?;
        if let Some(id) = query_id {
            self.local_queries.insert(id);
        }
        Ok(msgs)
    }

    /// Stop retrying the proposal of `sequence`.
    pub fn abandon(&mut self, sequence: u64) -> Result<(), Error> {
        self.instances
            .get_mut(&sequence)
            .ok_or(Error::UnknownInstance(sequence))?
            .abandon();
        Ok(())
    }

    /// Take the values proposed by this node but displaced by a foreign
    /// value.
    pub fn take_displaced(&mut self) -> Vec<T> {
        std::mem::take(&mut self.displaced)
    }

    /// Remove one displaced value equals to `value`, returns false if there
    /// is no such value.
    pub fn forget_displaced(&mut self, value: &T) -> bool {
        match self.displaced.iter().position(|v| v == value) {
            Some(index) => {
                self.displaced.remove(index);
                true
            }
            None => false,
        }
    }

    fn check_messages(&self, sequence: u64, msgs: &[Message<T>]) -> Result<(), Error> {
        if sequence == INVALID_SEQUENCE {
            return Err(Error::InvalidMessage("invalid sequence".to_owned()));
        }
        for msg in msgs {
            if msg.sequence != sequence {
                return Err(Error::InvalidMessage(format!(
                    "message {} of sequence {} is received as sequence {}",
                    msg.detail, msg.sequence, sequence
                )));
            }
            if msg.from == INVALID_NODE_ID {
                return Err(Error::InvalidMessage(format!(
                    "message {} from invalid node",
                    msg.detail
                )));
            }
            if msg.to != self.id {
                return Err(Error::InvalidMessage(format!(
                    "message {} to node {} is received by node {}",
                    msg.detail, msg.to, self.id
                )));
            }
        }
        Ok(())
    }

    /// Receive messages of `sequence`, returns the messages should be sent.
    pub fn receive(
        &mut self,
        sequence: u64,
        msgs: Vec<Message<T>>,
    ) -> Result<Vec<Message<T>>, Error> {
        self.check_messages(sequence, &msgs)?;

        let now = Utc::now();
        let mut outputs = Vec::new();
        for msg in msgs {
            trace!(
                "node {} seq {} receive {} from {}",
                self.id,
                sequence,
                msg.detail,
                msg.from
            );
            self.step(msg, now, &mut outputs)?;
        }
        self.advance()?;
        Ok(outputs)
    }

    fn is_journaled(&self, sequence: u64) -> bool {
        sequence <= self.journaled.upper_bound()
    }

    fn step(
        &mut self,
        msg: Message<T>,
        now: DateTime<Utc>,
        outputs: &mut Vec<Message<T>>,
    ) -> Result<(), Error> {
        let Message {
            from,
            sequence,
            detail,
            ..
        } = msg;
        if self.is_journaled(sequence) {
            return self.step_journaled(from, sequence, detail, outputs);
        }

        if !self.instances.contains_key(&sequence) {
            match &detail {
                MsgDetail::Prepare(_) | MsgDetail::Accept(_) | MsgDetail::Decided(_) => {
                    let targets = self.nodes.keys().cloned().collect::<BTreeSet<_>>();
                    let instance = Instance::new(
                        self.id,
                        sequence,
                        targets,
                        Role::Acceptor,
                        self.option.round_timeout_ms,
                        now,
                    );
                    self.instances.insert(sequence, instance);
                }
                _ => {
                    trace!(
                        "node {} seq {} ignore {} from {}, no such instance",
                        self.id,
                        sequence,
                        detail,
                        from
                    );
                    return Ok(());
                }
            }
        }

        let local_id = self.id;
        let instance = match self.instances.get_mut(&sequence) {
            Some(instance) => instance,
            None => return Ok(()),
        };
        let mut decided = false;
        match detail {
            MsgDetail::Prepare(m) => outputs.push(instance.handle_prepare(from, m, now)),
            MsgDetail::Accept(m) => outputs.push(instance.handle_accept(from, m, now)),
            MsgDetail::Promise(m) => outputs.extend(instance.handle_promise(from, m, now)?),
            MsgDetail::Accepted(m) => {
                if instance.handle_accepted(from, m, now)?.is_some() {
                    outputs.extend(instance.bcast_decided());
                    decided = true;
                }
            }
            MsgDetail::Reject(m) => outputs.extend(instance.handle_reject(from, m, now)),
            MsgDetail::Decided(m) => {
                decided = instance.handle_decided(m.value).map_err(|e| {
                    error!(
                        "node {} seq {} receive conflicted decided value from {}",
                        local_id, sequence, from
                    );
                    e
                })?;
            }
            MsgDetail::Learn => outputs.extend(instance.handle_learn(from)),
        }

        if decided {
            self.on_decided(sequence);
        }
        Ok(())
    }

    /// The instance of `sequence` is released, answers with the logged value.
    fn step_journaled(
        &mut self,
        from: u64,
        sequence: u64,
        detail: MsgDetail<T>,
        outputs: &mut Vec<Message<T>>,
    ) -> Result<(), Error> {
        match detail {
            MsgDetail::Prepare(_) | MsgDetail::Accept(_) | MsgDetail::Learn => {
                let value = self.log.get(sequence)?;
                outputs.push(Message::new(
                    self.id,
                    from,
                    sequence,
                    MsgDetail::Decided(DecidedMsg { value }),
                ));
            }
            MsgDetail::Decided(m) => {
                if self.log.get(sequence)? != m.value {
                    error!(
                        "node {} seq {} receive decided value from {} which differs from log",
                        self.id, sequence, from
                    );
                    return Err(Error::DecisionConflict(sequence));
                }
            }
            _ => {
                trace!(
                    "node {} seq {} ignore {} from {}, already journaled",
                    self.id,
                    sequence,
                    detail,
                    from
                );
            }
        }
        Ok(())
    }

    fn on_decided(&mut self, sequence: u64) {
        self.decided.add(sequence);

        let instance = match self.instances.get_mut(&sequence) {
            Some(instance) => instance,
            None => return,
        };
        if instance.role() != Role::Proposer {
            return;
        }
        let displaced = match (instance.own_value(), instance.decided()) {
            (Some(own), Some(decided)) => own != decided,
            _ => false,
        };
        if displaced {
            if let Some(value) = instance.take_own_value() {
                warn!(
                    "node {} seq {} is decided by a foreign value, own value is displaced",
                    self.id, sequence
                );
                self.displaced.push(value);
            }
        }
    }

    /// Write and apply the decided values which are contiguous with the
    /// journaled ones. Returns the number of values applied.
    fn advance(&mut self) -> Result<usize, Error> {
        let mut n_applied = 0;
        while n_applied < self.option.max_apply_batch {
            let sequence = self.journaled.upper_bound() + 1;
            let value = match self.instances.get(&sequence).and_then(|i| i.decided()) {
                Some(value) => value.clone(),
                None => break,
            };

            if let Err(e) = self.log.write(sequence, &value) {
                error!(
                    "node {} seq {} write decided value: {}",
                    self.id, sequence, e
                );
                return Err(e);
            }
            self.instances.remove(&sequence);

            let applied = self.apply(sequence, &value);
            self.journaled.add(sequence);
            if let Err(e) = applied {
                error!("node {} seq {} apply decided value: {}", self.id, sequence, e);
                return Err(e);
            }
            debug!("node {} seq {} is journaled", self.id, sequence);
            n_applied += 1;
        }
        Ok(n_applied)
    }

    fn apply(&mut self, sequence: u64, value: &T) -> Result<(), Error> {
        if value.is_noop() {
            debug!("node {} seq {} skip noop", self.id, sequence);
            return Ok(());
        }
        if let Some(change) = value.membership() {
            self.apply_membership(change);
        }
        match value.query_id() {
            Some(id) => {
                self.finish_read(id, value);
                Ok(())
            }
            None => self.listener.receive(sequence, value),
        }
    }

    fn finish_read(&mut self, id: u64, query: &T) {
        let promise = self.pending_reads.remove(&id);
        let is_local = self.local_queries.remove(&id);
        if promise.is_none() && !is_local {
            return;
        }

        let mut view = L::View::default();
        let result = self.listener.map(query, &mut view).map(|()| view);
        match promise {
            Some(promise) => promise.finish(result),
            None => {
                self.read_results.insert(id, result);
            }
        }
    }

    /// Returns a future resolved with the view mapped by the query `id`, once
    /// the query is applied.
    pub fn read_value(&mut self, id: u64) -> ReadFuture<ReadResult<L::View>> {
        let (future, promise) = create_promise();
        match self.read_results.remove(&id) {
            Some(result) => promise.finish(result),
            None => {
                if let Some(staled) = self.pending_reads.insert(id, promise) {
                    staled.finish(Err(Error::ReadCancelled(id)));
                }
            }
        }
        future
    }

    /// Forget the query `id`, a pending read is resolved with
    /// `Error::ReadCancelled`.
    pub fn clear_value(&mut self, id: u64) {
        if let Some(promise) = self.pending_reads.remove(&id) {
            promise.finish(Err(Error::ReadCancelled(id)));
        }
        self.read_results.remove(&id);
        self.local_queries.remove(&id);
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<Vec<Message<T>>, Error> {
        let learn_timeout = Duration::milliseconds(self.option.learn_timeout_ms as i64);
        let mut outputs = Vec::new();
        for instance in self.instances.values_mut() {
            outputs.extend(instance.tick(now, learn_timeout));
        }
        outputs.extend(self.learn_gaps(now, learn_timeout));
        self.advance()?;
        Ok(outputs)
    }

    /// Setup instances for the sequences which block the journaled watermark
    /// and ask the others for them. An instance which learns nothing is
    /// recovered by its own tick.
    fn learn_gaps(&mut self, now: DateTime<Utc>, learn_timeout: Duration) -> Vec<Message<T>> {
        let upper = self.journaled.upper_bound();
        let highest = self.decided.highest();
        if highest <= upper {
            self.stalled_since = None;
            return vec![];
        }

        let since = match self.stalled_since {
            Some((stalled, since)) if stalled == upper => since,
            _ => {
                self.stalled_since = Some((upper, now));
                return vec![];
            }
        };
        if now.signed_duration_since(since) < learn_timeout {
            return vec![];
        }
        self.stalled_since = Some((upper, now));

        // The highest one is decided, so the gaps end before it.
        let end = std::cmp::min(highest - 1, upper + self.option.max_apply_batch as u64);
        let targets = self.nodes.keys().cloned().collect::<BTreeSet<_>>();
        let mut outputs = Vec::new();
        for sequence in (upper + 1)..=end {
            if self.decided.contains(sequence) || self.instances.contains_key(&sequence) {
                continue;
            }
            debug!(
                "node {} seq {} blocks decided {}, try learn",
                self.id, sequence, highest
            );
            let mut instance = Instance::new(
                self.id,
                sequence,
                targets.clone(),
                Role::Acceptor,
                self.option.round_timeout_ms,
                now,
            );
            outputs.extend(instance.bcast_learn(now));
            self.instances.insert(sequence, instance);
        }
        outputs
    }

    /// Block until all sequences up to `sequence` are journaled.
    pub fn wait_for_journaled(&self, sequence: u64) {
        self.journaled.wait_for_upper_bound(sequence);
    }

    pub fn journaled_sequence(&self) -> Arc<LinearSequence> {
        self.journaled.clone()
    }

    pub fn decided_sequence(&self) -> Arc<LinearSequence> {
        self.decided.clone()
    }

    /// The decided value of `sequence`, if known.
    pub fn decided_value(&self, sequence: u64) -> Option<T> {
        if self.is_journaled(sequence) {
            return self.log.get(sequence).ok();
        }
        self.instances
            .get(&sequence)
            .and_then(|i| i.decided())
            .cloned()
    }

    pub fn log(&self) -> &P {
        &self.log
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }
}
