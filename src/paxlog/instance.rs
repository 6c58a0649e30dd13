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

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, trace, warn};
use rand::{thread_rng, RngCore};

use crate::error::Error;
use crate::round::{Adoption, Round};
use crate::types::*;

/// Randomly generate the round timeout between `[base, 2 * base]`.
#[inline(always)]
fn generate_round_timeout(base_ms: u64) -> Duration {
    let base_ms = std::cmp::max(base_ms, 1);
    let jitter = thread_rng().next_u64() % (base_ms + 1);
    Duration::milliseconds((base_ms + jitter) as i64)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// This node created the instance and proposes a value on it.
    Proposer,
    /// The instance is created by a remote message or a gap of the log.
    Acceptor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No value proposed yet, or the proposer gave up retrying.
    Idle,
    Preparing,
    Accepting,
}

/// One slot of the log.
#[derive(Debug)]
pub struct Instance<T> {
    local_id: u64,
    sequence: u64,
    targets: BTreeSet<u64>,
    role: Role,

    // proposer states
    phase: Phase,
    round: Round<T>,
    proposal: ProposalId,
    /// The highest proposal reported by rejections.
    max_rejected: Option<ProposalId>,
    value: Option<T>,
    proposing: Option<T>,
    abandoned: bool,
    /// Drives the instance on behalf of a silent proposer.
    recovering: bool,
    learn_sent: bool,

    // acceptor states
    promised: Option<ProposalId>,
    accepted: Option<AcceptedValue<T>>,

    decided: Option<T>,

    round_timeout_ms: u64,
    timeout: Duration,
    last_active_at: DateTime<Utc>,
}

impl<T: Value> Instance<T> {
    pub fn new(
        local_id: u64,
        sequence: u64,
        targets: BTreeSet<u64>,
        role: Role,
        round_timeout_ms: u64,
        now: DateTime<Utc>,
    ) -> Instance<T> {
        debug!(
            "node {} seq {} setup instance as {}, targets {:?}",
            local_id, sequence, role, targets
        );
        let n_nodes = targets.len();
        Instance {
            local_id,
            sequence,
            targets,
            role,
            phase: Phase::Idle,
            round: Round::new(sequence, n_nodes),
            proposal: ProposalId::fast(local_id),
            max_rejected: None,
            value: None,
            proposing: None,
            abandoned: false,
            recovering: false,
            learn_sent: false,
            promised: None,
            accepted: None,
            decided: None,
            round_timeout_ms,
            timeout: generate_round_timeout(round_timeout_ms),
            last_active_at: now,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn targets(&self) -> &BTreeSet<u64> {
        &self.targets
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn proposal(&self) -> ProposalId {
        self.proposal
    }

    pub fn round_number(&self) -> u64 {
        self.round.number()
    }

    /// The value this node proposed on the instance.
    pub fn own_value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn decided(&self) -> Option<&T> {
        self.decided.as_ref()
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Is this node running a round of the instance?
    pub fn is_driving(&self) -> bool {
        !self.is_decided()
            && self.phase != Phase::Idle
            && (self.recovering || (self.role == Role::Proposer && !self.abandoned))
    }

    pub fn take_own_value(&mut self) -> Option<T> {
        self.value.take()
    }

    fn bcast(&self, detail: MsgDetail<T>) -> Vec<Message<T>> {
        self.targets
            .iter()
            .map(|to| Message::new(self.local_id, *to, self.sequence, detail.clone()))
            .collect()
    }

    fn bcast_remotes(&self, detail: MsgDetail<T>) -> Vec<Message<T>> {
        self.targets
            .iter()
            .filter(|to| **to != self.local_id)
            .map(|to| Message::new(self.local_id, *to, self.sequence, detail.clone()))
            .collect()
    }

    fn reply(&self, to: u64, detail: MsgDetail<T>) -> Message<T> {
        Message::new(self.local_id, to, self.sequence, detail)
    }

    fn decided_reply(&self, to: u64) -> Option<Message<T>> {
        self.decided
            .as_ref()
            .map(|v| self.reply(to, MsgDetail::Decided(DecidedMsg { value: v.clone() })))
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active_at = now;
        self.timeout = generate_round_timeout(self.round_timeout_ms);
    }

    /// The highest proposal this node knows as an acceptor.
    fn highest_known(&self) -> Option<ProposalId> {
        let accepted = self.accepted.as_ref().map(|a| a.proposal);
        std::cmp::max(self.promised, accepted)
    }

    fn is_from_target(&self, from: u64, detail: &MsgDetail<T>) -> bool {
        if self.targets.contains(&from) {
            true
        } else {
            warn!(
                "node {} seq {} ignore {} from {}, which not in targets {:?}",
                self.local_id, self.sequence, detail, from, self.targets
            );
            false
        }
    }

    /// Start proposing `value` with the optimistic accept, the prepare phase
    /// is skipped.
    pub fn propose(&mut self, value: T, now: DateTime<Utc>) -> Result<Vec<Message<T>>, Error> {
        if self.role != Role::Proposer {
            return Err(Error::NotProposer(self.sequence));
        }
        if self.is_decided() {
            return Err(Error::AlreadyDecided(self.sequence));
        }
        if self.value.is_some() || self.recovering {
            return Err(Error::AlreadyProposed(self.sequence));
        }

        debug!(
            "node {} seq {} propose value with fast proposal {}",
            self.local_id, self.sequence, self.proposal
        );
        self.value = Some(value.clone());
        self.proposing = Some(value.clone());
        self.phase = Phase::Accepting;
        self.touch(now);
        Ok(self.bcast(MsgDetail::Accept(AcceptMsg {
            proposal: self.proposal,
            value,
        })))
    }

    /// Escalate the proposal and restart from the prepare phase.
    pub fn prepare(&mut self, now: DateTime<Utc>) -> Vec<Message<T>> {
        self.proposal = self.proposal.escalate(self.local_id, self.max_rejected);
        let round = self.round.next_round();
        self.phase = Phase::Preparing;
        self.proposing = None;
        self.touch(now);
        info!(
            "node {} seq {} enter round {} with proposal {}",
            self.local_id, self.sequence, round, self.proposal
        );
        self.bcast(MsgDetail::Prepare(PrepareMsg {
            proposal: self.proposal,
        }))
    }

    /// Run a round for an instance nobody drives. The value reported by the
    /// promises is adopted, otherwise a noop is proposed.
    fn recover(&mut self, now: DateTime<Utc>) -> Vec<Message<T>> {
        info!(
            "node {} seq {} no proposer drives the instance, start recovery",
            self.local_id, self.sequence
        );
        self.recovering = true;
        self.max_rejected = std::cmp::max(self.max_rejected, self.highest_known());
        self.prepare(now)
    }

    /// Stop retrying the proposal, the instance still votes as an acceptor.
    /// The sequence is filled by a recovery round if nobody decides it.
    pub fn abandon(&mut self) {
        if self.role == Role::Proposer && !self.abandoned {
            info!("node {} seq {} abandon proposing", self.local_id, self.sequence);
            self.abandoned = true;
            self.phase = Phase::Idle;
        }
    }

    /// Remote activity postpones the recovery of an instance this node
    /// doesn't drive.
    fn observe_remote(&mut self, now: DateTime<Utc>) {
        if !self.is_driving() {
            self.last_active_at = now;
        }
    }

    pub fn handle_prepare(
        &mut self,
        from: u64,
        msg: PrepareMsg,
        now: DateTime<Utc>,
    ) -> Message<T> {
        if let Some(reply) = self.decided_reply(from) {
            return reply;
        }

        // A duplicated prepare of the promised proposal is promised again.
        let granted = self.promised.map(|h| h <= msg.proposal).unwrap_or(true);
        if granted {
            self.promised = Some(msg.proposal);
            self.observe_remote(now);
            trace!(
                "node {} seq {} promise {} to {}",
                self.local_id,
                self.sequence,
                msg.proposal,
                from
            );
            self.reply(
                from,
                MsgDetail::Promise(PromiseMsg {
                    proposal: msg.proposal,
                    accepted: self.accepted.clone(),
                }),
            )
        } else {
            self.reject(from, msg.proposal)
        }
    }

    pub fn handle_accept(
        &mut self,
        from: u64,
        msg: AcceptMsg<T>,
        now: DateTime<Utc>,
    ) -> Message<T> {
        if let Some(reply) = self.decided_reply(from) {
            return reply;
        }

        let not_promised_higher = self.promised.map(|h| h <= msg.proposal).unwrap_or(true);
        let granted = if msg.proposal.is_fast() {
            // The fast round has no prepare phase, so an acceptor takes only
            // the first fast value it sees.
            match &self.accepted {
                Some(a) => {
                    a.proposal == msg.proposal && a.value == msg.value && not_promised_higher
                }
                None => self.promised.is_none(),
            }
        } else {
            // A proposal carries only one value.
            match &self.accepted {
                Some(a) if a.proposal == msg.proposal => {
                    a.value == msg.value && not_promised_higher
                }
                _ => not_promised_higher,
            }
        };

        if granted {
            trace!(
                "node {} seq {} accept {} from {}",
                self.local_id,
                self.sequence,
                msg.proposal,
                from
            );
            self.promised = Some(msg.proposal);
            self.observe_remote(now);
            self.accepted = Some(AcceptedValue {
                proposal: msg.proposal,
                value: msg.value,
            });
            self.reply(
                from,
                MsgDetail::Accepted(AcceptedMsg {
                    proposal: msg.proposal,
                }),
            )
        } else {
            self.reject(from, msg.proposal)
        }
    }

    fn reject(&self, to: u64, proposal: ProposalId) -> Message<T> {
        let promised = self.highest_known().unwrap_or(proposal);
        debug!(
            "node {} seq {} reject {} from {}, highest known {}",
            self.local_id, self.sequence, proposal, to, promised
        );
        self.reply(to, MsgDetail::Reject(RejectMsg { proposal, promised }))
    }

    pub fn handle_learn(&self, from: u64) -> Option<Message<T>> {
        self.decided_reply(from)
    }

    fn is_current_proposal(&self, proposal: ProposalId, phase: Phase) -> bool {
        self.is_driving() && self.phase == phase && self.proposal == proposal
    }

    pub fn handle_promise(
        &mut self,
        from: u64,
        msg: PromiseMsg<T>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message<T>>, Error> {
        if !self.is_current_proposal(msg.proposal, Phase::Preparing) {
            trace!(
                "node {} seq {} ignore staled promise {} from {}",
                self.local_id,
                self.sequence,
                msg.proposal,
                from
            );
            return Ok(vec![]);
        }
        if !self.is_from_target(from, &MsgDetail::Promise(msg.clone())) {
            return Ok(vec![]);
        }

        if !self.round.add_promise(from, msg.accepted)? || !self.round.is_promise_quorum() {
            return Ok(vec![]);
        }

        Ok(self.send_accept(now, false))
    }

    /// Send the accept once the promise quorum is reached. Unchosen fast
    /// values are settled only after all targets promised, or after the
    /// round timed out if `settle` is set.
    fn send_accept(&mut self, now: DateTime<Utc>, settle: bool) -> Vec<Message<T>> {
        let value = match self.round.adoption() {
            Adoption::Free if self.recovering => T::noop(),
            Adoption::Free => match &self.value {
                Some(v) => v.clone(),
                None => return vec![],
            },
            Adoption::Adopt(v) => {
                if self.value.as_ref() != Some(&v) {
                    debug!(
                        "node {} seq {} adopt value reported by promises",
                        self.local_id, self.sequence
                    );
                }
                v
            }
            Adoption::Unchosen(v) => {
                if !settle && !self.round.is_all_promised() {
                    trace!(
                        "node {} seq {} no fast value chosen, wait for remaining promises",
                        self.local_id,
                        self.sequence
                    );
                    return vec![];
                }
                v
            }
        };

        debug!(
            "node {} seq {} receive promise quorum of {}, send accept",
            self.local_id, self.sequence, self.proposal
        );
        self.phase = Phase::Accepting;
        self.proposing = Some(value.clone());
        self.touch(now);
        self.bcast(MsgDetail::Accept(AcceptMsg {
            proposal: self.proposal,
            value,
        }))
    }

    /// Returns the decided value if the accept quorum is reached.
    pub fn handle_accepted(
        &mut self,
        from: u64,
        msg: AcceptedMsg,
        now: DateTime<Utc>,
    ) -> Result<Option<T>, Error> {
        if !self.is_current_proposal(msg.proposal, Phase::Accepting) {
            return Ok(None);
        }
        if !self.is_from_target(from, &MsgDetail::Accepted(msg.clone())) {
            return Ok(None);
        }
        if !self.round.add_accepted(from)? {
            return Ok(None);
        }
        self.last_active_at = now;
        let reached = if self.proposal.is_fast() {
            self.round.is_fast_quorum()
        } else {
            self.round.is_accept_quorum()
        };
        if !reached {
            return Ok(None);
        }

        let value = match self.proposing.clone() {
            Some(v) => v,
            None => return Ok(None),
        };
        info!(
            "node {} seq {} decided by accept quorum of proposal {}",
            self.local_id, self.sequence, self.proposal
        );
        self.decided = Some(value.clone());
        self.phase = Phase::Idle;
        Ok(Some(value))
    }

    /// Returns the messages which should be sent after the rejection.
    pub fn handle_reject(
        &mut self,
        from: u64,
        msg: RejectMsg,
        now: DateTime<Utc>,
    ) -> Vec<Message<T>> {
        if self.max_rejected.map(|p| p < msg.promised).unwrap_or(true) {
            self.max_rejected = Some(msg.promised);
        }

        let phase = self.phase;
        if phase == Phase::Idle || !self.is_current_proposal(msg.proposal, phase) {
            return vec![];
        }

        debug!(
            "node {} seq {} proposal {} rejected by {}, which promised {}",
            self.local_id, self.sequence, msg.proposal, from, msg.promised
        );
        self.prepare(now)
    }

    /// Adopt the decided value. Returns false if the value is already known.
    pub fn handle_decided(&mut self, value: T) -> Result<bool, Error> {
        match &self.decided {
            Some(v) if *v == value => Ok(false),
            Some(_) => Err(Error::DecisionConflict(self.sequence)),
            None => {
                info!(
                    "node {} seq {} learn decided value as {}",
                    self.local_id, self.sequence, self.role
                );
                self.decided = Some(value);
                self.phase = Phase::Idle;
                Ok(true)
            }
        }
    }

    /// The messages which should be sent to decided followers.
    pub fn bcast_decided(&self) -> Vec<Message<T>> {
        match &self.decided {
            Some(v) => self.bcast_remotes(MsgDetail::Decided(DecidedMsg { value: v.clone() })),
            None => vec![],
        }
    }

    /// Ask remotes for the decided value.
    pub fn bcast_learn(&mut self, now: DateTime<Utc>) -> Vec<Message<T>> {
        self.last_active_at = now;
        self.learn_sent = true;
        self.bcast_remotes(MsgDetail::Learn)
    }

    /// A driving instance retries its round after the round timeout. Others
    /// try to learn the accepted value first, then recover the instance once
    /// it stays silent for `learn_timeout` plus the round timeout.
    pub fn tick(&mut self, now: DateTime<Utc>, learn_timeout: Duration) -> Vec<Message<T>> {
        if self.is_decided() {
            return vec![];
        }

        let elapsed = now.signed_duration_since(self.last_active_at);
        if self.is_driving() {
            if elapsed < self.timeout {
                return vec![];
            }
            debug!(
                "node {} seq {} round {} timeout without quorum",
                self.local_id,
                self.sequence,
                self.round.number()
            );
            if self.phase == Phase::Preparing && self.round.is_promise_quorum() {
                let msgs = self.send_accept(now, true);
                if !msgs.is_empty() {
                    return msgs;
                }
            }
            return self.prepare(now);
        }

        if self.accepted.is_some() && !self.learn_sent && elapsed >= learn_timeout {
            trace!(
                "node {} seq {} accepted but not decided, try learn",
                self.local_id,
                self.sequence
            );
            return self.bcast_learn(now);
        }
        if elapsed >= learn_timeout + self.timeout {
            return self.recover(now);
        }
        vec![]
    }
}
