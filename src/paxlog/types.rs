//! The crate `types` defines a set types used by paxlog.

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

use serde::{Deserialize, Serialize};

use crate::constant::*;

/// The identifier used to order competing proposals of a sequence.
///
/// A higher `counter` always wins, if `counter` is equal, the higher
/// `node_id` wins. The field order matters: the derived `Ord` compares
/// `counter` first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProposalId {
    counter: u64,
    node_id: u64,
}

impl ProposalId {
    pub fn new(node_id: u64, counter: u64) -> ProposalId {
        ProposalId { counter, node_id }
    }

    /// The proposal used by the optimistic accept of `node_id`.
    pub fn fast(node_id: u64) -> ProposalId {
        ProposalId::new(node_id, FAST_ROUND_COUNTER)
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn is_fast(&self) -> bool {
        is_fast_counter(self.counter)
    }

    /// Returns the smallest proposal of `node_id` which is strictly greater
    /// than both `self` and `other`, and never a fast one.
    pub fn escalate(&self, node_id: u64, other: Option<ProposalId>) -> ProposalId {
        let counter = other
            .map(|o| std::cmp::max(o.counter, self.counter))
            .unwrap_or(self.counter);
        ProposalId::new(node_id, counter + 1)
    }
}

impl std::fmt::Display for ProposalId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.counter, self.node_id)
    }
}

/// A value accepted by an acceptor, together with the proposal under which it
/// was accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptedValue<T> {
    pub proposal: ProposalId,
    pub value: T,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum MembershipChange {
    Join(u64),
    Leave(u64),
}

/// The values which could be decided by a group.
///
/// A value might be a linearized read (`query_id()` returns the id of the
/// read request), or a membership change which is applied to the node table
/// once the value is applied.
///
/// `noop()` fills a sequence which no proposer drives anymore. It is logged
/// but never passed to the listener.
pub trait Value: Clone + PartialEq + std::fmt::Debug + Send + 'static {
    fn noop() -> Self;

    fn is_noop(&self) -> bool;

    fn query_id(&self) -> Option<u64> {
        None
    }

    fn membership(&self) -> Option<MembershipChange> {
        None
    }
}

impl Value for String {
    fn noop() -> Self {
        String::new()
    }

    fn is_noop(&self) -> bool {
        self.is_empty()
    }
}

impl Value for Vec<u8> {
    fn noop() -> Self {
        Vec::new()
    }

    fn is_noop(&self) -> bool {
        self.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareMsg {
    pub proposal: ProposalId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromiseMsg<T> {
    pub proposal: ProposalId,
    /// The value accepted before this promise, if any.
    pub accepted: Option<AcceptedValue<T>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptMsg<T> {
    pub proposal: ProposalId,
    pub value: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedMsg {
    pub proposal: ProposalId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMsg {
    /// The rejected proposal.
    pub proposal: ProposalId,
    /// The highest proposal known by the rejecting node.
    pub promised: ProposalId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecidedMsg<T> {
    pub value: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MsgDetail<T> {
    Prepare(PrepareMsg),
    Promise(PromiseMsg<T>),
    Accept(AcceptMsg<T>),
    Accepted(AcceptedMsg),
    Reject(RejectMsg),
    Decided(DecidedMsg<T>),
    /// Ask the receiver for the decided value of the sequence.
    Learn,
}

impl<T> std::fmt::Display for MsgDetail<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match &self {
            MsgDetail::Prepare(_) => "Prepare",
            MsgDetail::Promise(_) => "Promise",
            MsgDetail::Accept(_) => "Accept",
            MsgDetail::Accepted(_) => "Accepted",
            MsgDetail::Reject(_) => "Reject",
            MsgDetail::Decided(_) => "Decided",
            MsgDetail::Learn => "Learn",
        };
        write!(f, "{}", msg)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    pub from: u64,

    /// Who this message send to.
    pub to: u64,

    /// The sequence of the instance this message belongs to.
    pub sequence: u64,
    pub detail: MsgDetail<T>,
}

impl<T> Message<T> {
    pub fn new(from: u64, to: u64, sequence: u64, detail: MsgDetail<T>) -> Message<T> {
        Message {
            from,
            to,
            sequence,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_order_counter_first() {
        assert!(ProposalId::new(0, 2) > ProposalId::new(9, 1));
        assert!(ProposalId::new(3, 1) > ProposalId::new(2, 1));
        assert_eq!(ProposalId::new(3, 1), ProposalId::new(3, 1));
        assert!(ProposalId::fast(9) < ProposalId::new(0, 1));
    }

    #[test]
    fn proposal_total_order() {
        let mut ids = Vec::new();
        for node_id in 0..4 {
            for counter in 0..4 {
                ids.push(ProposalId::new(node_id, counter));
            }
        }
        for a in &ids {
            for b in &ids {
                let holds = [a < b, a == b, a > b];
                assert_eq!(holds.iter().filter(|v| **v).count(), 1, "{} vs {}", a, b);
                for c in &ids {
                    if a < b && b < c {
                        assert!(a < c);
                    }
                }
            }
        }
    }

    #[test]
    fn escalate_proposal() {
        let p = ProposalId::fast(1);
        let next = p.escalate(1, None);
        assert_eq!(next, ProposalId::new(1, 1));
        assert!(next > p);

        let rejected_by = ProposalId::new(2, 5);
        let next = next.escalate(1, Some(rejected_by));
        assert_eq!(next, ProposalId::new(1, 6));
        assert!(next > rejected_by);
    }

    #[test]
    fn message_serde() {
        let msg = Message::new(
            1,
            2,
            7,
            MsgDetail::Promise(PromiseMsg {
                proposal: ProposalId::new(1, 3),
                accepted: Some(AcceptedValue {
                    proposal: ProposalId::fast(2),
                    value: "hello".to_owned(),
                }),
            }),
        );
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: Message<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.sequence, 7);
        match decoded.detail {
            MsgDetail::Promise(p) => {
                assert_eq!(p.proposal, ProposalId::new(1, 3));
                assert_eq!(p.accepted.unwrap().value, "hello");
            }
            d => panic!("unexpected detail {}", d),
        }
    }
}
