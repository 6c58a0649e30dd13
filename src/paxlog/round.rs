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

use std::collections::HashSet;

use log::trace;

use crate::constant::*;
use crate::error::Error;
use crate::types::{AcceptedValue, ProposalId, Value};

#[inline(always)]
pub fn majority(len: usize) -> usize {
    len / 2 + 1
}

/// The number of acceptances a fast round needs to decide, the smallest `f`
/// with `2 * f > 2 * len - majority(len)`. Any promise quorum then holds a
/// majority of the votes of a value chosen by a fast round.
#[inline(always)]
pub fn fast_quorum(len: usize) -> usize {
    (2 * len - majority(len)) / 2 + 1
}

#[inline(always)]
fn is_quorum(votes: usize, n_nodes: usize) -> bool {
    votes * 2 > n_nodes
}

/// Which value a proposer must use after it collected a promise quorum.
#[derive(Debug, PartialEq)]
pub enum Adoption<T> {
    /// Nobody reported an accepted value, the proposer is free to use its own.
    Free,
    /// The reported value which might have been decided.
    Adopt(T),
    /// Only fast values are reported and none of them could have been chosen,
    /// carries the most reported one.
    Unchosen(T),
}

#[derive(Debug)]
struct FastReport<T> {
    value: T,
    proposal: ProposalId,
    count: usize,
}

/// The votes received by one proposal of an instance.
#[derive(Debug)]
pub struct Round<T> {
    sequence: u64,
    number: u64,
    n_nodes: usize,

    promised: HashSet<u64>,
    accepted: HashSet<u64>,

    /// The value of the highest proposal reported by promises.
    highest: Option<AcceptedValue<T>>,
    /// The distinct fast values reported by promises.
    fast_reports: Vec<FastReport<T>>,
}

impl<T: Value> Round<T> {
    pub fn new(sequence: u64, n_nodes: usize) -> Round<T> {
        Round {
            sequence,
            number: INITIAL_ROUND,
            n_nodes,
            promised: HashSet::new(),
            accepted: HashSet::new(),
            highest: None,
            fast_reports: Vec::new(),
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn num_promised(&self) -> usize {
        self.promised.len()
    }

    pub fn num_accepted(&self) -> usize {
        self.accepted.len()
    }

    fn check_overflow(&self, votes: &HashSet<u64>, node_id: u64) -> Result<(), Error> {
        if !votes.contains(&node_id) && votes.len() >= self.n_nodes {
            return Err(Error::RoundOverflow {
                sequence: self.sequence,
                node_id,
            });
        }
        Ok(())
    }

    /// Records the promise of `node_id` and the value it accepted before.
    /// Returns false if the promise was already recorded.
    pub fn add_promise(
        &mut self,
        node_id: u64,
        accepted: Option<AcceptedValue<T>>,
    ) -> Result<bool, Error> {
        self.check_overflow(&self.promised, node_id)?;
        if !self.promised.insert(node_id) {
            return Ok(false);
        }

        let accepted = match accepted {
            Some(a) => a,
            None => return Ok(true),
        };

        trace!(
            "seq {} round {} node {} reports accepted proposal {}",
            self.sequence,
            self.number,
            node_id,
            accepted.proposal
        );

        if accepted.proposal.is_fast() {
            match self
                .fast_reports
                .iter_mut()
                .find(|r| r.value == accepted.value)
            {
                Some(r) => {
                    r.count += 1;
                    r.proposal = std::cmp::max(r.proposal, accepted.proposal);
                }
                None => self.fast_reports.push(FastReport {
                    value: accepted.value.clone(),
                    proposal: accepted.proposal,
                    count: 1,
                }),
            }
        }

        let higher = self
            .highest
            .as_ref()
            .map(|h| h.proposal < accepted.proposal)
            .unwrap_or(true);
        if higher {
            self.highest = Some(accepted);
        }
        Ok(true)
    }

    /// Records the acceptance of `node_id`. Returns false if the acceptance
    /// was already recorded.
    pub fn add_accepted(&mut self, node_id: u64) -> Result<bool, Error> {
        self.check_overflow(&self.accepted, node_id)?;
        Ok(self.accepted.insert(node_id))
    }

    pub fn is_promise_quorum(&self) -> bool {
        is_quorum(self.promised.len(), self.n_nodes)
    }

    pub fn is_accept_quorum(&self) -> bool {
        is_quorum(self.accepted.len(), self.n_nodes)
    }

    pub fn is_all_promised(&self) -> bool {
        self.promised.len() >= self.n_nodes
    }

    pub fn is_fast_quorum(&self) -> bool {
        self.accepted.len() >= fast_quorum(self.n_nodes)
    }

    pub fn highest_proposal(&self) -> Option<ProposalId> {
        self.highest.as_ref().map(|h| h.proposal)
    }

    /// Decide which value is safe to propose with the promises collected so
    /// far.
    ///
    /// A value accepted by an escalated round always wins. A fast value is
    /// adopted if it could still have reached `fast_quorum` votes, at most one
    /// value could once the promise quorum is reached.
    pub fn adoption(&self) -> Adoption<T> {
        match &self.highest {
            None => return Adoption::Free,
            Some(h) if !h.proposal.is_fast() => return Adoption::Adopt(h.value.clone()),
            Some(_) => {}
        }

        let unheard = self.n_nodes.saturating_sub(self.promised.len());
        let quorum = fast_quorum(self.n_nodes);
        if let Some(r) = self
            .fast_reports
            .iter()
            .find(|r| r.count + unheard >= quorum)
        {
            return Adoption::Adopt(r.value.clone());
        }
        match self
            .fast_reports
            .iter()
            .max_by_key(|r| (r.count, r.proposal))
        {
            Some(r) => Adoption::Unchosen(r.value.clone()),
            None => Adoption::Free,
        }
    }

    /// Clear all votes and returns the number of the new round.
    pub fn next_round(&mut self) -> u64 {
        self.number += 1;
        self.promised.clear();
        self.accepted.clear();
        self.highest = None;
        self.fast_reports.clear();
        self.number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(node_id: u64, value: &str) -> Option<AcceptedValue<String>> {
        Some(AcceptedValue {
            proposal: ProposalId::fast(node_id),
            value: value.to_owned(),
        })
    }

    fn classic(node_id: u64, counter: u64, value: &str) -> Option<AcceptedValue<String>> {
        Some(AcceptedValue {
            proposal: ProposalId::new(node_id, counter),
            value: value.to_owned(),
        })
    }

    #[test]
    fn strict_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(fast_quorum(1), 1);
        assert_eq!(fast_quorum(3), 3);
        assert_eq!(fast_quorum(4), 3);
        assert_eq!(fast_quorum(5), 4);

        let mut r = Round::<String>::new(1, 4);
        r.add_accepted(1).unwrap();
        r.add_accepted(2).unwrap();
        assert!(!r.is_accept_quorum());
        r.add_accepted(3).unwrap();
        assert!(r.is_accept_quorum());
        assert!(r.is_fast_quorum());
        assert!(!r.is_promise_quorum());
    }

    #[test]
    fn duplicated_votes() {
        let mut r = Round::<String>::new(1, 3);
        assert!(r.add_promise(1, None).unwrap());
        assert!(!r.add_promise(1, fast(2, "b")).unwrap());
        assert_eq!(r.num_promised(), 1);
        assert_eq!(r.adoption(), Adoption::Free);

        assert!(r.add_accepted(2).unwrap());
        assert!(!r.add_accepted(2).unwrap());
        assert_eq!(r.num_accepted(), 1);
    }

    #[test]
    fn overflow() {
        let mut r = Round::<String>::new(7, 2);
        r.add_promise(1, None).unwrap();
        r.add_promise(2, None).unwrap();
        match r.add_promise(3, None) {
            Err(Error::RoundOverflow { sequence, node_id }) => {
                assert_eq!(sequence, 7);
                assert_eq!(node_id, 3);
            }
            v => panic!("unexpected {:?}", v),
        }
        // The recorded node is fine.
        assert!(!r.add_promise(2, None).unwrap());
    }

    #[test]
    fn adopt_highest_classic_value() {
        let mut r = Round::new(1, 5);
        r.add_promise(1, classic(1, 2, "a")).unwrap();
        r.add_promise(2, classic(3, 4, "b")).unwrap();
        r.add_promise(3, classic(4, 3, "c")).unwrap();
        assert!(r.is_promise_quorum());
        assert_eq!(r.highest_proposal(), Some(ProposalId::new(3, 4)));
        assert_eq!(r.adoption(), Adoption::Adopt("b".to_owned()));

        // A fast value never beats a classic one.
        r.add_promise(4, fast(9, "d")).unwrap();
        assert_eq!(r.adoption(), Adoption::Adopt("b".to_owned()));
    }

    #[test]
    fn adopt_possibly_chosen_fast_value() {
        let mut r = Round::new(1, 5);
        r.add_promise(1, fast(0, "a")).unwrap();
        r.add_promise(2, fast(0, "a")).unwrap();
        r.add_promise(3, None).unwrap();
        // unheard: 2, "a" could still have 4 votes.
        assert_eq!(r.adoption(), Adoption::Adopt("a".to_owned()));

        let mut r = Round::new(1, 3);
        r.add_promise(1, fast(0, "a")).unwrap();
        r.add_promise(2, fast(0, "a")).unwrap();
        assert_eq!(r.adoption(), Adoption::Adopt("a".to_owned()));
    }

    #[test]
    fn unchosen_fast_values() {
        let mut r = Round::new(1, 3);
        r.add_promise(1, fast(0, "a")).unwrap();
        r.add_promise(2, fast(3, "b")).unwrap();
        assert!(r.is_promise_quorum());
        assert_eq!(r.adoption(), Adoption::Unchosen("b".to_owned()));

        r.add_promise(3, fast(0, "a")).unwrap();
        assert_eq!(r.adoption(), Adoption::Unchosen("a".to_owned()));
    }

    #[test]
    fn no_fast_value_chosen() {
        let mut r = Round::new(1, 5);
        r.add_promise(1, fast(0, "a")).unwrap();
        r.add_promise(2, fast(3, "b")).unwrap();
        r.add_promise(3, fast(4, "c")).unwrap();
        r.add_promise(4, None).unwrap();
        // unheard: 1, nobody could reach 4 votes.
        assert_eq!(r.adoption(), Adoption::Unchosen("c".to_owned()));
    }

    #[test]
    fn next_round_clears_votes() {
        let mut r = Round::new(1, 3);
        r.add_promise(1, classic(1, 1, "a")).unwrap();
        r.add_promise(2, None).unwrap();
        r.add_accepted(1).unwrap();
        assert_eq!(r.number(), INITIAL_ROUND);

        assert_eq!(r.next_round(), INITIAL_ROUND + 1);
        assert_eq!(r.num_promised(), 0);
        assert_eq!(r.num_accepted(), 0);
        assert_eq!(r.highest_proposal(), None);
        assert_eq!(r.adoption(), Adoption::Free);
        assert_eq!(r.next_round(), INITIAL_ROUND + 2);
    }
}
