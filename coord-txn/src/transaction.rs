// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

/// A 20-byte SHA-1 of the canonical serialization of a proposed reference
/// update (spec.md §6): `sha1("<old_oid> <new_oid> <refname>\n" ...)`.
pub type VoteHash = [u8; 20];

/// A participant in a transaction, usually one per replica (spec.md §3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Voter {
    pub name: String,
    pub weight: u32,
}

/// The answer `Vote` gives to a blocked caller (spec.md §4.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Commit,
    Abort,
    /// The transaction was cancelled or timed out while this call was
    /// still blocked.
    Stop,
}

/// A voter's aggregate status across every subtransaction it has
/// participated in so far (spec.md §4.5 step 5: "a participant that
/// committed all subtransactions is considered to have applied the
/// change").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParticipantStatus {
    /// Has at least one undecided subtransaction outstanding.
    Undecided,
    /// Committed every subtransaction it participated in.
    Committed,
    /// At least one subtransaction it participated in aborted.
    Aborted,
    /// Never cast an expected vote before the transaction was cancelled
    /// (spec.md §9 open question: treated as full-transaction abort).
    TimedOut,
}

impl ParticipantStatus {
    pub(crate) fn fold(self, decided: Outcome) -> Self {
        match (self, decided) {
            (Self::TimedOut, _) | (Self::Aborted, _) => self,
            (_, Outcome::Abort) => Self::Aborted,
            (Self::Undecided, Outcome::Commit) => Self::Committed,
            (other, Outcome::Commit) => other,
            (other, Outcome::Stop) => other,
        }
    }
}

/// One voting round inside a transaction. A new subtransaction is opened
/// whenever a voter casts a vote after already having voted `n` times in
/// this transaction, where `n` is this subtransaction's index (spec.md
/// §4.3: "each new hash from a previously-voted voter opens a new
/// subtransaction").
#[derive(Default)]
pub(crate) struct Subtransaction {
    /// Cumulative weight received for each candidate hash.
    weights: HashMap<VoteHash, u32>,
    /// The hash each voter that has voted in this round cast.
    cast: HashMap<String, VoteHash>,
    /// Once resolved, `Some(hash)` is the winning hash (commit), `None`
    /// means the round resolved to abort-all.
    resolved: Option<Option<VoteHash>>,
}

impl Subtransaction {
    /// Record `voter`'s vote and re-evaluate the round against `threshold`
    /// (the transaction's fixed commit threshold). Returns the outcome for
    /// `voter` if the round is (now, or already) resolved.
    pub(crate) fn cast_vote(
        &mut self,
        voter: &str,
        hash: VoteHash,
        all_voters: &[Voter],
        threshold: u32,
    ) -> Option<Outcome> {
        self.cast.insert(voter.to_string(), hash);
        *self.weights.entry(hash).or_insert(0) += weight_of(all_voters, voter);

        if self.resolved.is_none() {
            self.evaluate(all_voters, threshold);
        }

        self.outcome_for(voter)
    }

    /// Outcome for `voter` given the round's current resolution state
    /// (`None` if still undecided, including "hasn't voted yet").
    pub(crate) fn outcome_for(&self, voter: &str) -> Option<Outcome> {
        let winner = self.resolved?;
        let cast = self.cast.get(voter)?;
        Some(match winner {
            Some(h) if h == *cast => Outcome::Commit,
            _ => Outcome::Abort,
        })
    }

    pub(crate) fn has_voted(&self, voter: &str) -> bool {
        self.cast.contains_key(voter)
    }

    fn evaluate(&mut self, all_voters: &[Voter], threshold: u32) {
        if let Some((&hash, _)) = self.weights.iter().find(|(_, &w)| w >= threshold) {
            self.resolved = Some(Some(hash));
            return;
        }

        let remaining: u32 = all_voters
            .iter()
            .filter(|v| !self.cast.contains_key(&v.name))
            .map(|v| v.weight)
            .sum();
        let best_existing = self.weights.values().copied().max().unwrap_or(0);
        // Best case for any existing hash is its current weight plus every
        // outstanding voter joining it; best case for a brand-new hash is
        // every outstanding voter joining it from scratch.
        let best_possible = (best_existing + remaining).max(remaining);
        if best_possible < threshold {
            self.resolved = Some(None);
        }
    }
}

fn weight_of(voters: &[Voter], name: &str) -> u32 {
    voters.iter().find(|v| v.name == name).map(|v| v.weight).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters() -> Vec<Voter> {
        vec![
            Voter { name: "a".into(), weight: 1 },
            Voter { name: "b".into(), weight: 1 },
            Voter { name: "c".into(), weight: 1 },
        ]
    }

    #[test]
    fn unanimous_commit() {
        let vs = voters();
        let mut sub = Subtransaction::default();
        let h = [1u8; 20];
        assert_eq!(sub.cast_vote("a", h, &vs, 3), None);
        assert_eq!(sub.cast_vote("b", h, &vs, 3), None);
        assert_eq!(sub.cast_vote("c", h, &vs, 3), Some(Outcome::Commit));
    }

    #[test]
    fn dissent_aborts_minority_at_strong_threshold() {
        let vs = voters();
        let mut sub = Subtransaction::default();
        let h1 = [1u8; 20];
        let h2 = [2u8; 20];
        assert_eq!(sub.cast_vote("a", h1, &vs, 3), None);
        assert_eq!(sub.cast_vote("b", h1, &vs, 3), None);
        // with threshold 3 (strong voting) a single dissent makes every
        // hash mathematically unreachable once all three have voted
        assert_eq!(sub.cast_vote("c", h2, &vs, 3), Some(Outcome::Abort));
        assert_eq!(sub.outcome_for("a"), Some(Outcome::Abort));
        assert_eq!(sub.outcome_for("b"), Some(Outcome::Abort));
    }

    #[test]
    fn majority_threshold_commits_despite_dissent() {
        let vs = voters();
        let mut sub = Subtransaction::default();
        let h1 = [1u8; 20];
        let h2 = [2u8; 20];
        assert_eq!(sub.cast_vote("a", h1, &vs, 2), None);
        assert_eq!(sub.cast_vote("c", h2, &vs, 2), None);
        assert_eq!(sub.cast_vote("b", h1, &vs, 2), Some(Outcome::Commit));
        assert_eq!(sub.outcome_for("c"), Some(Outcome::Abort));
    }
}
