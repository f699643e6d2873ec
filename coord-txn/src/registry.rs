// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::Notify;
use tracing::{instrument, warn};

use crate::{
    error::RegistryError,
    transaction::{Outcome, ParticipantStatus, Subtransaction, VoteHash, Voter},
};

struct TxnState {
    voters: Vec<Voter>,
    threshold: u32,
    subtxs: Vec<Subtransaction>,
    /// How many subtransactions each voter has already cast a vote in;
    /// determines which subtransaction index a voter's next vote opens.
    votes_cast: HashMap<String, usize>,
    status: HashMap<String, ParticipantStatus>,
    cancelled: bool,
}

impl TxnState {
    fn new(voters: Vec<Voter>, threshold: u32) -> Self {
        let status = voters.iter().map(|v| (v.name.clone(), ParticipantStatus::Undecided)).collect();
        Self {
            voters,
            threshold,
            subtxs: Vec::new(),
            votes_cast: HashMap::new(),
            status,
            cancelled: false,
        }
    }
}

struct Txn {
    state: Mutex<TxnState>,
    notify: Notify,
}

impl Txn {
    /// Cast `voter`'s vote for `hash` and return the outcome if its
    /// subtransaction has resolved, `None` if the caller should keep
    /// waiting.
    fn try_vote(&self, voter: &str, hash: VoteHash) -> Result<Option<Outcome>, RegistryError> {
        let mut st = self.state.lock();
        if st.cancelled {
            return Ok(Some(Outcome::Stop));
        }
        if !st.voters.iter().any(|v| v.name == voter) {
            return Err(RegistryError::UnknownVoter(voter.to_string()));
        }

        let idx = *st.votes_cast.get(voter).unwrap_or(&0);
        while st.subtxs.len() <= idx {
            st.subtxs.push(Subtransaction::default());
        }
        *st.votes_cast.entry(voter.to_string()).or_insert(0) += 1;

        let voters = st.voters.clone();
        let threshold = st.threshold;
        let outcome = st.subtxs[idx].cast_vote(voter, hash, &voters, threshold);

        if let Some(decided) = outcome {
            let entry = st.status.entry(voter.to_string()).or_insert(ParticipantStatus::Undecided);
            *entry = entry.fold(decided);
        }

        Ok(outcome)
    }

    /// Re-evaluate every subtransaction a still-undecided voter has
    /// already voted in, after some *other* voter's vote may have changed
    /// the picture (e.g. made a hash reach threshold, or made the round
    /// impossible). Folds any newly-decided outcome into that voter's
    /// aggregate status.
    fn refresh(&self, voter: &str) -> Option<Outcome> {
        let mut st = self.state.lock();
        if st.cancelled {
            return Some(Outcome::Stop);
        }
        let idx = *st.votes_cast.get(voter)?;
        if idx == 0 {
            return None;
        }
        // the subtransaction this voter's most recent vote landed in
        let sub = st.subtxs.get(idx - 1)?;
        let outcome = sub.outcome_for(voter)?;
        let entry = st.status.entry(voter.to_string()).or_insert(ParticipantStatus::Undecided);
        *entry = entry.fold(outcome);
        Some(outcome)
    }

    fn cancel(&self) {
        let mut st = self.state.lock();
        st.cancelled = true;
        for voter in st.voters.clone() {
            let voted_all_open = st.votes_cast.get(&voter.name).copied().unwrap_or(0) >= st.subtxs.len();
            let entry = st.status.entry(voter.name.clone()).or_insert(ParticipantStatus::Undecided);
            if *entry == ParticipantStatus::Undecided && !voted_all_open {
                *entry = ParticipantStatus::TimedOut;
            }
        }
    }

    fn participant_status(&self, voter: &str) -> Option<ParticipantStatus> {
        self.state.lock().status.get(voter).copied()
    }
}

/// Process-local registry of live voting transactions (spec.md §4.3).
/// Shared across every concurrent RPC handled by this coordinator;
/// transactions do not survive process restart (spec.md §9).
#[derive(Default)]
pub struct Registry {
    txns: Mutex<HashMap<u32, Arc<Txn>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a random transaction id and register `voters` with the
    /// given commit `threshold`. `threshold` must satisfy
    /// `⌈(total_weight+1)/2⌉ ≤ threshold ≤ total_weight` (spec.md §4.3).
    #[instrument(skip(self, voters), fields(n_voters = voters.len()))]
    pub fn create(&self, voters: Vec<Voter>, threshold: u32) -> Result<u32, RegistryError> {
        let total: u32 = voters.iter().map(|v| v.weight).sum();
        // ceil((total + 1) / 2) computed without floating point or the
        // (edition-gated) integer div_ceil.
        let min = (total + 2) / 2;
        if threshold < min || threshold > total {
            return Err(RegistryError::InvalidParameters { threshold, min, total });
        }

        let mut txns = self.txns.lock();
        let mut id = rand::thread_rng().next_u32();
        while txns.contains_key(&id) {
            id = rand::thread_rng().next_u32();
        }
        txns.insert(id, Arc::new(Txn { state: Mutex::new(TxnState::new(voters, threshold)), notify: Notify::new() }));
        Ok(id)
    }

    /// Cast a vote, blocking until the subtransaction it opens resolves,
    /// or the transaction is cancelled (spec.md §4.3).
    #[instrument(skip(self), fields(id, voter))]
    pub async fn vote(&self, id: u32, voter: &str, hash: VoteHash) -> Result<Outcome, RegistryError> {
        let txn = self.get(id)?;

        if let Some(outcome) = txn.try_vote(voter, hash)? {
            self.wake(&txn);
            return Ok(outcome);
        }

        loop {
            let notified = txn.notify.notified();
            tokio::pin!(notified);
            // Check once more immediately in case another voter's vote
            // already resolved our subtransaction between `try_vote` above
            // and subscribing to the notifier.
            if let Some(outcome) = txn.refresh(voter) {
                return Ok(outcome);
            }
            notified.await;
            if let Some(outcome) = txn.refresh(voter) {
                return Ok(outcome);
            }
        }
    }

    fn wake(&self, txn: &Txn) {
        txn.notify.notify_waiters();
    }

    /// Wake every blocked voter with [`Outcome::Stop`] and remove the
    /// transaction. Idempotent.
    #[instrument(skip(self))]
    pub fn cancel(&self, id: u32) {
        let txn = self.txns.lock().remove(&id);
        if let Some(txn) = txn {
            txn.cancel();
            txn.notify.notify_waiters();
        } else {
            warn!(id, "cancel on unknown or already-cancelled transaction");
        }
    }

    /// A voter's aggregate status across every subtransaction it has
    /// participated in (spec.md §4.5 step 5). Used by the proxy after a
    /// participant's backend RPC returns, to decide whether it applied the
    /// change.
    pub fn participant_status(&self, id: u32, voter: &str) -> Option<ParticipantStatus> {
        self.txns.lock().get(&id)?.participant_status(voter)
    }

    fn get(&self, id: u32) -> Result<Arc<Txn>, RegistryError> {
        self.txns.lock().get(&id).cloned().ok_or(RegistryError::UnknownTransaction(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voters(n: usize) -> Vec<Voter> {
        (0..n).map(|i| Voter { name: format!("v{i}"), weight: 1 }).collect()
    }

    #[tokio::test]
    async fn strong_vote_all_agree_commits() {
        let reg = Registry::new();
        let id = reg.create(voters(3), 3).unwrap();
        let h = [7u8; 20];
        let (r0, r1, r2) = tokio::join!(reg.vote(id, "v0", h), reg.vote(id, "v1", h), reg.vote(id, "v2", h),);
        assert_eq!(r0.unwrap(), Outcome::Commit);
        assert_eq!(r1.unwrap(), Outcome::Commit);
        assert_eq!(r2.unwrap(), Outcome::Commit);
        assert_eq!(reg.participant_status(id, "v0"), Some(ParticipantStatus::Committed));
    }

    #[tokio::test]
    async fn one_dissenter_aborts_under_strong_threshold() {
        let reg = Registry::new();
        let id = reg.create(voters(3), 3).unwrap();
        let h1 = [1u8; 20];
        let h2 = [2u8; 20];
        let (r0, r1, r2) = tokio::join!(reg.vote(id, "v0", h1), reg.vote(id, "v1", h1), reg.vote(id, "v2", h2),);
        assert_eq!(r0.unwrap(), Outcome::Abort);
        assert_eq!(r1.unwrap(), Outcome::Abort);
        assert_eq!(r2.unwrap(), Outcome::Abort);
        assert_eq!(reg.participant_status(id, "v0"), Some(ParticipantStatus::Aborted));
    }

    #[tokio::test]
    async fn invalid_threshold_rejected() {
        let reg = Registry::new();
        assert!(reg.create(voters(3), 1).is_err());
        assert!(reg.create(voters(3), 4).is_err());
        assert!(reg.create(voters(3), 2).is_ok());
    }

    #[tokio::test]
    async fn cancel_wakes_blocked_voters_with_stop() {
        let reg = Registry::new();
        let id = reg.create(voters(3), 3).unwrap();
        let h = [9u8; 20];

        let registry = Arc::new(reg);
        let r2 = Arc::clone(&registry);
        let waiter = tokio::spawn(async move { r2.vote(id, "v0", h).await });
        // give the waiter a chance to block before cancelling
        tokio::task::yield_now().await;
        registry.cancel(id);
        assert_eq!(waiter.await.unwrap().unwrap(), Outcome::Stop);
    }

    #[tokio::test]
    async fn unknown_voter_is_rejected() {
        let reg = Registry::new();
        let id = reg.create(voters(2), 2).unwrap();
        assert!(matches!(reg.vote(id, "ghost", [0u8; 20]).await, Err(RegistryError::UnknownVoter(_))));
    }
}
