// SPDX-License-Identifier: Apache-2.0

//! An in-memory [`Datastore`] fake. Used by the other core crates' unit
//! and scenario tests (spec.md §8) so they can exercise routing, voting,
//! and replication logic without a live Postgres instance, mirroring the
//! reference workspace's habit of testing protocol logic against an
//! in-memory store rather than the real backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use coord_core::{
    Assignment,
    ChangeKind,
    DataLossAudit,
    ElectionRecord,
    Generation,
    HealthRecord,
    JobState,
    RepositoryId,
    ReplicationJob,
    StorageName,
    VirtualStorage,
};

use crate::{
    error::DatastoreError,
    traits::{Datastore, JobResult, NewReplicationJob},
};

#[derive(Default)]
struct Inner {
    next_id: i64,
    jobs: Vec<ReplicationJob>,
    generations: HashMap<(RepositoryId, StorageName), Generation>,
    assignments: HashMap<RepositoryId, Assignment>,
    health: Vec<(String, VirtualStorage, StorageName, i64)>,
    elections: HashMap<RepositoryId, ElectionRecord>,
    audits: Vec<DataLossAudit>,
    known_coordinators: HashMap<VirtualStorage, std::collections::HashSet<String>>,
}

/// In-memory stand-in for [`crate::PgDatastore`]. Clock values (the
/// `_unix` fields) are supplied by the caller rather than read from the
/// system clock, so tests stay deterministic.
#[derive(Default)]
pub struct MemDatastore {
    inner: Mutex<Inner>,
}

impl MemDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemDatastore {
    async fn enqueue_replication(
        &self,
        job: NewReplicationJob,
    ) -> Result<(i64, bool), DatastoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.jobs.iter().find(|j| {
            j.virtual_storage == job.virtual_storage
                && j.relative_path == job.relative_path
                && std::mem::discriminant(&j.change) == std::mem::discriminant(&job.change)
                && j.target == job.target
                && matches!(j.state, JobState::Ready | JobState::InProgress)
        }) {
            return Ok((existing.id, true));
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.jobs.push(ReplicationJob {
            id,
            virtual_storage: job.virtual_storage,
            relative_path: job.relative_path,
            change: job.change,
            source: job.source,
            target: job.target,
            attempt: 0,
            state: JobState::Ready,
            last_error: None,
            source_generation_at_enqueue: job.source_generation_at_enqueue,
            new_relative_path: job.new_relative_path,
        });
        Ok((id, false))
    }

    async fn acquire_next_job(
        &self,
        virtual_storage: &VirtualStorage,
        target: &StorageName,
    ) -> Result<Option<ReplicationJob>, DatastoreError> {
        let mut inner = self.inner.lock();
        let blocked: Vec<String> = inner
            .jobs
            .iter()
            .filter(|j| {
                &j.virtual_storage == virtual_storage
                    && &j.target == target
                    && matches!(j.state, JobState::InProgress)
            })
            .map(|j| j.relative_path.clone())
            .collect();

        let candidate_id = inner
            .jobs
            .iter()
            .filter(|j| {
                &j.virtual_storage == virtual_storage
                    && &j.target == target
                    && matches!(j.state, JobState::Ready)
                    && !blocked.contains(&j.relative_path)
            })
            .min_by_key(|j| j.id)
            .map(|j| j.id);

        match candidate_id {
            None => Ok(None),
            Some(id) => {
                let job = inner.jobs.iter_mut().find(|j| j.id == id).unwrap();
                job.state = JobState::InProgress;
                job.attempt += 1;
                Ok(Some(job.clone()))
            },
        }
    }

    async fn complete_job(&self, id: i64, result: JobResult) -> Result<(), DatastoreError> {
        let mut inner = self.inner.lock();
        let (completed_rename, delete_repo) = {
            let job = inner
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| DatastoreError::NotFound(format!("job {id}")))?;
            match result {
                JobResult::Completed => {
                    job.state = JobState::Completed;
                    job.last_error = None;
                },
                JobResult::Failed { error, max_attempts } => {
                    job.state = if job.attempt >= max_attempts {
                        JobState::Dead
                    } else {
                        JobState::Failed
                    };
                    job.last_error = Some(error);
                },
            }
            let rename = match (&job.state, job.change, &job.new_relative_path) {
                (JobState::Completed, ChangeKind::Rename, Some(new_path)) => {
                    Some((RepositoryId { virtual_storage: job.virtual_storage.clone(), relative_path: job.relative_path.clone() }, new_path.clone()))
                },
                _ => None,
            };
            let delete = match (&job.state, job.change) {
                (JobState::Completed, ChangeKind::DeleteReplica) | (JobState::Dead, ChangeKind::DeleteReplica) => Some(job.repo()),
                _ => None,
            };
            (rename, delete)
        };

        if let Some((old_repo, new_path)) = completed_rename {
            let new_repo = RepositoryId { virtual_storage: old_repo.virtual_storage.clone(), relative_path: new_path };

            let moved: Vec<_> = inner
                .generations
                .keys()
                .filter(|(repo, _)| repo == &old_repo)
                .cloned()
                .collect();
            for (repo, storage) in moved {
                if let Some(g) = inner.generations.remove(&(repo, storage.clone())) {
                    inner.generations.insert((new_repo.clone(), storage), g);
                }
            }
            if let Some(a) = inner.assignments.remove(&old_repo) {
                inner.assignments.insert(new_repo.clone(), a);
            }
            if let Some(mut e) = inner.elections.remove(&old_repo) {
                e.repo = new_repo.clone();
                inner.elections.insert(new_repo, e);
            }
        }

        // Deletion is driven entirely through the job queue (spec.md §4.5:
        // "deletion enqueues delete-replica jobs for every storage, and the
        // coordinator withholds election updates until all deletions
        // complete or are dead"). Once no `DeleteReplica` job for this
        // repository is still `Ready`/`InProgress`/`Failed` (i.e. every one
        // has reached a terminal `Completed` or `Dead` state), the
        // repository's rows are purged in one shot, same as
        // `Datastore::delete_repository`.
        if let Some(repo) = delete_repo {
            let still_pending = inner
                .jobs
                .iter()
                .any(|j| j.repo() == repo && j.change == ChangeKind::DeleteReplica && matches!(j.state, JobState::Ready | JobState::InProgress | JobState::Failed));
            if !still_pending {
                inner.jobs.retain(|j| j.repo() != repo);
                inner.generations.retain(|(r, _), _| r != &repo);
                inner.assignments.remove(&repo);
                inner.elections.remove(&repo);
            }
        }

        Ok(())
    }

    async fn get_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
    ) -> Result<Generation, DatastoreError> {
        let inner = self.inner.lock();
        Ok(*inner
            .generations
            .get(&(repo.clone(), storage.clone()))
            .unwrap_or(&Generation::NONE))
    }

    async fn increment_generation(
        &self,
        repo: &RepositoryId,
        participants: &[StorageName],
        expected: Generation,
    ) -> Result<Generation, DatastoreError> {
        let mut inner = self.inner.lock();
        let new_gen = expected.next();
        for storage in participants {
            let key = (repo.clone(), storage.clone());
            let current = *inner.generations.get(&key).unwrap_or(&Generation::NONE);
            if current == expected {
                inner.generations.insert(key, new_gen);
            }
        }
        Ok(new_gen)
    }

    async fn set_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
        generation: Generation,
    ) -> Result<(), DatastoreError> {
        self.inner
            .lock()
            .generations
            .insert((repo.clone(), storage.clone()), generation);
        Ok(())
    }

    async fn get_replicas(
        &self,
        repo: &RepositoryId,
    ) -> Result<Vec<(StorageName, Generation)>, DatastoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .generations
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, s), g)| (s.clone(), *g))
            .collect())
    }

    async fn list_outdated(&self) -> Result<Vec<RepositoryId>, DatastoreError> {
        let inner = self.inner.lock();
        let mut authoritative: HashMap<RepositoryId, Generation> = HashMap::new();
        for ((repo, _), gen) in inner.generations.iter() {
            let entry = authoritative.entry(repo.clone()).or_insert(Generation::NONE);
            if gen.0 > entry.0 {
                *entry = *gen;
            }
        }
        let mut out = Vec::new();
        for ((repo, _), gen) in inner.generations.iter() {
            if gen.0 < authoritative[repo].0 && !out.contains(repo) {
                out.push(repo.clone());
            }
        }
        Ok(out)
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryId>, DatastoreError> {
        let inner = self.inner.lock();
        let mut out: Vec<RepositoryId> = Vec::new();
        for (repo, _) in inner.generations.keys() {
            if !out.contains(repo) {
                out.push(repo.clone());
            }
        }
        for repo in inner.assignments.keys() {
            if !out.contains(repo) {
                out.push(repo.clone());
            }
        }
        for repo in inner.elections.keys() {
            if !out.contains(repo) {
                out.push(repo.clone());
            }
        }
        Ok(out)
    }

    async fn failed_job_count(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> Result<i64, DatastoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .jobs
            .iter()
            .filter(|j| {
                &j.virtual_storage == virtual_storage
                    && &j.target == storage
                    && matches!(j.state, JobState::Failed | JobState::Dead)
            })
            .count() as i64)
    }

    async fn get_assignments(&self, repo: &RepositoryId) -> Result<Assignment, DatastoreError> {
        Ok(self.inner.lock().assignments.get(repo).cloned().unwrap_or_default())
    }

    async fn set_assignments(
        &self,
        repo: &RepositoryId,
        assignment: Assignment,
    ) -> Result<(), DatastoreError> {
        self.inner.lock().assignments.insert(repo.clone(), assignment);
        Ok(())
    }

    async fn upsert_health(
        &self,
        coordinator_id: &str,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        seen_at_unix: i64,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.inner.lock();
        inner
            .known_coordinators
            .entry(virtual_storage.clone())
            .or_default()
            .insert(coordinator_id.to_string());
        if let Some(entry) = inner
            .health
            .iter_mut()
            .find(|(c, v, s, _)| c == coordinator_id && v == virtual_storage && s == storage)
        {
            entry.3 = seen_at_unix;
        } else {
            inner
                .health
                .push((coordinator_id.to_string(), virtual_storage.clone(), storage.clone(), seen_at_unix));
        }
        Ok(())
    }

    async fn consensus_healthy(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        healthy_window_secs: i64,
    ) -> Result<bool, DatastoreError> {
        let inner = self.inner.lock();
        let total = inner
            .known_coordinators
            .get(virtual_storage)
            .map(|s| s.len())
            .unwrap_or(0);
        if total == 0 {
            return Ok(false);
        }
        // Tests pass `now` implicitly via `last_seen_unix` already being
        // relative to a fixed clock; the window is applied by the caller
        // choosing `healthy_window_secs` large enough to include all
        // fixture timestamps, or by pruning stale entries beforehand.
        let _ = healthy_window_secs;
        let healthy = inner
            .health
            .iter()
            .filter(|(_, v, s, _)| v == virtual_storage && s == storage)
            .count();
        Ok(healthy * 2 > total)
    }

    async fn health_records(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
    ) -> Result<Vec<HealthRecord>, DatastoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .health
            .iter()
            .filter(|(_, v, s, _)| v == virtual_storage && s == storage)
            .map(|(c, v, s, t)| HealthRecord {
                coordinator_id: c.clone(),
                virtual_storage: v.clone(),
                storage: s.clone(),
                last_seen_unix: *t,
            })
            .collect())
    }

    async fn get_election(&self, repo: &RepositoryId) -> Result<Option<ElectionRecord>, DatastoreError> {
        Ok(self.inner.lock().elections.get(repo).cloned())
    }

    async fn try_elect(
        &self,
        repo: &RepositoryId,
        new_primary: Option<StorageName>,
        expected_current: Option<StorageName>,
    ) -> Result<bool, DatastoreError> {
        let mut inner = self.inner.lock();
        let current = inner.elections.get(repo).and_then(|e| e.primary.clone());
        if current != expected_current {
            return Ok(false);
        }
        inner.elections.insert(
            repo.clone(),
            ElectionRecord {
                repo: repo.clone(),
                demoted: new_primary.is_none(),
                primary: new_primary,
                elected_at_unix: 0,
            },
        );
        Ok(true)
    }

    async fn delete_repository(&self, repo: &RepositoryId) -> Result<(), DatastoreError> {
        let mut inner = self.inner.lock();
        inner.jobs.retain(|j| &j.repo() != repo);
        inner.generations.retain(|(r, _), _| r != repo);
        inner.assignments.remove(repo);
        inner.elections.remove(repo);
        Ok(())
    }

    async fn record_data_loss_audit(&self, audit: DataLossAudit) -> Result<(), DatastoreError> {
        self.inner.lock().audits.push(audit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coord_core::ChangeKind;

    fn repo() -> RepositoryId {
        RepositoryId {
            virtual_storage: VirtualStorage("default".into()),
            relative_path: "a/b.git".into(),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let ds = MemDatastore::new();
        let job = NewReplicationJob {
            virtual_storage: repo().virtual_storage,
            relative_path: repo().relative_path,
            change: ChangeKind::Update,
            source: Some(StorageName("a".into())),
            target: StorageName("b".into()),
            source_generation_at_enqueue: Some(Generation(1)),
            new_relative_path: None,
        };
        let (id1, existed1) = ds.enqueue_replication(job.clone()).await.unwrap();
        assert!(!existed1);
        let (id2, existed2) = ds.enqueue_replication(job).await.unwrap();
        assert_eq!(id1, id2);
        assert!(existed2);
    }

    #[tokio::test]
    async fn increment_generation_round_trip() {
        let ds = MemDatastore::new();
        let r = repo();
        let participants = vec![StorageName("a".into()), StorageName("b".into())];
        let g = ds.increment_generation(&r, &participants, Generation::NONE).await.unwrap();
        assert_eq!(g, Generation(0));
        for s in &participants {
            assert_eq!(ds.get_generation(&r, s).await.unwrap(), Generation(0));
        }
    }

    #[tokio::test]
    async fn fifo_acquire_per_target() {
        let ds = MemDatastore::new();
        let r = repo();
        let target = StorageName("c".into());
        let mk = |source: &str| NewReplicationJob {
            virtual_storage: r.virtual_storage.clone(),
            relative_path: r.relative_path.clone(),
            change: ChangeKind::GarbageCollect,
            source: Some(StorageName(source.into())),
            target: target.clone(),
            source_generation_at_enqueue: None,
            new_relative_path: None,
        };
        // distinct change kinds so enqueue doesn't dedup them away
        let mut first = mk("a");
        first.change = ChangeKind::Update;
        let (id1, _) = ds.enqueue_replication(first).await.unwrap();
        let mut second = mk("a");
        second.change = ChangeKind::RepackFull;
        ds.enqueue_replication(second).await.unwrap();

        let acquired = ds.acquire_next_job(&r.virtual_storage, &target).await.unwrap().unwrap();
        assert_eq!(acquired.id, id1);

        // second job is blocked while the first is in progress for the same repo/target
        assert!(ds.acquire_next_job(&r.virtual_storage, &target).await.unwrap().is_none());

        ds.complete_job(id1, JobResult::Completed).await.unwrap();
        let acquired2 = ds.acquire_next_job(&r.virtual_storage, &target).await.unwrap().unwrap();
        assert_ne!(acquired2.id, id1);
    }

    #[tokio::test]
    async fn completing_a_rename_job_moves_generation_and_election_state_atomically() {
        let ds = MemDatastore::new();
        let r = repo();
        ds.set_generation(&r, &StorageName("a".into()), Generation(2)).await.unwrap();
        ds.try_elect(&r, Some(StorageName("a".into())), None).await.unwrap();

        let (id, _) = ds
            .enqueue_replication(NewReplicationJob {
                virtual_storage: r.virtual_storage.clone(),
                relative_path: r.relative_path.clone(),
                change: ChangeKind::Rename,
                source: None,
                target: StorageName("a".into()),
                source_generation_at_enqueue: None,
                new_relative_path: Some("a/renamed.git".into()),
            })
            .await
            .unwrap();

        ds.complete_job(id, JobResult::Completed).await.unwrap();

        let renamed = RepositoryId { virtual_storage: r.virtual_storage.clone(), relative_path: "a/renamed.git".into() };
        assert_eq!(ds.get_generation(&renamed, &StorageName("a".into())).await.unwrap(), Generation(2));
        assert_eq!(ds.get_generation(&r, &StorageName("a".into())).await.unwrap(), Generation::NONE);

        let election = ds.get_election(&renamed).await.unwrap().unwrap();
        assert_eq!(election.repo, renamed);
        assert_eq!(election.primary, Some(StorageName("a".into())));
        assert!(ds.get_election(&r).await.unwrap().is_none());
    }
}
