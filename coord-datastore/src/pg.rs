// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

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

/// `sqlx`-backed implementation of [`Datastore`]. Holds a `PgPool`, which
/// plays the same role the reference workspace assigns to `deadpool`:
/// a shared, cloneable handle to a bounded set of live connections.
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), DatastoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatastoreError::Permanent(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn change_kind_str(c: ChangeKind) -> &'static str {
    match c {
        ChangeKind::Update => "update",
        ChangeKind::Create => "create",
        ChangeKind::DeleteReplica => "delete_replica",
        ChangeKind::Rename => "rename",
        ChangeKind::GarbageCollect => "garbage_collect",
        ChangeKind::RepackFull => "repack_full",
        ChangeKind::RepackIncremental => "repack_incremental",
        ChangeKind::WriteCommitGraph => "write_commit_graph",
        ChangeKind::PackRefs => "pack_refs",
    }
}

fn parse_change_kind(s: &str) -> Result<ChangeKind, DatastoreError> {
    Ok(match s {
        "update" => ChangeKind::Update,
        "create" => ChangeKind::Create,
        "delete_replica" => ChangeKind::DeleteReplica,
        "rename" => ChangeKind::Rename,
        "garbage_collect" => ChangeKind::GarbageCollect,
        "repack_full" => ChangeKind::RepackFull,
        "repack_incremental" => ChangeKind::RepackIncremental,
        "write_commit_graph" => ChangeKind::WriteCommitGraph,
        "pack_refs" => ChangeKind::PackRefs,
        other => return Err(DatastoreError::Permanent(format!("unknown change kind {other}"))),
    })
}

fn job_state_str(s: JobState) -> &'static str {
    match s {
        JobState::Ready => "ready",
        JobState::InProgress => "in_progress",
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Dead => "dead",
        JobState::Cancelled => "cancelled",
    }
}

fn parse_job_state(s: &str) -> Result<JobState, DatastoreError> {
    Ok(match s {
        "ready" => JobState::Ready,
        "in_progress" => JobState::InProgress,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "dead" => JobState::Dead,
        "cancelled" => JobState::Cancelled,
        other => return Err(DatastoreError::Permanent(format!("unknown job state {other}"))),
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Result<ReplicationJob, DatastoreError> {
    Ok(ReplicationJob {
        id: row.try_get("id")?,
        virtual_storage: VirtualStorage(row.try_get("virtual_storage")?),
        relative_path: row.try_get("relative_path")?,
        change: parse_change_kind(row.try_get("change")?)?,
        source: row
            .try_get::<Option<String>, _>("source_storage")?
            .map(StorageName),
        target: StorageName(row.try_get("target_storage")?),
        attempt: row.try_get("attempt")?,
        state: parse_job_state(row.try_get("state")?)?,
        last_error: row.try_get("last_error")?,
        source_generation_at_enqueue: row
            .try_get::<Option<i64>, _>("source_generation_enqueue")?
            .map(Generation),
        new_relative_path: row.try_get("new_relative_path")?,
    })
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn enqueue_replication(
        &self,
        job: NewReplicationJob,
    ) -> Result<(i64, bool), DatastoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id FROM replication_queue
            WHERE virtual_storage = $1 AND relative_path = $2 AND change = $3
                  AND target_storage = $4 AND state IN ('ready', 'in_progress')
            FOR UPDATE
            "#,
        )
        .bind(&job.virtual_storage.0)
        .bind(&job.relative_path)
        .bind(change_kind_str(job.change))
        .bind(&job.target.0)
        .fetch_optional(&mut tx)
        .await?;

        if let Some(row) = existing {
            let id: i64 = row.try_get("id")?;
            tx.commit().await?;
            return Ok((id, true));
        }

        let row = sqlx::query(
            r#"
            INSERT INTO replication_queue
                (virtual_storage, relative_path, change, source_storage, target_storage,
                 source_generation_enqueue, new_relative_path, attempt, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, 'ready')
            RETURNING id
            "#,
        )
        .bind(&job.virtual_storage.0)
        .bind(&job.relative_path)
        .bind(change_kind_str(job.change))
        .bind(job.source.as_ref().map(|s| s.0.clone()))
        .bind(&job.target.0)
        .bind(job.source_generation_at_enqueue.map(|g| g.0))
        .bind(&job.new_relative_path)
        .fetch_one(&mut tx)
        .await?;
        let id: i64 = row.try_get("id")?;
        tx.commit().await?;
        Ok((id, false))
    }

    async fn acquire_next_job(
        &self,
        virtual_storage: &VirtualStorage,
        target: &StorageName,
    ) -> Result<Option<ReplicationJob>, DatastoreError> {
        let row = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT q.id
                FROM replication_queue q
                WHERE q.virtual_storage = $1 AND q.target_storage = $2 AND q.state = 'ready'
                  AND NOT EXISTS (
                      SELECT 1 FROM replication_queue q2
                      WHERE q2.virtual_storage = q.virtual_storage
                        AND q2.target_storage = q.target_storage
                        AND q2.relative_path = q.relative_path
                        AND q2.state = 'in_progress'
                  )
                ORDER BY q.created_at ASC
                LIMIT 1
                FOR UPDATE OF q SKIP LOCKED
            )
            UPDATE replication_queue
            SET state = 'in_progress', attempt = attempt + 1, updated_at = now()
            FROM candidate
            WHERE replication_queue.id = candidate.id
            RETURNING replication_queue.*
            "#,
        )
        .bind(&virtual_storage.0)
        .bind(&target.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete_job(&self, id: i64, result: JobResult) -> Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        match result {
            JobResult::Completed => {
                sqlx::query(
                    "UPDATE replication_queue SET state = 'completed', updated_at = now(), last_error = NULL WHERE id = $1",
                )
                .bind(id)
                .execute(&mut tx)
                .await?;
            },
            JobResult::Failed { error, max_attempts } => {
                sqlx::query(
                    r#"
                    UPDATE replication_queue
                    SET state = CASE WHEN attempt >= $2 THEN 'dead' ELSE 'failed' END,
                        last_error = $3,
                        updated_at = now()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(max_attempts)
                .bind(error)
                .execute(&mut tx)
                .await?;
            },
        }

        let row = sqlx::query(
            "SELECT virtual_storage, relative_path, change, new_relative_path, state FROM replication_queue WHERE id = $1",
        )
        .bind(id)
        .fetch_one(&mut tx)
        .await?;
        let change = parse_change_kind(row.try_get("change")?)?;
        let state: String = row.try_get("state")?;
        let virtual_storage: String = row.try_get("virtual_storage")?;
        let relative_path: String = row.try_get("relative_path")?;

        // A completed rename moves every piece of keyed state — replica
        // generations, the static assignment, and the election record —
        // to the new relative path in the same transaction the job
        // completes in (spec.md §9 open question 2), rather than leaving
        // the election record to be patched up lazily on next read.
        if state == "completed" && change == ChangeKind::Rename {
            let new_path: Option<String> = row.try_get("new_relative_path")?;
            if let Some(new_path) = new_path {
                for table in ["storage_repositories", "repository_assignments"] {
                    sqlx::query(&format!(
                        "UPDATE {table} SET relative_path = $1 WHERE virtual_storage = $2 AND relative_path = $3"
                    ))
                    .bind(&new_path)
                    .bind(&virtual_storage)
                    .bind(&relative_path)
                    .execute(&mut tx)
                    .await?;
                }
                sqlx::query(
                    "UPDATE shard_primaries SET relative_path = $1 WHERE virtual_storage = $2 AND relative_path = $3",
                )
                .bind(&new_path)
                .bind(&virtual_storage)
                .bind(&relative_path)
                .execute(&mut tx)
                .await?;
            }
        }

        // Deletion is driven entirely through the job queue (spec.md §4.5:
        // "deletion enqueues delete-replica jobs for every storage, and the
        // coordinator withholds election updates until all deletions
        // complete or are dead"). Once this job's state lands on a terminal
        // outcome (`completed` or `dead`) for a `delete_replica` job and no
        // sibling `delete_replica` job for the same repository is still
        // `ready`/`in_progress`/`failed`, purge every row for the
        // repository in the same transaction, mirroring `delete_repository`.
        if change == ChangeKind::DeleteReplica && matches!(state.as_str(), "completed" | "dead") {
            let still_pending: i64 = sqlx::query_scalar(
                r#"
                SELECT count(*) FROM replication_queue
                WHERE virtual_storage = $1 AND relative_path = $2 AND change = 'delete_replica'
                  AND state IN ('ready', 'in_progress', 'failed')
                "#,
            )
            .bind(&virtual_storage)
            .bind(&relative_path)
            .fetch_one(&mut tx)
            .await?;
            if still_pending == 0 {
                for table in ["storage_repositories", "repository_assignments", "shard_primaries", "replication_queue"] {
                    let sql = format!("DELETE FROM {table} WHERE virtual_storage = $1 AND relative_path = $2");
                    sqlx::query(&sql).bind(&virtual_storage).bind(&relative_path).execute(&mut tx).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
    ) -> Result<Generation, DatastoreError> {
        let row = sqlx::query(
            "SELECT generation FROM storage_repositories WHERE virtual_storage = $1 AND relative_path = $2 AND storage = $3",
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .bind(&storage.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Generation(r.try_get("generation")?),
            None => Generation::NONE,
        })
    }

    async fn increment_generation(
        &self,
        repo: &RepositoryId,
        participants: &[StorageName],
        expected: Generation,
    ) -> Result<Generation, DatastoreError> {
        let names: Vec<String> = participants.iter().map(|s| s.0.clone()).collect();
        let new_gen = expected.next();

        sqlx::query(
            r#"
            INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
            SELECT $1, $2, s, $4 FROM UNNEST($3::text[]) AS s
            ON CONFLICT (virtual_storage, relative_path, storage)
            DO UPDATE SET generation = $4
            WHERE storage_repositories.generation = $5
            "#,
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .bind(&names)
        .bind(new_gen.0)
        .bind(expected.0)
        .execute(&self.pool)
        .await?;

        Ok(new_gen)
    }

    async fn set_generation(
        &self,
        repo: &RepositoryId,
        storage: &StorageName,
        generation: Generation,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO storage_repositories (virtual_storage, relative_path, storage, generation)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (virtual_storage, relative_path, storage)
            DO UPDATE SET generation = EXCLUDED.generation
            "#,
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .bind(&storage.0)
        .bind(generation.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_replicas(
        &self,
        repo: &RepositoryId,
    ) -> Result<Vec<(StorageName, Generation)>, DatastoreError> {
        let rows = sqlx::query(
            "SELECT storage, generation FROM storage_repositories WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok((StorageName(r.try_get("storage")?), Generation(r.try_get("generation")?))))
            .collect()
    }

    async fn list_outdated(&self) -> Result<Vec<RepositoryId>, DatastoreError> {
        let rows = sqlx::query(
            r#"
            SELECT virtual_storage, relative_path FROM (
                SELECT virtual_storage, relative_path, generation,
                       MAX(generation) OVER (PARTITION BY virtual_storage, relative_path) AS authoritative
                FROM storage_repositories
            ) t
            WHERE generation < authoritative
            GROUP BY virtual_storage, relative_path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(RepositoryId {
                    virtual_storage: VirtualStorage(r.try_get("virtual_storage")?),
                    relative_path: r.try_get("relative_path")?,
                })
            })
            .collect()
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryId>, DatastoreError> {
        let rows = sqlx::query(
            r#"
            SELECT virtual_storage, relative_path FROM storage_repositories
            UNION
            SELECT virtual_storage, relative_path FROM repository_assignments
            UNION
            SELECT virtual_storage, relative_path FROM shard_primaries
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(RepositoryId {
                    virtual_storage: VirtualStorage(r.try_get("virtual_storage")?),
                    relative_path: r.try_get("relative_path")?,
                })
            })
            .collect()
    }

    async fn failed_job_count(&self, virtual_storage: &VirtualStorage, storage: &StorageName) -> Result<i64, DatastoreError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM replication_queue WHERE virtual_storage = $1 AND target_storage = $2 AND state IN ('failed', 'dead')",
        )
        .bind(&virtual_storage.0)
        .bind(&storage.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn get_assignments(&self, repo: &RepositoryId) -> Result<Assignment, DatastoreError> {
        let rows = sqlx::query(
            "SELECT storage FROM repository_assignments WHERE virtual_storage = $1 AND relative_path = $2",
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .fetch_all(&self.pool)
        .await?;

        Ok(Assignment {
            storages: rows
                .iter()
                .map(|r| Ok(StorageName(r.try_get("storage")?)))
                .collect::<Result<_, DatastoreError>>()?,
        })
    }

    async fn set_assignments(
        &self,
        repo: &RepositoryId,
        assignment: Assignment,
    ) -> Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM repository_assignments WHERE virtual_storage = $1 AND relative_path = $2")
            .bind(&repo.virtual_storage.0)
            .bind(&repo.relative_path)
            .execute(&mut tx)
            .await?;
        for storage in &assignment.storages {
            sqlx::query(
                "INSERT INTO repository_assignments (virtual_storage, relative_path, storage) VALUES ($1, $2, $3)",
            )
            .bind(&repo.virtual_storage.0)
            .bind(&repo.relative_path)
            .bind(&storage.0)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_health(
        &self,
        coordinator_id: &str,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        seen_at_unix: i64,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_health (coordinator_id, virtual_storage, storage, last_seen)
            VALUES ($1, $2, $3, to_timestamp($4))
            ON CONFLICT (coordinator_id, virtual_storage, storage)
            DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(coordinator_id)
        .bind(&virtual_storage.0)
        .bind(&storage.0)
        .bind(seen_at_unix as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consensus_healthy(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
        healthy_window_secs: i64,
    ) -> Result<bool, DatastoreError> {
        // Cluster size is approximated by the number of distinct
        // coordinators that have ever probed this virtual storage; a
        // coordinator that has never reported any health for it does not
        // count towards the majority.
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(DISTINCT coordinator_id) FROM node_health
                 WHERE virtual_storage = $1 AND storage = $2
                       AND last_seen > now() - make_interval(secs => $3)) AS healthy,
                (SELECT count(DISTINCT coordinator_id) FROM node_health
                 WHERE virtual_storage = $1) AS total
            "#,
        )
        .bind(&virtual_storage.0)
        .bind(&storage.0)
        .bind(healthy_window_secs as f64)
        .fetch_one(&self.pool)
        .await?;

        let healthy: i64 = row.try_get("healthy")?;
        let total: i64 = row.try_get("total")?;
        if total == 0 {
            return Ok(false);
        }
        Ok(healthy * 2 > total)
    }

    async fn health_records(
        &self,
        virtual_storage: &VirtualStorage,
        storage: &StorageName,
    ) -> Result<Vec<HealthRecord>, DatastoreError> {
        let rows = sqlx::query(
            r#"
            SELECT coordinator_id, extract(epoch FROM last_seen)::bigint AS last_seen
            FROM node_health WHERE virtual_storage = $1 AND storage = $2
            "#,
        )
        .bind(&virtual_storage.0)
        .bind(&storage.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(HealthRecord {
                    coordinator_id: r.try_get("coordinator_id")?,
                    virtual_storage: virtual_storage.clone(),
                    storage: storage.clone(),
                    last_seen_unix: r.try_get("last_seen")?,
                })
            })
            .collect()
    }

    async fn get_election(&self, repo: &RepositoryId) -> Result<Option<ElectionRecord>, DatastoreError> {
        let row = sqlx::query(
            r#"
            SELECT storage, demoted, extract(epoch FROM elected_at)::bigint AS elected_at
            FROM shard_primaries WHERE virtual_storage = $1 AND relative_path = $2
            "#,
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(ElectionRecord {
                repo: repo.clone(),
                primary: r.try_get::<Option<String>, _>("storage")?.map(StorageName),
                demoted: r.try_get("demoted")?,
                elected_at_unix: r.try_get("elected_at")?,
            })
        })
        .transpose()
    }

    async fn try_elect(
        &self,
        repo: &RepositoryId,
        new_primary: Option<StorageName>,
        expected_current: Option<StorageName>,
    ) -> Result<bool, DatastoreError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query(
            "SELECT storage FROM shard_primaries WHERE virtual_storage = $1 AND relative_path = $2 FOR UPDATE",
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .fetch_optional(&mut tx)
        .await?;

        let current_storage: Option<String> = match &current {
            Some(r) => r.try_get("storage")?,
            None => None,
        };
        let expected_str = expected_current.as_ref().map(|s| s.0.clone());
        if current.is_some() && current_storage != expected_str {
            return Ok(false);
        }
        if current.is_none() && expected_current.is_some() {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO shard_primaries (virtual_storage, relative_path, storage, demoted, elected_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (virtual_storage, relative_path)
            DO UPDATE SET storage = EXCLUDED.storage, demoted = EXCLUDED.demoted, elected_at = now()
            "#,
        )
        .bind(&repo.virtual_storage.0)
        .bind(&repo.relative_path)
        .bind(new_primary.as_ref().map(|s| s.0.clone()))
        .bind(new_primary.is_none())
        .execute(&mut tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_repository(&self, repo: &RepositoryId) -> Result<(), DatastoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "storage_repositories",
            "repository_assignments",
            "shard_primaries",
            "replication_queue",
        ] {
            let sql = format!("DELETE FROM {table} WHERE virtual_storage = $1 AND relative_path = $2");
            sqlx::query(&sql)
                .bind(&repo.virtual_storage.0)
                .bind(&repo.relative_path)
                .execute(&mut tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn record_data_loss_audit(&self, audit: DataLossAudit) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO data_loss_audit
                (virtual_storage, relative_path, storage, accepted_generation, previous_generation, operator, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&audit.repo.virtual_storage.0)
        .bind(&audit.repo.relative_path)
        .bind(&audit.storage.0)
        .bind(audit.accepted_generation.0)
        .bind(audit.previous_generation.0)
        .bind(&audit.operator)
        .bind(&audit.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
