use crate::error::ProvisioningError;
use crate::job::{JobFilter, JobState, ProvisioningJob};
use crate::lease::{ensure_acquirable, ensure_held, JobLease};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::RwLock;

/// Result of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(ProvisioningJob),
    Existing(ProvisioningJob),
}

/// Durable job storage with per-job leases.
///
/// Implementations must make `insert_if_absent` and `acquire_lease` atomic with
/// respect to concurrent callers; they are the only serialization points.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Insert a job unless one with the same id already exists.
    async fn insert_if_absent(&self, job: ProvisioningJob)
        -> Result<InsertOutcome, ProvisioningError>;

    async fn get(&self, job_id: &str) -> Result<Option<ProvisioningJob>, ProvisioningError>;

    /// Jobs newest-first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, ProvisioningError>;

    /// Take the job's lease, returning the job as currently stored.
    async fn acquire_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProvisioningJob, ProvisioningError>;

    /// Push the lease expiry of a job `owner` holds out to `now + ttl`.
    ///
    /// Fails with `LeaseLost` when another owner has taken the job over.
    async fn renew_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), ProvisioningError>;

    /// Persist a leased job. Fails with `LeaseLost` if `owner` no longer holds it.
    async fn save_leased(&self, job: &ProvisioningJob, owner: &str)
        -> Result<(), ProvisioningError>;

    /// Drop the lease if `owner` still holds it.
    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<(), ProvisioningError>;

    /// Ids of jobs the worker should run now, oldest first.
    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProvisioningError>;
}

fn apply_window<T>(items: Vec<T>, filter: &JobFilter) -> Vec<T> {
    let iter = items.into_iter().skip(filter.offset);
    match filter.limit {
        Some(limit) if limit > 0 => iter.take(limit).collect(),
        _ => iter.collect(),
    }
}

/// In-memory job store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, ProvisioningJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ProvisioningError {
        ProvisioningError::Storage("jobs lock poisoned".to_string())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn insert_if_absent(
        &self,
        job: ProvisioningJob,
    ) -> Result<InsertOutcome, ProvisioningError> {
        let mut guard = self.jobs.write().map_err(|_| Self::poisoned())?;
        if let Some(existing) = guard.get(&job.job_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        guard.insert(job.job_id.clone(), job.clone());
        Ok(InsertOutcome::Created(job))
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProvisioningJob>, ProvisioningError> {
        let guard = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(guard.get(job_id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, ProvisioningError> {
        let guard = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut values = guard
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apply_window(values, filter))
    }

    async fn acquire_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProvisioningJob, ProvisioningError> {
        let mut guard = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = guard
            .get_mut(job_id)
            .ok_or_else(|| ProvisioningError::JobNotFound(job_id.to_string()))?;
        ensure_acquirable(job_id, job.lease.as_ref(), now)?;
        job.lease = Some(JobLease::grant(owner, now, ttl));
        Ok(job.clone())
    }

    async fn renew_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        let mut guard = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = guard
            .get_mut(job_id)
            .ok_or_else(|| ProvisioningError::JobNotFound(job_id.to_string()))?;
        ensure_held(job_id, job.lease.as_ref(), owner)?;
        if let Some(lease) = job.lease.as_mut() {
            lease.expires_at = now + ttl;
        }
        Ok(())
    }

    async fn save_leased(
        &self,
        job: &ProvisioningJob,
        owner: &str,
    ) -> Result<(), ProvisioningError> {
        let mut guard = self.jobs.write().map_err(|_| Self::poisoned())?;
        let stored = guard
            .get_mut(&job.job_id)
            .ok_or_else(|| ProvisioningError::JobNotFound(job.job_id.clone()))?;
        ensure_held(&job.job_id, stored.lease.as_ref(), owner)?;

        let lease = stored.lease.take();
        *stored = job.clone();
        stored.lease = lease;
        Ok(())
    }

    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<(), ProvisioningError> {
        let mut guard = self.jobs.write().map_err(|_| Self::poisoned())?;
        if let Some(job) = guard.get_mut(job_id) {
            if job.lease.as_ref().map(|l| l.is_held_by(owner)).unwrap_or(false) {
                job.lease = None;
            }
        }
        Ok(())
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProvisioningError> {
        let guard = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut due = guard
            .values()
            .filter(|job| job.is_due(now))
            .filter(|job| job.lease.as_ref().map(|l| l.is_expired(now)).unwrap_or(true))
            .collect::<Vec<_>>();
        due.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(due
            .into_iter()
            .take(limit.max(1))
            .map(|job| job.job_id.clone())
            .collect())
    }
}

/// PostgreSQL job store.
///
/// The full job lives in a JSONB `record` column; state, schedule and lease are
/// mirrored into plain columns so leasing and scanning happen in SQL.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub async fn with_pool(pool: PgPool) -> Result<Self, ProvisioningError> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), ProvisioningError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provision_jobs (
                job_id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                plan_id TEXT NOT NULL,
                state TEXT NOT NULL,
                next_attempt_at TIMESTAMPTZ NULL,
                lease_owner TEXT NULL,
                lease_acquired_at TIMESTAMPTZ NULL,
                lease_expires_at TIMESTAMPTZ NULL,
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_provision_jobs_state ON provision_jobs (state, next_attempt_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn fetch(&self, job_id: &str) -> Result<Option<ProvisioningJob>, ProvisioningError> {
        let row = sqlx::query(&format!("{SELECT_JOB} WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProvisioningError::Storage(format!("postgres select failed: {e}")))?;
        row.map(|row| job_from_row(&row)).transpose()
    }
}

const SELECT_JOB: &str = r#"
    SELECT record, lease_owner, lease_acquired_at, lease_expires_at
    FROM provision_jobs
"#;

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ProvisioningJob, ProvisioningError> {
    let record: serde_json::Value = row
        .try_get("record")
        .map_err(|e| ProvisioningError::Storage(format!("postgres decode record failed: {e}")))?;
    let mut job: ProvisioningJob = serde_json::from_value(record)
        .map_err(|e| ProvisioningError::Serialization(format!("job record decode failed: {e}")))?;

    let owner: Option<String> = row.try_get("lease_owner").map_err(|e| {
        ProvisioningError::Storage(format!("postgres decode lease_owner failed: {e}"))
    })?;
    let acquired_at: Option<DateTime<Utc>> = row.try_get("lease_acquired_at").map_err(|e| {
        ProvisioningError::Storage(format!("postgres decode lease_acquired_at failed: {e}"))
    })?;
    let expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at").map_err(|e| {
        ProvisioningError::Storage(format!("postgres decode lease_expires_at failed: {e}"))
    })?;

    job.lease = match (owner, acquired_at, expires_at) {
        (Some(owner), Some(acquired_at), Some(expires_at)) => Some(JobLease {
            owner,
            acquired_at,
            expires_at,
        }),
        _ => None,
    };
    Ok(job)
}

fn record_json(job: &ProvisioningJob) -> Result<serde_json::Value, ProvisioningError> {
    let mut detached = job.clone();
    detached.lease = None;
    serde_json::to_value(&detached).map_err(|e| ProvisioningError::Serialization(e.to_string()))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn insert_if_absent(
        &self,
        job: ProvisioningJob,
    ) -> Result<InsertOutcome, ProvisioningError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO provision_jobs (
                job_id, event_id, plan_id, state, next_attempt_at, record, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.event_id)
        .bind(&job.plan_id)
        .bind(job.state.as_str())
        .bind(job.next_attempt_at)
        .bind(record_json(&job)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres insert failed: {e}")))?
        .rows_affected();

        if inserted == 1 {
            return Ok(InsertOutcome::Created(job));
        }
        let existing = self.fetch(&job.job_id).await?.ok_or_else(|| {
            ProvisioningError::Storage(format!(
                "insert of job '{}' conflicted but no row exists",
                job.job_id
            ))
        })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn get(&self, job_id: &str) -> Result<Option<ProvisioningJob>, ProvisioningError> {
        self.fetch(job_id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, ProvisioningError> {
        let limit: i64 = filter
            .limit
            .filter(|limit| *limit > 0)
            .map(|limit| limit as i64)
            .unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "{SELECT_JOB}
             WHERE ($1::TEXT IS NULL OR state = $1)
               AND ($2::TEXT IS NULL OR plan_id = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4"
        ))
        .bind(filter.state.map(JobState::as_str))
        .bind(filter.plan_id.as_deref())
        .bind(limit)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres list failed: {e}")))?;

        rows.iter().map(job_from_row).collect()
    }

    async fn acquire_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProvisioningJob, ProvisioningError> {
        let lease = JobLease::grant(owner, now, ttl);
        let row = sqlx::query(
            r#"
            UPDATE provision_jobs
            SET lease_owner = $2, lease_acquired_at = $3, lease_expires_at = $4
            WHERE job_id = $1
              AND (lease_owner IS NULL OR lease_expires_at <= $3)
            RETURNING record, lease_owner, lease_acquired_at, lease_expires_at
            "#,
        )
        .bind(job_id)
        .bind(&lease.owner)
        .bind(lease.acquired_at)
        .bind(lease.expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres lease update failed: {e}")))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        let current = self
            .fetch(job_id)
            .await?
            .ok_or_else(|| ProvisioningError::JobNotFound(job_id.to_string()))?;
        ensure_acquirable(job_id, current.lease.as_ref(), now)?;
        // Lease expired between the update and the read; report it as contended.
        Err(ProvisioningError::LeaseConflict {
            job_id: job_id.to_string(),
            holder: current.lease.map(|l| l.owner).unwrap_or_default(),
            expires_at: now,
        })
    }

    async fn renew_lease(
        &self,
        job_id: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        let renewed = sqlx::query(
            r#"
            UPDATE provision_jobs
            SET lease_expires_at = $3
            WHERE job_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .bind(now + ttl)
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres lease renew failed: {e}")))?
        .rows_affected();

        if renewed == 0 {
            return Err(ProvisioningError::LeaseLost {
                job_id: job_id.to_string(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    async fn save_leased(
        &self,
        job: &ProvisioningJob,
        owner: &str,
    ) -> Result<(), ProvisioningError> {
        let updated = sqlx::query(
            r#"
            UPDATE provision_jobs
            SET state = $3, next_attempt_at = $4, record = $5, updated_at = $6
            WHERE job_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(&job.job_id)
        .bind(owner)
        .bind(job.state.as_str())
        .bind(job.next_attempt_at)
        .bind(record_json(job)?)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres update failed: {e}")))?
        .rows_affected();

        if updated == 0 {
            return Err(ProvisioningError::LeaseLost {
                job_id: job.job_id.clone(),
                owner: owner.to_string(),
            });
        }
        Ok(())
    }

    async fn release_lease(&self, job_id: &str, owner: &str) -> Result<(), ProvisioningError> {
        sqlx::query(
            r#"
            UPDATE provision_jobs
            SET lease_owner = NULL, lease_acquired_at = NULL, lease_expires_at = NULL
            WHERE job_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(job_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres lease release failed: {e}")))?;
        Ok(())
    }

    async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, ProvisioningError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id
            FROM provision_jobs
            WHERE (lease_owner IS NULL OR lease_expires_at <= $1)
              AND (
                state IN ('pending', 'provisioning', 'template_applying')
                OR (state = 'retry_scheduled' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                OR jsonb_array_length(COALESCE(record->'pending_audit', '[]'::jsonb)) > 0
              )
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres due scan failed: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get("job_id").map_err(|e| {
                    ProvisioningError::Storage(format!("postgres decode job_id failed: {e}"))
                })
            })
            .collect()
    }
}
