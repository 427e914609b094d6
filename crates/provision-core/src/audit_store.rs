use crate::audit::{AuditChain, AuditEntry, AuditQuery, AuditReader, AuditSink, AuditTransition};
use crate::error::ProvisioningError;
use crate::job::JobState;
use crate::storage::{connect_pool, StorageConfig};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
enum AuditBackend {
    Memory,
    Postgres(PostgresAuditStore),
}

/// Audit log that keeps the authoritative chain in memory and optionally mirrors
/// each entry to PostgreSQL.
///
/// - Entry hash/index is computed against the in-memory chain first.
/// - Entry is persisted before it is committed in memory.
/// - On startup, PostgreSQL entries are hydrated and hash-verified.
#[derive(Debug)]
pub struct PersistentAuditLog {
    chain: Mutex<AuditChain>,
    backend: AuditBackend,
}

impl PersistentAuditLog {
    pub fn in_memory() -> Self {
        Self {
            chain: Mutex::new(AuditChain::new()),
            backend: AuditBackend::Memory,
        }
    }

    pub async fn bootstrap(config: StorageConfig) -> Result<Self, ProvisioningError> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = connect_pool(&database_url, max_connections).await?;
                Self::with_pool(pool).await
            }
        }
    }

    pub async fn with_pool(pool: PgPool) -> Result<Self, ProvisioningError> {
        let store = PostgresAuditStore { pool };
        store.ensure_schema().await?;
        let entries = store.load_entries().await?;
        Ok(Self {
            chain: Mutex::new(AuditChain::from_entries(entries)?),
            backend: AuditBackend::Postgres(store),
        })
    }

    pub async fn len(&self) -> usize {
        self.chain.lock().await.entries().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl AuditSink for PersistentAuditLog {
    async fn record(
        &self,
        job_id: &str,
        sequence: u64,
        transition: AuditTransition,
        detail: Value,
    ) -> Result<AuditEntry, ProvisioningError> {
        // Held across the insert so index and per-job order match commit order.
        let mut chain = self.chain.lock().await;
        let committed = chain.job_sequence(job_id);
        if sequence <= committed {
            return chain.entry_at(job_id, sequence).cloned().ok_or_else(|| {
                ProvisioningError::Audit(format!(
                    "job '{job_id}' audit entry {sequence} is missing from the chain"
                ))
            });
        }
        if sequence != committed + 1 {
            return Err(ProvisioningError::Audit(format!(
                "job '{job_id}' audit sequence gap: expected {}, got {sequence}",
                committed + 1
            )));
        }
        let entry = chain.build_entry(job_id, transition, detail);

        if let AuditBackend::Postgres(store) = &self.backend {
            store.insert_entry(&entry).await?;
        }

        chain.commit_entry(entry.clone())?;
        Ok(entry)
    }
}

#[async_trait]
impl AuditReader for PersistentAuditLog {
    fn backend_label(&self) -> &'static str {
        match self.backend {
            AuditBackend::Memory => "memory",
            AuditBackend::Postgres(_) => "postgres",
        }
    }

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, ProvisioningError> {
        Ok(self.chain.lock().await.query(query))
    }

    async fn verify_chain(&self) -> Result<bool, ProvisioningError> {
        Ok(self.chain.lock().await.verify_chain())
    }
}

#[derive(Debug, Clone)]
struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    async fn ensure_schema(&self) -> Result<(), ProvisioningError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS provision_audit_entries (
                audit_index BIGINT PRIMARY KEY,
                entry_id TEXT NOT NULL UNIQUE,
                job_id TEXT NOT NULL,
                job_sequence BIGINT NOT NULL,
                entry_timestamp TIMESTAMPTZ NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                description TEXT NOT NULL,
                detail JSONB NOT NULL,
                previous_hash TEXT NULL,
                entry_hash TEXT NOT NULL,
                UNIQUE (job_id, job_sequence)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Audit(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_provision_audit_job_id ON provision_audit_entries (job_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Audit(format!("postgres index create failed: {e}")))?;

        Ok(())
    }

    async fn load_entries(&self) -> Result<Vec<AuditEntry>, ProvisioningError> {
        let rows = sqlx::query(
            r#"
            SELECT
                audit_index,
                entry_id,
                job_id,
                job_sequence,
                entry_timestamp,
                from_state,
                to_state,
                description,
                detail,
                previous_hash,
                entry_hash
            FROM provision_audit_entries
            ORDER BY audit_index ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Audit(format!("postgres load failed: {e}")))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let index: i64 = decode(&row, "audit_index")?;
            let sequence: i64 = decode(&row, "job_sequence")?;
            let from: String = decode(&row, "from_state")?;
            let to: String = decode(&row, "to_state")?;

            entries.push(AuditEntry {
                entry_id: decode(&row, "entry_id")?,
                index: index.try_into().map_err(|_| {
                    ProvisioningError::Audit("negative audit index in storage".to_string())
                })?,
                job_id: decode(&row, "job_id")?,
                sequence: sequence.try_into().map_err(|_| {
                    ProvisioningError::Audit("negative job sequence in storage".to_string())
                })?,
                timestamp: decode(&row, "entry_timestamp")?,
                transition: AuditTransition::new(parse_state(&from)?, parse_state(&to)?),
                description: decode(&row, "description")?,
                detail: decode(&row, "detail")?,
                previous_hash: decode(&row, "previous_hash")?,
                entry_hash: decode(&row, "entry_hash")?,
            });
        }

        Ok(entries)
    }

    async fn insert_entry(&self, entry: &AuditEntry) -> Result<(), ProvisioningError> {
        let index: i64 = entry.index.try_into().map_err(|_| {
            ProvisioningError::Audit("audit index exceeds postgres BIGINT range".to_string())
        })?;
        let sequence: i64 = entry.sequence.try_into().map_err(|_| {
            ProvisioningError::Audit("job sequence exceeds postgres BIGINT range".to_string())
        })?;

        sqlx::query(
            r#"
            INSERT INTO provision_audit_entries (
                audit_index,
                entry_id,
                job_id,
                job_sequence,
                entry_timestamp,
                from_state,
                to_state,
                description,
                detail,
                previous_hash,
                entry_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(index)
        .bind(&entry.entry_id)
        .bind(&entry.job_id)
        .bind(sequence)
        .bind(entry.timestamp)
        .bind(entry.transition.from.as_str())
        .bind(entry.transition.to.as_str())
        .bind(&entry.description)
        .bind(&entry.detail)
        .bind(&entry.previous_hash)
        .bind(&entry.entry_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| ProvisioningError::Audit(format!("postgres insert failed: {e}")))?;

        Ok(())
    }
}

fn decode<'r, T>(row: &'r sqlx::postgres::PgRow, column: &str) -> Result<T, ProvisioningError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| ProvisioningError::Audit(format!("postgres decode {column} failed: {e}")))
}

fn parse_state(value: &str) -> Result<JobState, ProvisioningError> {
    JobState::parse(value).ok_or_else(|| {
        ProvisioningError::Audit(format!("unknown job state '{value}' in postgres"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_backend_appends_in_order_and_verifies() {
        let log = PersistentAuditLog::bootstrap(StorageConfig::memory())
            .await
            .unwrap();

        log.record(
            "job_1",
            1,
            AuditTransition::new(JobState::Provisioning, JobState::TemplateApplying),
            json!({"sub_account_id": "sub_1"}),
        )
        .await
        .unwrap();
        log.record(
            "job_1",
            2,
            AuditTransition::new(JobState::TemplateApplying, JobState::Succeeded),
            json!({}),
        )
        .await
        .unwrap();

        let entries = log
            .entries(&AuditQuery {
                job_id: Some("job_1".to_string()),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sequence, 1);
        assert_eq!(entries[1].sequence, 2);
        assert!(log.verify_chain().await.unwrap());
        assert_eq!(log.backend_label(), "memory");
    }

    #[tokio::test]
    async fn rerecording_a_sequence_returns_the_stored_entry() {
        let log = PersistentAuditLog::bootstrap(StorageConfig::memory())
            .await
            .unwrap();
        let transition = AuditTransition::new(JobState::Provisioning, JobState::TemplateApplying);

        let first = log
            .record("job_1", 1, transition, json!({"sub_account_id": "sub_1"}))
            .await
            .unwrap();
        let again = log
            .record("job_1", 1, transition, json!({"sub_account_id": "sub_1"}))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(log.entries(&AuditQuery::default()).await.unwrap().len(), 1);

        let gap = log
            .record(
                "job_1",
                3,
                AuditTransition::new(JobState::TemplateApplying, JobState::Succeeded),
                json!({}),
            )
            .await;
        assert!(matches!(gap, Err(ProvisioningError::Audit(_))));
    }

    #[test]
    fn state_column_roundtrip() {
        for state in JobState::ALL {
            assert_eq!(parse_state(state.as_str()).unwrap(), state);
        }
        assert!(parse_state("bogus").is_err());
    }
}
