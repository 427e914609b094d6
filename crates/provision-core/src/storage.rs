use crate::audit_store::PersistentAuditLog;
use crate::error::ProvisioningError;
use crate::job_store::{InMemoryJobStore, JobStore, PostgresJobStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

/// Persistence backend for jobs and audit entries.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// Keep jobs and audit entries in process memory only.
    #[default]
    Memory,
    /// Persist jobs and audit entries in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

pub(crate) async fn connect_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, ProvisioningError> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .map_err(|e| ProvisioningError::Storage(format!("postgres connect failed: {e}")))
}

/// Job store and audit log sharing one backend.
#[derive(Clone)]
pub struct ProvisioningStores {
    pub jobs: Arc<dyn JobStore>,
    pub audit: Arc<PersistentAuditLog>,
}

impl ProvisioningStores {
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            audit: Arc::new(PersistentAuditLog::in_memory()),
        }
    }

    /// Connect (and migrate) the configured backend.
    pub async fn bootstrap(config: StorageConfig) -> Result<Self, ProvisioningError> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory()),
            StorageConfig::Postgres {
                database_url,
                max_connections,
            } => {
                let pool = connect_pool(&database_url, max_connections).await?;
                let jobs = PostgresJobStore::with_pool(pool.clone()).await?;
                let audit = PersistentAuditLog::with_pool(pool).await?;
                Ok(Self {
                    jobs: Arc::new(jobs),
                    audit: Arc::new(audit),
                })
            }
        }
    }
}
