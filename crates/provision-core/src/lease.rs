use crate::error::ProvisioningError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive, time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLease {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl JobLease {
    pub fn grant(owner: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// Check whether `current` allows a new holder to take the job.
///
/// Only an absent or expired lease can be taken; a live lease is exclusive even for
/// the same owner token.
pub fn ensure_acquirable(
    job_id: &str,
    current: Option<&JobLease>,
    now: DateTime<Utc>,
) -> Result<(), ProvisioningError> {
    match current {
        Some(lease) if !lease.is_expired(now) => Err(ProvisioningError::LeaseConflict {
            job_id: job_id.to_string(),
            holder: lease.owner.clone(),
            expires_at: lease.expires_at,
        }),
        _ => Ok(()),
    }
}

/// Check that `owner` still holds the lease recorded for the job.
pub fn ensure_held(
    job_id: &str,
    current: Option<&JobLease>,
    owner: &str,
) -> Result<(), ProvisioningError> {
    match current {
        Some(lease) if lease.is_held_by(owner) => Ok(()),
        _ => Err(ProvisioningError::LeaseLost {
            job_id: job_id.to_string(),
            owner: owner.to_string(),
        }),
    }
}
