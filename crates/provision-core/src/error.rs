use crate::job::JobState;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Provisioning engine errors.
///
/// Adapter failures are deliberately absent: they are classified at the job-step
/// boundary and drive the state machine instead of surfacing here.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Invalid checkout event: {0}")]
    InvalidEvent(String),

    #[error("Plan '{0}' not found or not published")]
    PlanNotFound(String),

    #[error("Checkout '{event_id}' is not provisionable (payment status '{status}')")]
    PaymentNotCompleted { event_id: String, status: String },

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error("Job '{job_id}' is leased by '{holder}' until {expires_at}")]
    LeaseConflict {
        job_id: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lease on job '{job_id}' is no longer held by '{owner}'")]
    LeaseLost { job_id: String, owner: String },

    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ProvisioningError {
    pub fn invalid_transition(from: JobState, to: JobState) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// True for errors the caller should retry later without treating the job as failed.
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Self::LeaseConflict { .. })
    }
}
