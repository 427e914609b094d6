use crate::error::ProvisioningError;
use crate::job::{FailureClass, JobState, ProvisioningJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payment status reported by the gateway for a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    NoPaymentRequired,
}

impl PaymentStatus {
    /// Free-trial checkouts carry `no_payment_required` and still provision.
    pub fn is_provisionable(self) -> bool {
        matches!(self, Self::Paid | Self::NoPaymentRequired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Unpaid => "unpaid",
            Self::NoPaymentRequired => "no_payment_required",
        }
    }
}

/// Checkout-completed event as delivered by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutEvent {
    pub event_id: String,
    pub plan_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub payment_status: PaymentStatus,
    pub received_at: DateTime<Utc>,
}

impl CheckoutEvent {
    pub fn new(
        event_id: impl Into<String>,
        plan_id: impl Into<String>,
        customer_id: impl Into<String>,
        payment_status: PaymentStatus,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            plan_id: plan_id.into(),
            customer_id: customer_id.into(),
            customer_name: None,
            customer_email: None,
            payment_status,
            received_at: Utc::now(),
        }
    }

    pub fn with_customer(mut self, name: Option<String>, email: Option<String>) -> Self {
        self.customer_name = name;
        self.customer_email = email;
        self
    }

    pub fn validate(&self) -> Result<(), ProvisioningError> {
        if self.event_id.trim().is_empty() {
            return Err(ProvisioningError::InvalidEvent(
                "event id must not be empty".to_string(),
            ));
        }
        if self.customer_id.trim().is_empty() {
            return Err(ProvisioningError::InvalidEvent(format!(
                "event '{}' has no customer id",
                self.event_id
            )));
        }
        if self.plan_id.trim().is_empty() {
            return Err(ProvisioningError::PlanNotFound(String::new()));
        }
        Ok(())
    }
}

/// Handle returned from submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub event_id: String,
    pub state: JobState,
    /// False when the event was a redelivery of an already-known checkout.
    pub created: bool,
}

impl JobHandle {
    pub fn for_job(job: &ProvisioningJob, created: bool) -> Self {
        Self {
            job_id: job.job_id.clone(),
            event_id: job.event_id.clone(),
            state: job.state,
            created,
        }
    }
}

/// Result of a single `run_job` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        job_id: String,
        sub_account_id: String,
    },
    RetryScheduled {
        job_id: String,
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        job_id: String,
        attempt_count: u32,
        reason: FailureClass,
        error: Option<String>,
    },
    /// Retry time has not been reached yet; nothing was executed.
    Deferred {
        job_id: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Job was already terminal; nothing was executed.
    AlreadyTerminal { job_id: String, state: JobState },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Succeeded { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::Dead { job_id, .. }
            | Self::Deferred { job_id, .. }
            | Self::AlreadyTerminal { job_id, .. } => job_id,
        }
    }
}
