use crate::audit::{AuditTransition, PendingAudit};
use crate::error::ProvisioningError;
use crate::lease::JobLease;
use crate::types::CheckoutEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provisioning job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Provisioning,
    TemplateApplying,
    RetryScheduled,
    Succeeded,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Provisioning,
        JobState::TemplateApplying,
        JobState::RetryScheduled,
        JobState::Succeeded,
        JobState::Dead,
    ];

    /// Storage / query-string label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::TemplateApplying => "template_applying",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::Dead => "dead",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == value)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }

    /// States in which an executor performs an adapter call.
    pub fn is_executing(self) -> bool {
        matches!(self, Self::Provisioning | Self::TemplateApplying)
    }

    /// Allowed edges of the job state machine.
    ///
    /// `Dead -> Pending` is the operator retry; `Pending -> TemplateApplying` is only
    /// taken when a sub-account was already recorded before the job died.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Pending, TemplateApplying)
                | (Provisioning, TemplateApplying)
                | (Provisioning, RetryScheduled)
                | (Provisioning, Dead)
                | (TemplateApplying, Succeeded)
                | (TemplateApplying, RetryScheduled)
                | (TemplateApplying, Dead)
                | (RetryScheduled, Provisioning)
                | (RetryScheduled, TemplateApplying)
                | (Dead, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "Pending",
            Self::Provisioning => "Provisioning",
            Self::TemplateApplying => "TemplateApplying",
            Self::RetryScheduled => "RetryScheduled",
            Self::Succeeded => "Succeeded",
            Self::Dead => "Dead",
        };
        f.write_str(label)
    }
}

/// Why the last step failed, or why the job died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    AdapterTransient,
    AdapterPermanent,
    MaxAttemptsExceeded,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdapterTransient => "adapter_transient",
            Self::AdapterPermanent => "adapter_permanent",
            Self::MaxAttemptsExceeded => "max_attempts_exceeded",
        }
    }
}

/// Derive the job id for a checkout event.
///
/// The id doubles as the idempotency key handed to the CRM, so it must be stable
/// across redeliveries and processes.
pub fn derive_job_id(event_id: &str) -> String {
    let digest = blake3::hash(event_id.as_bytes()).to_hex().to_string();
    format!("job_{}", &digest[..32])
}

/// Durable provisioning job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningJob {
    pub job_id: String,
    pub event_id: String,
    pub plan_id: String,
    pub customer_id: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    /// Templates resolved from the catalog when the job was created.
    pub template_ids: Vec<String>,
    /// Templates confirmed applied, in application order.
    #[serde(default)]
    pub applied_templates: Vec<String>,
    pub sub_account_id: Option<String>,
    pub state: JobState,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    /// Class of `last_error`.
    pub failure: Option<FailureClass>,
    #[serde(default)]
    pub dead_reason: Option<FailureClass>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease: Option<JobLease>,
    /// Audit entries for this job already in the log.
    #[serde(default)]
    pub audit_sequence: u64,
    /// Entries saved with the job but not yet in the log.
    #[serde(default)]
    pub pending_audit: Vec<PendingAudit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningJob {
    pub fn from_event(
        event: &CheckoutEvent,
        template_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: derive_job_id(&event.event_id),
            event_id: event.event_id.clone(),
            plan_id: event.plan_id.clone(),
            customer_id: event.customer_id.clone(),
            customer_name: event.customer_name.clone(),
            customer_email: event.customer_email.clone(),
            template_ids,
            applied_templates: Vec::new(),
            sub_account_id: None,
            state: JobState::Pending,
            attempt_count: 0,
            last_error: None,
            failure: None,
            dead_reason: None,
            next_attempt_at: None,
            lease: None,
            audit_sequence: 0,
            pending_audit: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Step a retried or re-queued job resumes at.
    pub fn resume_state(&self) -> JobState {
        if self.sub_account_id.is_some() {
            JobState::TemplateApplying
        } else {
            JobState::Provisioning
        }
    }

    /// Templates not yet confirmed applied, in catalog order.
    pub fn remaining_templates(&self) -> Vec<String> {
        self.template_ids
            .iter()
            .filter(|id| !self.applied_templates.contains(id))
            .cloned()
            .collect()
    }

    /// True when a scheduler should pick the job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let lease_free = self
            .lease
            .as_ref()
            .map(|lease| lease.is_expired(now))
            .unwrap_or(true);
        if !self.pending_audit.is_empty() && lease_free {
            return true;
        }
        match self.state {
            JobState::Pending => true,
            JobState::RetryScheduled => self.next_attempt_at.map(|at| at <= now).unwrap_or(true),
            JobState::Provisioning | JobState::TemplateApplying => lease_free,
            JobState::Succeeded | JobState::Dead => false,
        }
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&mut self, next: JobState) -> Result<JobState, ProvisioningError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(ProvisioningError::invalid_transition(from, next));
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(from)
    }

    /// Queue the audit entry for the transition `from -> self.state`.
    ///
    /// Staged entries are saved with the job and flushed to the log afterwards.
    pub fn stage_audit(&mut self, from: JobState, detail: serde_json::Value) {
        let sequence = self.audit_sequence + self.pending_audit.len() as u64 + 1;
        self.pending_audit.push(PendingAudit {
            sequence,
            transition: AuditTransition::new(from, self.state),
            detail,
        });
    }

    /// Mark staged entries up to and including `sequence` as written.
    pub fn acknowledge_audit(&mut self, sequence: u64) {
        self.pending_audit.retain(|pending| pending.sequence > sequence);
        self.audit_sequence = self.audit_sequence.max(sequence);
    }

    pub fn record_applied(&mut self, template_id: &str) {
        if !self.applied_templates.iter().any(|id| id == template_id) {
            self.applied_templates.push(template_id.to_string());
        }
        self.updated_at = Utc::now();
    }
}

/// Query filter for admin listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub plan_id: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn state(state: JobState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &ProvisioningJob) -> bool {
        self.state.map(|s| s == job.state).unwrap_or(true)
            && self
                .plan_id
                .as_ref()
                .map(|p| p == &job.plan_id)
                .unwrap_or(true)
    }
}
