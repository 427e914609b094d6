use crate::error::ProvisioningError;
use crate::job::JobState;
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// State edge recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTransition {
    pub from: JobState,
    pub to: JobState,
}

impl AuditTransition {
    pub fn new(from: JobState, to: JobState) -> Self {
        Self { from, to }
    }

    pub fn describe(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// Hash-chained audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    /// Position in the global chain.
    pub index: u64,
    pub job_id: String,
    /// 1-based position within the job's own history.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub transition: AuditTransition,
    pub description: String,
    pub detail: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Audit entry staged on a job record and written once the job itself is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAudit {
    /// Per-job sequence the entry must land at.
    pub sequence: u64,
    pub transition: AuditTransition,
    pub detail: Value,
}

/// Write side used by the engine.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append the job's entry number `sequence`.
    ///
    /// Re-recording a sequence that is already in the log returns the stored
    /// entry; skipping ahead is an error.
    async fn record(
        &self,
        job_id: &str,
        sequence: u64,
        transition: AuditTransition,
        detail: Value,
    ) -> Result<AuditEntry, ProvisioningError>;
}

/// Query for the admin read path.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub job_id: Option<String>,
    /// Newest first when set.
    pub descending: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Read side used by the admin surface.
#[async_trait]
pub trait AuditReader: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn entries(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, ProvisioningError>;

    async fn verify_chain(&self) -> Result<bool, ProvisioningError>;
}

/// Append-only audit chain. No mutation APIs exist beyond appending.
#[derive(Debug, Default, Clone)]
pub struct AuditChain {
    entries: Vec<AuditEntry>,
    job_sequences: HashMap<String, u64>,
}

impl AuditChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries and verify integrity.
    pub fn from_entries(entries: Vec<AuditEntry>) -> Result<Self, ProvisioningError> {
        let mut job_sequences = HashMap::new();
        for (expected_index, entry) in entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(ProvisioningError::Audit(format!(
                    "audit index gap detected at position {} (found {})",
                    expected_index, entry.index
                )));
            }
            job_sequences.insert(entry.job_id.clone(), entry.sequence);
        }

        let chain = Self {
            entries,
            job_sequences,
        };
        if !chain.verify_chain() {
            return Err(ProvisioningError::Audit(
                "persisted audit hash-chain verification failed".to_string(),
            ));
        }
        Ok(chain)
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    /// Highest per-job sequence committed for `job_id` (0 when none).
    pub fn job_sequence(&self, job_id: &str) -> u64 {
        self.job_sequences.get(job_id).copied().unwrap_or(0)
    }

    pub fn entry_at(&self, job_id: &str, sequence: u64) -> Option<&AuditEntry> {
        self.entries
            .iter()
            .find(|entry| entry.job_id == job_id && entry.sequence == sequence)
    }

    pub fn entries_for_job(&self, job_id: &str) -> Vec<AuditEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let matching = self.entries.iter().filter(|entry| {
            query
                .job_id
                .as_ref()
                .map(|id| id == &entry.job_id)
                .unwrap_or(true)
        });
        let ordered: Vec<&AuditEntry> = if query.descending {
            matching.rev().collect()
        } else {
            matching.collect()
        };
        ordered
            .into_iter()
            .skip(query.offset)
            .take(query.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            if entry.previous_hash != previous_hash {
                return false;
            }
            if entry.entry_hash != compute_entry_hash(entry, previous_hash.as_deref()) {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    pub fn append(
        &mut self,
        job_id: &str,
        transition: AuditTransition,
        detail: Value,
    ) -> Result<AuditEntry, ProvisioningError> {
        let entry = self.build_entry(job_id, transition, detail);
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Build the next entry without mutating the chain.
    pub fn build_entry(&self, job_id: &str, transition: AuditTransition, detail: Value) -> AuditEntry {
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let mut entry = AuditEntry {
            entry_id: Uuid::new_v4().to_string(),
            index: self.entries.len() as u64,
            job_id: job_id.to_string(),
            sequence: self.job_sequences.get(job_id).copied().unwrap_or(0) + 1,
            // Postgres keeps microseconds; hash what will be stored.
            timestamp: Utc::now().trunc_subsecs(6),
            transition,
            description: transition.describe(),
            detail,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = compute_entry_hash(&entry, entry.previous_hash.as_deref());
        entry
    }

    /// Commit a pre-built entry once external durability succeeded.
    pub fn commit_entry(&mut self, entry: AuditEntry) -> Result<(), ProvisioningError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(ProvisioningError::Audit(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }

        let expected_previous = self.entries.last().map(|e| e.entry_hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(ProvisioningError::Audit(
                "commit previous hash mismatch".to_string(),
            ));
        }
        if entry.entry_hash != compute_entry_hash(&entry, entry.previous_hash.as_deref()) {
            return Err(ProvisioningError::Audit(
                "commit hash mismatch for audit entry".to_string(),
            ));
        }

        self.job_sequences
            .insert(entry.job_id.clone(), entry.sequence);
        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(entry: &AuditEntry, previous_hash: Option<&str>) -> String {
    let material = serde_json::json!({
        "index": entry.index,
        "job_id": entry.job_id,
        "sequence": entry.sequence,
        "timestamp": entry.timestamp,
        "transition": entry.transition,
        "detail": entry.detail,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// Job state reconstructed from its audit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayedJob {
    pub job_id: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub sub_account_id: Option<String>,
    pub last_error: Option<String>,
    pub applied_templates: Vec<String>,
}

/// Fold one job's audit entries back into its state.
///
/// Entries are expected in per-job sequence order. Scheduler pickups are not
/// audited, so each entry's `from` is only checked for a legal edge into `to`.
pub fn replay(entries: &[AuditEntry]) -> Result<Option<ReplayedJob>, ProvisioningError> {
    let Some(first) = entries.first() else {
        return Ok(None);
    };

    let mut job = ReplayedJob {
        job_id: first.job_id.clone(),
        state: JobState::Pending,
        attempt_count: 0,
        sub_account_id: None,
        last_error: None,
        applied_templates: Vec::new(),
    };
    let mut expected_sequence = first.sequence;

    for entry in entries {
        if entry.job_id != job.job_id {
            return Err(ProvisioningError::Audit(format!(
                "replay mixes jobs '{}' and '{}'",
                job.job_id, entry.job_id
            )));
        }
        if entry.sequence != expected_sequence {
            return Err(ProvisioningError::Audit(format!(
                "replay sequence gap for job '{}' at {}",
                job.job_id, entry.sequence
            )));
        }
        expected_sequence += 1;

        let edge = entry.transition;
        if !edge.from.can_transition_to(edge.to) {
            return Err(ProvisioningError::invalid_transition(edge.from, edge.to));
        }

        job.state = edge.to;
        if let Some(attempts) = entry.detail.get("attempt_count").and_then(Value::as_u64) {
            job.attempt_count = attempts as u32;
        }
        if let Some(sub_account) = entry.detail.get("sub_account_id").and_then(Value::as_str) {
            job.sub_account_id = Some(sub_account.to_string());
        }
        if let Some(error) = entry.detail.get("error") {
            job.last_error = error.as_str().map(str::to_string);
        }
        if let Some(applied) = entry.detail.get("applied_templates").and_then(Value::as_array) {
            job.applied_templates = applied
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }

    Ok(Some(job))
}
