use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Transient failures are retried with backoff; permanent failures kill the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmErrorKind {
    Transient,
    Permanent,
}

impl CrmErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// Classified CRM adapter failure. `message` is recorded verbatim on the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CrmError {
    pub kind: CrmErrorKind,
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl CrmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: CrmErrorKind::Transient,
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: CrmErrorKind::Permanent,
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == CrmErrorKind::Permanent
    }
}

/// Sub-account creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAccountRequest {
    /// Job id; CRMs that support it deduplicate on this key.
    pub idempotency_key: String,
    pub plan_id: String,
    pub customer_id: String,
    pub name: String,
    pub email: Option<String>,
}

/// Template application request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateApplication {
    pub idempotency_key: String,
    pub sub_account_id: String,
    pub template_id: String,
}

/// CRM provisioning boundary.
#[async_trait]
pub trait CrmProvisioner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_sub_account(&self, request: &SubAccountRequest) -> Result<String, CrmError>;

    async fn apply_template(&self, request: &TemplateApplication) -> Result<(), CrmError>;
}

/// Configurable transient/permanent classification of CRM failures.
///
/// Lookup order: API error code, then HTTP status, then the default class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorClassification {
    pub status_codes: HashMap<u16, CrmErrorKind>,
    pub error_codes: HashMap<String, CrmErrorKind>,
    pub default_kind: CrmErrorKind,
}

impl ErrorClassification {
    pub fn classify(&self, status: Option<u16>, code: Option<&str>) -> CrmErrorKind {
        if let Some(kind) = code.and_then(|c| self.error_codes.get(c)) {
            return *kind;
        }
        if let Some(kind) = status.and_then(|s| self.status_codes.get(&s)) {
            return *kind;
        }
        match status {
            Some(s) if (500..600).contains(&s) => CrmErrorKind::Transient,
            _ => self.default_kind,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

impl Default for ErrorClassification {
    fn default() -> Self {
        let status_codes = [
            (400, CrmErrorKind::Permanent),
            (401, CrmErrorKind::Permanent),
            (403, CrmErrorKind::Permanent),
            (404, CrmErrorKind::Permanent),
            (409, CrmErrorKind::Permanent),
            (422, CrmErrorKind::Permanent),
            (408, CrmErrorKind::Transient),
            (425, CrmErrorKind::Transient),
            (429, CrmErrorKind::Transient),
        ]
        .into_iter()
        .collect();

        let error_codes = [
            ("rate_limited", CrmErrorKind::Transient),
            ("snapshot_not_found", CrmErrorKind::Permanent),
            ("invalid_snapshot", CrmErrorKind::Permanent),
            ("account_limit_reached", CrmErrorKind::Permanent),
        ]
        .into_iter()
        .map(|(code, kind)| (code.to_string(), kind))
        .collect();

        Self {
            status_codes,
            error_codes,
            default_kind: CrmErrorKind::Transient,
        }
    }
}
