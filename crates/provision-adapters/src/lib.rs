//! CRM and payment gateway adapters for the provisioning engine.

#![deny(unsafe_code)]

pub mod http;

pub use http::{HttpCrmConfig, HttpCrmError, HttpCrmProvisioner};

use async_trait::async_trait;
use provision_core::{
    CrmError, CrmErrorKind, CrmProvisioner, PaymentLinkError, PaymentLinkIssuer, Plan,
    SubAccountRequest, TemplateApplication,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn short_digest(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex()[..16].to_string()
}

/// Deterministic in-process CRM.
///
/// Honors the idempotency key the way a real CRM does: repeating a creation with
/// the same key returns the sub-account created the first time.
#[derive(Debug, Default)]
pub struct MockCrmProvisioner {
    accounts: Mutex<HashMap<String, String>>,
    applied: Mutex<HashSet<(String, String)>>,
    create_calls: AtomicUsize,
    apply_calls: AtomicUsize,
}

impl MockCrmProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn sub_account_count(&self) -> usize {
        self.accounts.lock().map(|a| a.len()).unwrap_or(0)
    }

    pub fn has_template(&self, sub_account_id: &str, template_id: &str) -> bool {
        self.applied
            .lock()
            .map(|a| a.contains(&(sub_account_id.to_string(), template_id.to_string())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CrmProvisioner for MockCrmProvisioner {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_sub_account(&self, request: &SubAccountRequest) -> Result<String, CrmError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut accounts = self
            .accounts
            .lock()
            .map_err(|_| CrmError::transient("mock CRM state poisoned"))?;
        let id = accounts
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| format!("loc_{}", short_digest(&request.idempotency_key)));
        Ok(id.clone())
    }

    async fn apply_template(&self, request: &TemplateApplication) -> Result<(), CrmError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let known = self
            .accounts
            .lock()
            .map_err(|_| CrmError::transient("mock CRM state poisoned"))?
            .values()
            .any(|id| id == &request.sub_account_id);
        if !known {
            return Err(CrmError::permanent(format!(
                "sub-account '{}' does not exist",
                request.sub_account_id
            ))
            .with_code("location_not_found")
            .with_status(404));
        }

        self.applied
            .lock()
            .map_err(|_| CrmError::transient("mock CRM state poisoned"))?
            .insert((request.sub_account_id.clone(), request.template_id.clone()));
        Ok(())
    }
}

/// Deterministic failing CRM useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailCrm {
    kind: CrmErrorKind,
    reason: String,
}

impl AlwaysFailCrm {
    pub fn new(kind: CrmErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn error(&self) -> CrmError {
        match self.kind {
            CrmErrorKind::Transient => CrmError::transient(self.reason.clone()),
            CrmErrorKind::Permanent => CrmError::permanent(self.reason.clone()),
        }
    }
}

#[async_trait]
impl CrmProvisioner for AlwaysFailCrm {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn create_sub_account(&self, _request: &SubAccountRequest) -> Result<String, CrmError> {
        Err(self.error())
    }

    async fn apply_template(&self, _request: &TemplateApplication) -> Result<(), CrmError> {
        Err(self.error())
    }
}

/// Wraps another CRM and injects queued failures before delegating.
pub struct ScriptedCrm {
    inner: Arc<dyn CrmProvisioner>,
    create_failures: Mutex<VecDeque<CrmError>>,
    apply_failures: Mutex<VecDeque<CrmError>>,
}

impl ScriptedCrm {
    pub fn new(inner: Arc<dyn CrmProvisioner>) -> Self {
        Self {
            inner,
            create_failures: Mutex::new(VecDeque::new()),
            apply_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn fail_next_create(&self, error: CrmError) {
        if let Ok(mut queue) = self.create_failures.lock() {
            queue.push_back(error);
        }
    }

    pub fn fail_next_apply(&self, error: CrmError) {
        if let Ok(mut queue) = self.apply_failures.lock() {
            queue.push_back(error);
        }
    }

    fn pop(queue: &Mutex<VecDeque<CrmError>>) -> Option<CrmError> {
        queue.lock().ok().and_then(|mut q| q.pop_front())
    }
}

#[async_trait]
impl CrmProvisioner for ScriptedCrm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_sub_account(&self, request: &SubAccountRequest) -> Result<String, CrmError> {
        if let Some(err) = Self::pop(&self.create_failures) {
            return Err(err);
        }
        self.inner.create_sub_account(request).await
    }

    async fn apply_template(&self, request: &TemplateApplication) -> Result<(), CrmError> {
        if let Some(err) = Self::pop(&self.apply_failures) {
            return Err(err);
        }
        self.inner.apply_template(request).await
    }
}

/// Issues deterministic hosted-checkout links under a base URL.
#[derive(Debug, Clone)]
pub struct MockPaymentLinkIssuer {
    base_url: String,
}

impl MockPaymentLinkIssuer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for MockPaymentLinkIssuer {
    fn default() -> Self {
        Self::new("https://checkout.local/pay")
    }
}

#[async_trait]
impl PaymentLinkIssuer for MockPaymentLinkIssuer {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn issue_link(&self, plan: &Plan) -> Result<String, PaymentLinkError> {
        if plan.price.amount_minor < 0 {
            return Err(PaymentLinkError(format!(
                "plan '{}' has a negative price",
                plan.plan_id
            )));
        }
        let material = format!(
            "{}:{}:{}",
            plan.plan_id, plan.price.amount_minor, plan.price.currency
        );
        Ok(format!("{}/{}", self.base_url, short_digest(&material)))
    }
}
