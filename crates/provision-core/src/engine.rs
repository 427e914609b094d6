//! Provisioning job engine.
//!
//! Submission only records a job and wakes the worker. Execution happens in
//! `run_job`, which holds the job's lease for the whole invocation and persists
//! after every confirmed adapter call, so a crashed or retried run resumes at the
//! first unconfirmed step and never repeats a confirmed one.
//!
//! The lease is renewed before every adapter call. Audit entries are staged on
//! the job record, saved with it, then flushed to the audit log; a run that finds
//! staged entries flushes them before doing anything else.

use crate::audit::AuditSink;
use crate::catalog::{CatalogStore, PlanCatalog, TemplateRegistry, TenantRecord, TenantRegistry};
use crate::crm::{CrmError, CrmProvisioner, SubAccountRequest, TemplateApplication};
use crate::error::ProvisioningError;
use crate::job::{derive_job_id, FailureClass, JobFilter, JobState, ProvisioningJob};
use crate::job_store::{InsertOutcome, JobStore};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::ProvisioningStores;
use crate::types::{CheckoutEvent, JobHandle, JobOutcome};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Prefix of lease owner tokens issued by this engine.
    pub worker_id: String,
    pub lease_ttl_secs: i64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_id: "provisiond".to_string(),
            lease_ttl_secs: 120,
            retry: RetryPolicy::default(),
        }
    }
}

/// Collaborators injected into the engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub plans: Arc<dyn PlanCatalog>,
    pub templates: Arc<dyn TemplateRegistry>,
    pub tenants: Arc<dyn TenantRegistry>,
    pub jobs: Arc<dyn JobStore>,
    pub audit: Arc<dyn AuditSink>,
    pub crm: Arc<dyn CrmProvisioner>,
}

impl EngineDeps {
    /// Wire a catalog store, a storage backend and a CRM adapter together.
    pub fn new(
        catalog: Arc<CatalogStore>,
        stores: &ProvisioningStores,
        crm: Arc<dyn CrmProvisioner>,
    ) -> Self {
        Self {
            plans: catalog.clone(),
            templates: catalog.clone(),
            tenants: catalog,
            jobs: stores.jobs.clone(),
            audit: stores.audit.clone(),
            crm,
        }
    }
}

pub struct ProvisioningEngine {
    plans: Arc<dyn PlanCatalog>,
    templates: Arc<dyn TemplateRegistry>,
    tenants: Arc<dyn TenantRegistry>,
    jobs: Arc<dyn JobStore>,
    audit: Arc<dyn AuditSink>,
    crm: Arc<dyn CrmProvisioner>,
    wake: Arc<Notify>,
    config: EngineConfig,
}

impl ProvisioningEngine {
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self {
            plans: deps.plans,
            templates: deps.templates,
            tenants: deps.tenants,
            jobs: deps.jobs,
            audit: deps.audit,
            crm: deps.crm,
            wake: Arc::new(Notify::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn crm_name(&self) -> &'static str {
        self.crm.name()
    }

    pub fn job_backend(&self) -> &'static str {
        self.jobs.backend_label()
    }

    /// Notified whenever a job becomes runnable.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Record a checkout as a pending job.
    ///
    /// Redeliveries of a known event return the existing job and touch nothing else.
    pub async fn submit_checkout_event(
        &self,
        event: CheckoutEvent,
    ) -> Result<JobHandle, ProvisioningError> {
        event.validate()?;
        if !event.payment_status.is_provisionable() {
            return Err(ProvisioningError::PaymentNotCompleted {
                event_id: event.event_id.clone(),
                status: event.payment_status.as_str().to_string(),
            });
        }

        let job_id = derive_job_id(&event.event_id);
        if let Some(existing) = self.jobs.get(&job_id).await? {
            debug!(job_id = %job_id, event_id = %event.event_id, "duplicate checkout event");
            return Ok(JobHandle::for_job(&existing, false));
        }

        let plan = self
            .plans
            .published_plan(&event.plan_id)
            .await?
            .ok_or_else(|| ProvisioningError::PlanNotFound(event.plan_id.clone()))?;
        let templates = self.templates.templates_for(&plan.plan_id).await?;
        if templates.is_empty() {
            return Err(ProvisioningError::Catalog(format!(
                "plan '{}' has no templates to apply",
                plan.plan_id
            )));
        }

        let job = ProvisioningJob::from_event(&event, templates, Utc::now());
        match self.jobs.insert_if_absent(job).await? {
            InsertOutcome::Created(job) => {
                info!(
                    job_id = %job.job_id,
                    event_id = %job.event_id,
                    plan_id = %job.plan_id,
                    "provisioning job created"
                );
                self.wake.notify_one();
                Ok(JobHandle::for_job(&job, true))
            }
            InsertOutcome::Existing(job) => Ok(JobHandle::for_job(&job, false)),
        }
    }

    /// Execute or resume a job until it succeeds, dies, or schedules a retry.
    pub async fn run_job(&self, job_id: &str) -> Result<JobOutcome, ProvisioningError> {
        let owner = self.lease_token();
        let mut job = self
            .jobs
            .acquire_lease(job_id, &owner, self.lease_ttl(), Utc::now())
            .await?;

        let result = self.drive(&mut job, &owner).await;

        if let Err(err) = self.jobs.release_lease(job_id, &owner).await {
            warn!(job_id, error = %err, "failed to release job lease");
        }
        if let Err(err) = &result {
            warn!(job_id, state = %job.state, error = %err, "job run aborted");
        }
        result
    }

    /// Operator retry of a dead job. Recorded progress is kept; attempts reset.
    pub async fn retry_dead_job(
        &self,
        job_id: &str,
        operator: &str,
        note: Option<String>,
    ) -> Result<JobHandle, ProvisioningError> {
        let owner = self.lease_token();
        let mut job = self
            .jobs
            .acquire_lease(job_id, &owner, self.lease_ttl(), Utc::now())
            .await?;

        let result = self.requeue_dead(&mut job, &owner, operator, note).await;

        if let Err(err) = self.jobs.release_lease(job_id, &owner).await {
            warn!(job_id, error = %err, "failed to release job lease");
        }
        if result.is_ok() {
            self.wake.notify_one();
        }
        result
    }

    pub async fn job(&self, job_id: &str) -> Result<ProvisioningJob, ProvisioningError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or_else(|| ProvisioningError::JobNotFound(job_id.to_string()))
    }

    pub async fn jobs(&self, filter: &JobFilter) -> Result<Vec<ProvisioningJob>, ProvisioningError> {
        self.jobs.list(filter).await
    }

    /// Ids of jobs runnable now.
    pub async fn due_jobs(&self, limit: usize) -> Result<Vec<String>, ProvisioningError> {
        self.jobs.due_jobs(Utc::now(), limit).await
    }

    fn lease_token(&self) -> String {
        format!("{}:{}", self.config.worker_id, Uuid::new_v4())
    }

    fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.config.lease_ttl_secs.max(1))
    }

    async fn drive(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
    ) -> Result<JobOutcome, ProvisioningError> {
        self.flush_audit(job, owner).await?;
        if job.state.is_terminal() {
            return Ok(JobOutcome::AlreadyTerminal {
                job_id: job.job_id.clone(),
                state: job.state,
            });
        }
        if job.state == JobState::RetryScheduled {
            if let Some(at) = job.next_attempt_at.filter(|at| *at > Utc::now()) {
                return Ok(JobOutcome::Deferred {
                    job_id: job.job_id.clone(),
                    next_attempt_at: at,
                });
            }
        }

        if job.state.is_executing() {
            info!(job_id = %job.job_id, state = %job.state, "resuming interrupted job");
        } else {
            let next = job.resume_state();
            job.transition(next)?;
            job.next_attempt_at = None;
            self.jobs.save_leased(job, owner).await?;
            debug!(job_id = %job.job_id, state = %job.state, attempt = job.attempt_count, "job dispatched");
        }

        if job.state == JobState::Provisioning {
            if let Some(outcome) = self.create_sub_account(job, owner).await? {
                return Ok(outcome);
            }
        }
        self.apply_templates(job, owner).await
    }

    /// Returns `Some` when the step failed and the job left the happy path.
    async fn create_sub_account(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
    ) -> Result<Option<JobOutcome>, ProvisioningError> {
        let request = SubAccountRequest {
            idempotency_key: job.job_id.clone(),
            plan_id: job.plan_id.clone(),
            customer_id: job.customer_id.clone(),
            name: job
                .customer_name
                .clone()
                .unwrap_or_else(|| job.customer_id.clone()),
            email: job.customer_email.clone(),
        };

        self.renew_lease(job, owner).await?;
        let created = match self.crm.create_sub_account(&request).await {
            Ok(id) if id.trim().is_empty() => Err(CrmError::transient(
                "CRM returned an empty sub-account id",
            )),
            other => other,
        };

        match created {
            Ok(sub_account_id) => {
                job.sub_account_id = Some(sub_account_id.clone());
                let from = job.transition(JobState::TemplateApplying)?;
                let detail = json!({
                    "step": "create_sub_account",
                    "crm": self.crm.name(),
                    "sub_account_id": sub_account_id,
                    "attempt_count": job.attempt_count,
                });
                self.commit(job, owner, from, detail).await?;
                info!(job_id = %job.job_id, sub_account_id = %sub_account_id, "sub-account created");
                Ok(None)
            }
            Err(err) => self
                .record_failure(job, owner, "create_sub_account", None, err)
                .await
                .map(Some),
        }
    }

    async fn apply_templates(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
    ) -> Result<JobOutcome, ProvisioningError> {
        if job.state != JobState::TemplateApplying {
            return Err(ProvisioningError::InvariantViolation(format!(
                "job '{}' cannot apply templates from {}",
                job.job_id, job.state
            )));
        }
        let sub_account_id = job.sub_account_id.clone().ok_or_else(|| {
            ProvisioningError::InvariantViolation(format!(
                "job '{}' is applying templates without a sub-account",
                job.job_id
            ))
        })?;

        for template_id in job.remaining_templates() {
            let request = TemplateApplication {
                idempotency_key: format!("{}:{}", job.job_id, template_id),
                sub_account_id: sub_account_id.clone(),
                template_id: template_id.clone(),
            };
            self.renew_lease(job, owner).await?;
            match self.crm.apply_template(&request).await {
                Ok(()) => {
                    job.record_applied(&template_id);
                    self.jobs.save_leased(job, owner).await?;
                    debug!(job_id = %job.job_id, template_id = %template_id, "template applied");
                }
                Err(err) => {
                    return self
                        .record_failure(job, owner, "apply_template", Some(&template_id), err)
                        .await;
                }
            }
        }

        // The job only succeeds once the tenant registry knows the sub-account.
        // A failed write leaves it in TemplateApplying with nothing left to apply,
        // so the next run only re-records the tenant.
        let tenant = TenantRecord {
            sub_account_id: sub_account_id.clone(),
            job_id: job.job_id.clone(),
            plan_id: job.plan_id.clone(),
            customer_id: job.customer_id.clone(),
            customer_email: job.customer_email.clone(),
            provisioned_at: Utc::now(),
        };
        if let Err(err) = self.tenants.record_tenant(tenant).await {
            warn!(job_id = %job.job_id, error = %err, "tenant record not written, job stays resumable");
            return Err(err);
        }

        let from = job.transition(JobState::Succeeded)?;
        let detail = json!({
            "step": "apply_template",
            "crm": self.crm.name(),
            "sub_account_id": sub_account_id,
            "applied_templates": job.applied_templates,
            "attempt_count": job.attempt_count,
        });
        self.commit(job, owner, from, detail).await?;

        info!(
            job_id = %job.job_id,
            sub_account_id = %sub_account_id,
            attempts = job.attempt_count,
            "tenant provisioned"
        );
        Ok(JobOutcome::Succeeded {
            job_id: job.job_id.clone(),
            sub_account_id,
        })
    }

    async fn record_failure(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
        step: &str,
        template_id: Option<&str>,
        err: CrmError,
    ) -> Result<JobOutcome, ProvisioningError> {
        job.attempt_count += 1;
        job.last_error = Some(err.message.clone());
        job.failure = Some(if err.is_permanent() {
            FailureClass::AdapterPermanent
        } else {
            FailureClass::AdapterTransient
        });

        let outcome = match self.config.retry.decide(job.attempt_count, err.kind) {
            RetryDecision::RetryAfter(delay) => {
                let at = Utc::now() + delay;
                job.next_attempt_at = Some(at);
                let from = job.transition(JobState::RetryScheduled)?;
                warn!(
                    job_id = %job.job_id,
                    step,
                    attempt = job.attempt_count,
                    retry_in_ms = delay.num_milliseconds(),
                    error = %err,
                    "job step failed, retry scheduled"
                );
                (
                    from,
                    JobOutcome::RetryScheduled {
                        job_id: job.job_id.clone(),
                        attempt_count: job.attempt_count,
                        next_attempt_at: at,
                        error: err.message.clone(),
                    },
                )
            }
            RetryDecision::GiveUp(reason) => {
                job.next_attempt_at = None;
                job.dead_reason = Some(reason);
                let from = job.transition(JobState::Dead)?;
                error!(
                    job_id = %job.job_id,
                    step,
                    attempt = job.attempt_count,
                    reason = reason.as_str(),
                    error = %err,
                    "job dead, operator action required"
                );
                (
                    from,
                    JobOutcome::Dead {
                        job_id: job.job_id.clone(),
                        attempt_count: job.attempt_count,
                        reason,
                        error: job.last_error.clone(),
                    },
                )
            }
        };

        let (from, outcome) = outcome;
        let detail = json!({
            "step": step,
            "crm": self.crm.name(),
            "template_id": template_id,
            "sub_account_id": job.sub_account_id,
            "error": err.message,
            "error_kind": err.kind.as_str(),
            "error_code": err.code,
            "http_status": err.status,
            "attempt_count": job.attempt_count,
            "max_attempts": self.config.retry.max_attempts,
            "next_attempt_at": job.next_attempt_at,
            "dead_reason": job.dead_reason.map(FailureClass::as_str),
        });
        self.commit(job, owner, from, detail).await?;
        Ok(outcome)
    }

    async fn requeue_dead(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
        operator: &str,
        note: Option<String>,
    ) -> Result<JobHandle, ProvisioningError> {
        self.flush_audit(job, owner).await?;
        if job.state != JobState::Dead {
            return Err(ProvisioningError::invalid_transition(
                job.state,
                JobState::Pending,
            ));
        }

        let previous_error = job.last_error.take();
        let previous_attempts = job.attempt_count;
        let previous_reason = job.dead_reason.take();
        job.attempt_count = 0;
        job.failure = None;
        job.next_attempt_at = None;
        let from = job.transition(JobState::Pending)?;
        let detail = json!({
            "operator": operator,
            "note": note,
            "previous_error": previous_error,
            "previous_attempts": previous_attempts,
            "previous_dead_reason": previous_reason.map(FailureClass::as_str),
            "error": Value::Null,
            "attempt_count": 0,
            "sub_account_id": job.sub_account_id,
            "applied_templates": job.applied_templates,
        });
        self.commit(job, owner, from, detail).await?;

        info!(job_id = %job.job_id, operator, "dead job re-queued by operator");
        Ok(JobHandle::for_job(job, false))
    }

    async fn renew_lease(
        &self,
        job: &ProvisioningJob,
        owner: &str,
    ) -> Result<(), ProvisioningError> {
        self.jobs
            .renew_lease(&job.job_id, owner, self.lease_ttl(), Utc::now())
            .await
    }

    /// Save the transition `from -> job.state` together with its audit entry,
    /// then write the entry to the audit log.
    async fn commit(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
        from: JobState,
        detail: Value,
    ) -> Result<(), ProvisioningError> {
        job.stage_audit(from, detail);
        self.jobs.save_leased(job, owner).await?;
        self.flush_audit(job, owner).await
    }

    /// Write staged audit entries in sequence order.
    ///
    /// Entries the log already holds are acknowledged without being duplicated,
    /// so a flush interrupted after the log write but before the job save is safe
    /// to repeat.
    async fn flush_audit(
        &self,
        job: &mut ProvisioningJob,
        owner: &str,
    ) -> Result<(), ProvisioningError> {
        if job.pending_audit.is_empty() {
            return Ok(());
        }

        let mut failure = None;
        for pending in job.pending_audit.clone() {
            match self
                .audit
                .record(&job.job_id, pending.sequence, pending.transition, pending.detail)
                .await
            {
                Ok(entry) => {
                    job.acknowledge_audit(pending.sequence);
                    debug!(
                        job_id = %job.job_id,
                        sequence = entry.sequence,
                        transition = %entry.description,
                        "audit entry recorded"
                    );
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.jobs.save_leased(job, owner).await?;
        match failure {
            Some(err) => {
                warn!(
                    job_id = %job.job_id,
                    pending = job.pending_audit.len(),
                    error = %err,
                    "audit write failed, entries kept on the job"
                );
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{replay, AuditEntry, AuditQuery, AuditReader, AuditTransition};
    use crate::catalog::{BillingInterval, PlanImportRow, PlanStatus};
    use crate::types::PaymentStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingCrm {
        create_calls: AtomicUsize,
        apply_calls: AtomicUsize,
        applied: Mutex<Vec<String>>,
        create_keys: Mutex<Vec<String>>,
        create_failures: Mutex<VecDeque<CrmError>>,
        apply_failures: Mutex<VecDeque<CrmError>>,
        apply_delay: Mutex<Option<std::time::Duration>>,
        applies_in_flight: AtomicUsize,
        max_applies_in_flight: AtomicUsize,
    }

    impl CountingCrm {
        fn fail_create(&self, err: CrmError) {
            self.create_failures.lock().unwrap().push_back(err);
        }

        fn fail_apply(&self, err: CrmError) {
            self.apply_failures.lock().unwrap().push_back(err);
        }

        fn creates(&self) -> usize {
            self.create_calls.load(Ordering::SeqCst)
        }

        fn applies(&self) -> usize {
            self.apply_calls.load(Ordering::SeqCst)
        }

        fn slow_apply(&self, delay: std::time::Duration) {
            *self.apply_delay.lock().unwrap() = Some(delay);
        }
    }

    #[async_trait]
    impl CrmProvisioner for CountingCrm {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn create_sub_account(&self, request: &SubAccountRequest) -> Result<String, CrmError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            self.create_keys
                .lock()
                .unwrap()
                .push(request.idempotency_key.clone());
            if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(format!("sub_{}", &request.idempotency_key[4..12]))
        }

        async fn apply_template(&self, request: &TemplateApplication) -> Result<(), CrmError> {
            self.apply_calls.fetch_add(1, Ordering::SeqCst);
            let running = self.applies_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_applies_in_flight.fetch_max(running, Ordering::SeqCst);
            let delay = *self.apply_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.applies_in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(err) = self.apply_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.applied.lock().unwrap().push(request.template_id.clone());
            Ok(())
        }
    }

    /// Audit sink that rejects the next `failures` writes.
    struct FlakyAudit {
        inner: Arc<dyn AuditSink>,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for FlakyAudit {
        async fn record(
            &self,
            job_id: &str,
            sequence: u64,
            transition: AuditTransition,
            detail: Value,
        ) -> Result<AuditEntry, ProvisioningError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ProvisioningError::Audit("audit database unavailable".into()));
            }
            self.inner.record(job_id, sequence, transition, detail).await
        }
    }

    /// Tenant registry whose writes fail while `down` is set.
    struct FlakyTenants {
        inner: Arc<dyn TenantRegistry>,
        down: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TenantRegistry for FlakyTenants {
        async fn record_tenant(&self, tenant: TenantRecord) -> Result<(), ProvisioningError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(ProvisioningError::Catalog("catalog volume read-only".into()));
            }
            self.inner.record_tenant(tenant).await
        }

        async fn tenants(&self) -> Result<Vec<TenantRecord>, ProvisioningError> {
            self.inner.tenants().await
        }
    }

    struct Harness {
        engine: Arc<ProvisioningEngine>,
        stores: ProvisioningStores,
        catalog: Arc<CatalogStore>,
        crm: Arc<CountingCrm>,
    }

    fn immediate_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    async fn harness(templates: &[&str], retry: RetryPolicy) -> Harness {
        harness_with(
            templates,
            EngineConfig {
                retry,
                ..EngineConfig::default()
            },
            |_| {},
        )
        .await
    }

    async fn harness_with(
        templates: &[&str],
        config: EngineConfig,
        customize: impl FnOnce(&mut EngineDeps),
    ) -> Harness {
        let catalog = Arc::new(CatalogStore::in_memory());
        catalog
            .import_rows(
                vec![PlanImportRow {
                    plan_id: "plan_A".to_string(),
                    name: "Agency Starter".to_string(),
                    description: String::new(),
                    collection: None,
                    price_minor: 9_700,
                    currency: "USD".to_string(),
                    interval: BillingInterval::Month,
                    trial_days: None,
                    template_ids: templates.iter().map(|t| t.to_string()).collect(),
                    status: PlanStatus::Published,
                    payment_link: None,
                }],
                None,
            )
            .await
            .unwrap();

        let stores = ProvisioningStores::in_memory();
        let crm = Arc::new(CountingCrm::default());
        let mut deps = EngineDeps::new(catalog.clone(), &stores, crm.clone());
        customize(&mut deps);
        Harness {
            engine: Arc::new(ProvisioningEngine::new(deps, config)),
            stores,
            catalog,
            crm,
        }
    }

    fn event(event_id: &str, plan_id: &str) -> CheckoutEvent {
        CheckoutEvent::new(event_id, plan_id, "cus_1", PaymentStatus::Paid)
    }

    async fn audit_for(h: &Harness, job_id: &str) -> Vec<crate::audit::AuditEntry> {
        h.stores
            .audit
            .entries(&AuditQuery {
                job_id: Some(job_id.to_string()),
                ..AuditQuery::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn paid_checkout_provisions_tenant_with_two_audit_entries() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();
        assert!(handle.created);
        assert_eq!(handle.state, JobState::Pending);

        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));

        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.state, JobState::Succeeded);
        assert!(job.sub_account_id.is_some());
        assert!(job.lease.is_none());

        let entries = audit_for(&h, &handle.job_id).await;
        let descriptions: Vec<&str> = entries.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["Provisioning->TemplateApplying", "TemplateApplying->Succeeded"]
        );
    }

    #[tokio::test]
    async fn unknown_plan_creates_no_job() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let err = h
            .engine
            .submit_checkout_event(event("evt_1", "plan_Z"))
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::PlanNotFound(ref id) if id == "plan_Z"));
        assert!(h.engine.jobs(&JobFilter::default()).await.unwrap().is_empty());
        assert_eq!(h.crm.creates(), 0);
    }

    #[tokio::test]
    async fn unpaid_and_malformed_events_are_rejected() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let unpaid = CheckoutEvent::new("evt_2", "plan_A", "cus_1", PaymentStatus::Unpaid);
        assert!(matches!(
            h.engine.submit_checkout_event(unpaid).await,
            Err(ProvisioningError::PaymentNotCompleted { .. })
        ));
        assert!(matches!(
            h.engine.submit_checkout_event(event("", "plan_A")).await,
            Err(ProvisioningError::InvalidEvent(_))
        ));

        let trial = CheckoutEvent::new("evt_3", "plan_A", "cus_1", PaymentStatus::NoPaymentRequired);
        assert!(h.engine.submit_checkout_event(trial).await.unwrap().created);
    }

    #[tokio::test]
    async fn permanent_apply_failure_kills_job_after_one_attempt() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        h.crm
            .fail_apply(CrmError::permanent("snapshot tmpl_X not found").with_code("snapshot_not_found"));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Dead { attempt_count: 1, reason: FailureClass::AdapterPermanent, .. }
        ));

        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("snapshot tmpl_X not found"));

        // Terminal states are stable.
        let again = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(again, JobOutcome::AlreadyTerminal { state: JobState::Dead, .. }));
        assert_eq!(h.crm.applies(), 1);
        assert!(h.engine.due_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redelivered_events_never_duplicate_side_effects() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap());
            h.engine.run_job(&handles[0].job_id).await.unwrap();
        }

        assert_eq!(handles.iter().filter(|h| h.created).count(), 1);
        assert!(handles.iter().all(|x| x.job_id == handles[0].job_id));
        assert_eq!(h.engine.jobs(&JobFilter::default()).await.unwrap().len(), 1);
        assert_eq!(h.crm.creates(), 1);
        assert_eq!(h.crm.applies(), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_create_one_sub_account() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let engine = h.engine.clone();
            let job_id = handle.job_id.clone();
            tasks.push(tokio::spawn(async move { engine.run_job(&job_id).await }));
        }
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => {}
                Err(err) => assert!(err.is_lease_conflict(), "unexpected error: {err}"),
            }
        }

        assert_eq!(h.crm.creates(), 1);
        assert_eq!(h.crm.applies(), 1);
        assert_eq!(h.engine.job(&handle.job_id).await.unwrap().state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn retry_resumes_at_template_step() {
        let h = harness(&["tmpl_X"], immediate_retry()).await;
        h.crm.fail_apply(CrmError::transient("502 Bad Gateway").with_status(502));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let first = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(first, JobOutcome::RetryScheduled { attempt_count: 1, .. }));
        assert_eq!(h.engine.due_jobs(10).await.unwrap(), vec![handle.job_id.clone()]);

        let second = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(second, JobOutcome::Succeeded { .. }));
        assert_eq!(h.crm.creates(), 1);
        assert_eq!(h.crm.applies(), 2);

        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("502 Bad Gateway"));

        let entries = audit_for(&h, &handle.job_id).await;
        assert_eq!(entries.len(), 3);
        let replayed = replay(&entries).unwrap().unwrap();
        assert_eq!(replayed.state, job.state);
        assert_eq!(replayed.attempt_count, job.attempt_count);
        assert_eq!(replayed.sub_account_id, job.sub_account_id);
        assert_eq!(replayed.last_error, job.last_error);
    }

    #[tokio::test]
    async fn partial_template_progress_is_not_repeated() {
        let h = harness(&["tmpl_X", "tmpl_Y"], immediate_retry()).await;
        h.crm.fail_apply(CrmError::transient("timeout"));
        h.crm.fail_apply(CrmError::transient("timeout"));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        // First run: tmpl_X fails.
        h.engine.run_job(&handle.job_id).await.unwrap();
        // Second run: tmpl_X fails again.
        h.engine.run_job(&handle.job_id).await.unwrap();
        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));

        let applied = h.crm.applied.lock().unwrap().clone();
        assert_eq!(applied, vec!["tmpl_X".to_string(), "tmpl_Y".to_string()]);
        assert_eq!(h.crm.applies(), 4);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_attempts_then_die() {
        let h = harness(&["tmpl_X"], immediate_retry()).await;
        for _ in 0..10 {
            h.crm.fail_create(CrmError::transient("connection reset"));
        }
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let mut last = None;
        for _ in 0..10 {
            let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
            let done = matches!(outcome, JobOutcome::Dead { .. });
            last = Some(outcome);
            if done {
                break;
            }
        }

        assert!(matches!(
            last,
            Some(JobOutcome::Dead { attempt_count: 5, reason: FailureClass::MaxAttemptsExceeded, .. })
        ));
        assert_eq!(h.crm.creates(), 5);
        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.dead_reason, Some(FailureClass::MaxAttemptsExceeded));
    }

    #[tokio::test]
    async fn scheduled_retry_is_deferred_until_due() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        h.crm.fail_create(CrmError::transient("rate limited").with_status(429));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        h.engine.run_job(&handle.job_id).await.unwrap();
        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Deferred { .. }));
        assert_eq!(h.crm.creates(), 1);
        assert!(h.engine.due_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_lease_blocks_execution() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();
        h.stores
            .jobs
            .acquire_lease(&handle.job_id, "other-worker", Duration::seconds(60), Utc::now())
            .await
            .unwrap();

        let err = h.engine.run_job(&handle.job_id).await.unwrap_err();
        assert!(err.is_lease_conflict());
        assert_eq!(h.crm.creates(), 0);
        assert_eq!(h.engine.job(&handle.job_id).await.unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn operator_retry_requeues_dead_job_with_progress() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        h.crm.fail_apply(CrmError::permanent("template locked"));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();
        h.engine.run_job(&handle.job_id).await.unwrap();

        let requeued = h
            .engine
            .retry_dead_job(&handle.job_id, "ops@example.com", Some("template unlocked".into()))
            .await
            .unwrap();
        assert_eq!(requeued.state, JobState::Pending);
        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.attempt_count, 0);
        assert!(job.last_error.is_none());
        assert!(job.sub_account_id.is_some());

        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));
        assert_eq!(h.crm.creates(), 1);

        let err = h
            .engine
            .retry_dead_job(&handle.job_id, "ops@example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidTransition { .. }));

        let entries = audit_for(&h, &handle.job_id).await;
        let replayed = replay(&entries).unwrap().unwrap();
        assert_eq!(replayed.state, JobState::Succeeded);
        assert_eq!(replayed.attempt_count, 0);
        assert!(replayed.last_error.is_none());
    }

    #[tokio::test]
    async fn long_runs_keep_their_lease_across_adapter_calls() {
        let h = harness_with(
            &["tmpl_1", "tmpl_2", "tmpl_3", "tmpl_4"],
            EngineConfig {
                lease_ttl_secs: 1,
                ..EngineConfig::default()
            },
            |_| {},
        )
        .await;
        h.crm.slow_apply(std::time::Duration::from_millis(600));
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let engine = h.engine.clone();
        let job_id = handle.job_id.clone();
        let first = tokio::spawn(async move { engine.run_job(&job_id).await });

        // Well past the original one-second lease, mid-way through the templates.
        tokio::time::sleep(std::time::Duration::from_millis(1_500)).await;
        assert!(!first.is_finished());
        assert!(h.engine.due_jobs(10).await.unwrap().is_empty());
        let err = h.engine.run_job(&handle.job_id).await.unwrap_err();
        assert!(err.is_lease_conflict(), "unexpected error: {err}");

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));
        assert_eq!(h.crm.creates(), 1);
        assert_eq!(h.crm.applies(), 4);
        assert_eq!(h.crm.max_applies_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_audit_write_is_flushed_by_the_next_run() {
        let h = harness_with(&["tmpl_X"], EngineConfig::default(), |deps| {
            deps.audit = Arc::new(FlakyAudit {
                inner: deps.audit.clone(),
                failures: AtomicUsize::new(1),
            });
        })
        .await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let err = h.engine.run_job(&handle.job_id).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Audit(_)));
        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.state, JobState::TemplateApplying);
        assert_eq!(job.pending_audit.len(), 1);
        assert!(audit_for(&h, &handle.job_id).await.is_empty());
        assert_eq!(h.engine.due_jobs(10).await.unwrap(), vec![handle.job_id.clone()]);

        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));
        assert_eq!(h.crm.creates(), 1);

        let entries = audit_for(&h, &handle.job_id).await;
        let descriptions: Vec<&str> = entries.iter().map(|e| e.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["Provisioning->TemplateApplying", "TemplateApplying->Succeeded"]
        );
        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert!(job.pending_audit.is_empty());
        assert_eq!(job.audit_sequence, 2);
        assert!(h.stores.audit.verify_chain().await.unwrap());
    }

    #[tokio::test]
    async fn terminal_job_with_unwritten_audit_stays_due_until_flushed() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        // Stopped after saving the finished job, before either entry reached the log.
        let owner = "crashed-worker";
        let mut job = h
            .stores
            .jobs
            .acquire_lease(&handle.job_id, owner, Duration::seconds(60), Utc::now())
            .await
            .unwrap();
        job.sub_account_id = Some("sub_1".into());
        job.transition(JobState::Provisioning).unwrap();
        let from = job.transition(JobState::TemplateApplying).unwrap();
        job.stage_audit(from, json!({"sub_account_id": "sub_1"}));
        job.record_applied("tmpl_X");
        let from = job.transition(JobState::Succeeded).unwrap();
        job.stage_audit(from, json!({"sub_account_id": "sub_1"}));
        h.stores.jobs.save_leased(&job, owner).await.unwrap();
        h.stores.jobs.release_lease(&handle.job_id, owner).await.unwrap();

        assert_eq!(h.engine.due_jobs(10).await.unwrap(), vec![handle.job_id.clone()]);
        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::AlreadyTerminal { state: JobState::Succeeded, .. }));
        assert_eq!(audit_for(&h, &handle.job_id).await.len(), 2);
        assert!(h.engine.due_jobs(10).await.unwrap().is_empty());
        assert_eq!(h.crm.creates() + h.crm.applies(), 0);
    }

    #[tokio::test]
    async fn crashed_template_step_resumes_without_recreating_sub_account() {
        let h = harness(&["tmpl_X", "tmpl_Y"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        // A previous executor created the sub-account, applied one template and
        // died; its lease ran out a minute ago.
        let crashed = "worker-a:crashed";
        let mut job = h
            .stores
            .jobs
            .acquire_lease(
                &handle.job_id,
                crashed,
                Duration::seconds(1),
                Utc::now() - Duration::seconds(60),
            )
            .await
            .unwrap();
        job.transition(JobState::Provisioning).unwrap();
        job.sub_account_id = Some("sub_existing".into());
        job.transition(JobState::TemplateApplying).unwrap();
        job.record_applied("tmpl_X");
        h.stores.jobs.save_leased(&job, crashed).await.unwrap();

        assert_eq!(h.engine.due_jobs(10).await.unwrap(), vec![handle.job_id.clone()]);
        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Succeeded { ref sub_account_id, .. } if sub_account_id == "sub_existing"
        ));
        assert_eq!(h.crm.creates(), 0);
        assert_eq!(*h.crm.applied.lock().unwrap(), vec!["tmpl_Y".to_string()]);
    }

    #[tokio::test]
    async fn crashed_provisioning_step_reuses_the_job_idempotency_key() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        // Crashed mid-call: the CRM may already hold the sub-account.
        let crashed = "worker-a:crashed";
        let mut job = h
            .stores
            .jobs
            .acquire_lease(
                &handle.job_id,
                crashed,
                Duration::seconds(1),
                Utc::now() - Duration::seconds(60),
            )
            .await
            .unwrap();
        job.transition(JobState::Provisioning).unwrap();
        h.stores.jobs.save_leased(&job, crashed).await.unwrap();

        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));
        assert_eq!(*h.crm.create_keys.lock().unwrap(), vec![handle.job_id.clone()]);

        // The crashed executor can no longer write.
        assert!(matches!(
            h.stores.jobs.save_leased(&job, crashed).await,
            Err(ProvisioningError::LeaseLost { .. })
        ));
    }

    #[tokio::test]
    async fn tenant_write_failure_is_retried_before_success() {
        let down = Arc::new(AtomicBool::new(true));
        let flag = down.clone();
        let h = harness_with(&["tmpl_X"], EngineConfig::default(), move |deps| {
            deps.tenants = Arc::new(FlakyTenants {
                inner: deps.tenants.clone(),
                down: flag,
            });
        })
        .await;
        let handle = h.engine.submit_checkout_event(event("evt_1", "plan_A")).await.unwrap();

        let err = h.engine.run_job(&handle.job_id).await.unwrap_err();
        assert!(matches!(err, ProvisioningError::Catalog(_)));
        let job = h.engine.job(&handle.job_id).await.unwrap();
        assert_eq!(job.state, JobState::TemplateApplying);
        assert!(job.remaining_templates().is_empty());
        assert_eq!(h.engine.due_jobs(10).await.unwrap(), vec![handle.job_id.clone()]);
        assert!(h.catalog.tenants().await.unwrap().is_empty());

        down.store(false, Ordering::SeqCst);
        let outcome = h.engine.run_job(&handle.job_id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Succeeded { .. }));
        assert_eq!(h.crm.creates(), 1);
        assert_eq!(h.crm.applies(), 1);
        let tenants = h.catalog.tenants().await.unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].job_id, handle.job_id);
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let h = harness(&["tmpl_X"], RetryPolicy::default()).await;
        assert!(matches!(
            h.engine.run_job("job_missing").await,
            Err(ProvisioningError::JobNotFound(_))
        ));
    }
}
