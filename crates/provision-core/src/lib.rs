//! Checkout-driven tenant provisioning core.
//!
//! A paid checkout becomes exactly one provisioning job. The job engine drives the
//! CRM through sub-account creation and template application as a persisted,
//! lease-serialized state machine, and every outcome transition lands in a
//! hash-chained audit log.

#![deny(unsafe_code)]

pub mod audit;
pub mod audit_store;
pub mod catalog;
pub mod crm;
pub mod engine;
pub mod error;
pub mod job;
pub mod job_store;
pub mod lease;
pub mod payment;
pub mod retry;
pub mod storage;
pub mod types;
pub mod worker;

pub use audit::{
    replay, AuditChain, AuditEntry, AuditQuery, AuditReader, AuditSink, AuditTransition,
    PendingAudit, ReplayedJob,
};
pub use audit_store::PersistentAuditLog;
pub use catalog::{
    BillingInterval, CatalogError, CatalogStore, ImportReport, Plan, PlanCatalog, PlanImportRow,
    PlanPrice, PlanStatus, RejectedRow, TemplateRegistry, TenantRecord, TenantRegistry,
    DEFAULT_TRIAL_DAYS,
};
pub use crm::{
    CrmError, CrmErrorKind, CrmProvisioner, ErrorClassification, SubAccountRequest,
    TemplateApplication,
};
pub use engine::{EngineConfig, EngineDeps, ProvisioningEngine};
pub use error::ProvisioningError;
pub use job::{derive_job_id, FailureClass, JobFilter, JobState, ProvisioningJob};
pub use job_store::{InMemoryJobStore, InsertOutcome, JobStore, PostgresJobStore};
pub use lease::JobLease;
pub use payment::{PaymentLinkError, PaymentLinkIssuer};
pub use retry::{RetryDecision, RetryPolicy};
pub use storage::{ProvisioningStores, StorageConfig};
pub use types::{CheckoutEvent, JobHandle, JobOutcome, PaymentStatus};
pub use worker::{ProvisioningWorker, WorkerConfig};
