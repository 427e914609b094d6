//! Plan catalog, snapshot template registry and tenant records.
//!
//! Plans come from spreadsheet imports and are never deleted; archiving is a status
//! change. The engine only reads plans and templates, and writes one tenant record
//! per successful job.

use crate::error::ProvisioningError;
use crate::payment::PaymentLinkIssuer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("catalog lock poisoned")]
    LockPoisoned,
}

impl From<CatalogError> for ProvisioningError {
    fn from(err: CatalogError) -> Self {
        ProvisioningError::Catalog(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
    OneTime,
}

pub const DEFAULT_TRIAL_DAYS: u32 = 14;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPrice {
    /// Amount in the currency's minor unit (cents).
    pub amount_minor: i64,
    pub currency: String,
    pub interval: BillingInterval,
    pub trial_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub display_name: String,
    pub description: String,
    pub collection: Option<String>,
    pub price: PlanPrice,
    pub template_ids: Vec<String>,
    pub status: PlanStatus,
    pub payment_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Plan {
    pub fn is_published(&self) -> bool {
        self.status == PlanStatus::Published
    }

    fn same_definition(&self, other: &Plan) -> bool {
        self.display_name == other.display_name
            && self.description == other.description
            && self.collection == other.collection
            && self.price == other.price
            && self.template_ids == other.template_ids
            && self.status == other.status
            && self.payment_link == other.payment_link
    }
}

/// One spreadsheet row as re-imported by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanImportRow {
    pub plan_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub collection: Option<String>,
    pub price_minor: i64,
    pub currency: String,
    #[serde(default = "default_interval")]
    pub interval: BillingInterval,
    #[serde(default)]
    pub trial_days: Option<u32>,
    pub template_ids: Vec<String>,
    #[serde(default = "default_status")]
    pub status: PlanStatus,
    #[serde(default)]
    pub payment_link: Option<String>,
}

fn default_interval() -> BillingInterval {
    BillingInterval::Month
}

fn default_status() -> PlanStatus {
    PlanStatus::Draft
}

impl PlanImportRow {
    fn normalized(&self) -> Result<PlanImportRow, String> {
        let plan_id = self.plan_id.trim();
        if plan_id.is_empty() || plan_id.chars().any(char::is_whitespace) {
            return Err("plan id must be non-empty and contain no whitespace".to_string());
        }
        let name = self.name.trim();
        if name.is_empty() {
            return Err("plan name must not be empty".to_string());
        }
        if self.price_minor < 0 {
            return Err(format!("negative price {}", self.price_minor));
        }
        let currency = self.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid currency '{}'", self.currency));
        }

        let mut seen = HashSet::new();
        let template_ids: Vec<String> = self
            .template_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .filter(|id| seen.insert(id.clone()))
            .collect();
        if self.status == PlanStatus::Published && template_ids.is_empty() {
            return Err("published plan requires at least one template id".to_string());
        }

        Ok(PlanImportRow {
            plan_id: plan_id.to_string(),
            name: name.to_string(),
            description: self.description.trim().to_string(),
            collection: self
                .collection
                .as_ref()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            price_minor: self.price_minor,
            currency,
            interval: self.interval,
            trial_days: self.trial_days,
            template_ids,
            status: self.status,
            payment_link: self
                .payment_link
                .as_ref()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        })
    }

    fn from_plan(plan: &Plan) -> Self {
        Self {
            plan_id: plan.plan_id.clone(),
            name: plan.display_name.clone(),
            description: plan.description.clone(),
            collection: plan.collection.clone(),
            price_minor: plan.price.amount_minor,
            currency: plan.price.currency.clone(),
            interval: plan.price.interval,
            trial_days: Some(plan.price.trial_days),
            template_ids: plan.template_ids.clone(),
            status: plan.status,
            payment_link: plan.payment_link.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// 1-based row number in the submitted batch.
    pub row: usize,
    pub plan_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub rejected: Vec<RejectedRow>,
    pub links_issued: Vec<String>,
    pub link_failures: Vec<RejectedRow>,
}

/// Provisioned tenant, written once per successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub sub_account_id: String,
    pub job_id: String,
    pub plan_id: String,
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub provisioned_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>, ProvisioningError>;

    /// Resolve a plan only if it is currently published.
    async fn published_plan(&self, plan_id: &str) -> Result<Option<Plan>, ProvisioningError> {
        Ok(self.plan(plan_id).await?.filter(Plan::is_published))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, ProvisioningError>;
}

#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    /// CRM template ids to apply for a plan, in application order.
    async fn templates_for(&self, plan_id: &str) -> Result<Vec<String>, ProvisioningError>;
}

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    async fn record_tenant(&self, tenant: TenantRecord) -> Result<(), ProvisioningError>;

    async fn tenants(&self) -> Result<Vec<TenantRecord>, ProvisioningError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogData {
    #[serde(default)]
    plans: BTreeMap<String, Plan>,
    /// Keyed by job id.
    #[serde(default)]
    tenants: BTreeMap<String, TenantRecord>,
}

/// Catalog store persisted to a JSON file after every mutation.
///
/// Without a path the catalog lives in memory only.
#[derive(Debug)]
pub struct CatalogStore {
    path: Option<PathBuf>,
    data: RwLock<CatalogData>,
}

impl CatalogStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(CatalogData::default()),
        }
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                CatalogData::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            CatalogData::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Apply a batch of spreadsheet rows.
    ///
    /// Invalid rows are rejected individually; valid rows are upserted. Published
    /// plans without a payment link get one from `issuer` when provided.
    pub async fn import_rows(
        &self,
        rows: Vec<PlanImportRow>,
        issuer: Option<&dyn PaymentLinkIssuer>,
    ) -> Result<ImportReport, CatalogError> {
        let mut report = ImportReport::default();
        let now = Utc::now();
        let existing = self.read()?.plans.clone();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            let normalized = match row.normalized() {
                Ok(normalized) => normalized,
                Err(reason) => {
                    report.rejected.push(RejectedRow {
                        row: idx + 1,
                        plan_id: row.plan_id.clone(),
                        reason,
                    });
                    continue;
                }
            };
            if !seen.insert(normalized.plan_id.clone()) {
                report.rejected.push(RejectedRow {
                    row: idx + 1,
                    plan_id: normalized.plan_id.clone(),
                    reason: "duplicate plan id in import".to_string(),
                });
                continue;
            }

            let previous = existing.get(&normalized.plan_id);
            let plan = Plan {
                plan_id: normalized.plan_id.clone(),
                display_name: normalized.name,
                description: normalized.description,
                collection: normalized.collection,
                price: PlanPrice {
                    amount_minor: normalized.price_minor,
                    currency: normalized.currency,
                    interval: normalized.interval,
                    trial_days: normalized.trial_days.unwrap_or(DEFAULT_TRIAL_DAYS),
                },
                template_ids: normalized.template_ids,
                status: normalized.status,
                payment_link: normalized
                    .payment_link
                    .or_else(|| previous.and_then(|p| p.payment_link.clone())),
                created_at: previous.map(|p| p.created_at).unwrap_or(now),
                updated_at: now,
            };
            candidates.push((idx + 1, plan));
        }

        if let Some(issuer) = issuer {
            for (row, plan) in candidates.iter_mut() {
                if !plan.is_published() || plan.payment_link.is_some() {
                    continue;
                }
                match issuer.issue_link(plan).await {
                    Ok(link) => {
                        plan.payment_link = Some(link);
                        report.links_issued.push(plan.plan_id.clone());
                    }
                    Err(err) => {
                        warn!(plan_id = %plan.plan_id, issuer = issuer.name(), error = %err, "payment link issuance failed");
                        report.link_failures.push(RejectedRow {
                            row: *row,
                            plan_id: plan.plan_id.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        {
            // Readers keep seeing the old catalog unless the file write succeeds.
            let mut data = self.write()?;
            let mut next = data.clone();
            for (_, plan) in candidates {
                match next.plans.get(&plan.plan_id) {
                    None => report.created.push(plan.plan_id.clone()),
                    Some(current) if current.same_definition(&plan) => {
                        report.unchanged.push(plan.plan_id.clone());
                        continue;
                    }
                    Some(_) => report.updated.push(plan.plan_id.clone()),
                }
                next.plans.insert(plan.plan_id.clone(), plan);
            }
            self.persist(&next)?;
            *data = next;
        }

        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            rejected = report.rejected.len(),
            "plan import applied"
        );
        Ok(report)
    }

    /// Current catalog as spreadsheet rows, grouped by collection.
    pub fn export_rows(&self) -> Result<Vec<PlanImportRow>, CatalogError> {
        let data = self.read()?;
        let mut plans: Vec<&Plan> = data.plans.values().collect();
        plans.sort_by(|a, b| {
            a.collection
                .cmp(&b.collection)
                .then_with(|| a.plan_id.cmp(&b.plan_id))
        });
        Ok(plans.into_iter().map(PlanImportRow::from_plan).collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CatalogData>, CatalogError> {
        self.data.read().map_err(|_| CatalogError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, CatalogData>, CatalogError> {
        self.data.write().map_err(|_| CatalogError::LockPoisoned)
    }

    fn persist(&self, data: &CatalogData) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl PlanCatalog for CatalogStore {
    async fn plan(&self, plan_id: &str) -> Result<Option<Plan>, ProvisioningError> {
        Ok(self.read()?.plans.get(plan_id).cloned())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, ProvisioningError> {
        Ok(self.read()?.plans.values().cloned().collect())
    }
}

#[async_trait]
impl TemplateRegistry for CatalogStore {
    async fn templates_for(&self, plan_id: &str) -> Result<Vec<String>, ProvisioningError> {
        Ok(self
            .read()?
            .plans
            .get(plan_id)
            .map(|plan| plan.template_ids.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl TenantRegistry for CatalogStore {
    async fn record_tenant(&self, tenant: TenantRecord) -> Result<(), ProvisioningError> {
        let mut data = self.write()?;
        if data.tenants.contains_key(&tenant.job_id) {
            return Ok(());
        }
        let mut next = data.clone();
        next.tenants.insert(tenant.job_id.clone(), tenant);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    async fn tenants(&self) -> Result<Vec<TenantRecord>, ProvisioningError> {
        let mut tenants: Vec<TenantRecord> = self.read()?.tenants.values().cloned().collect();
        tenants.sort_by_key(|t| t.provisioned_at);
        Ok(tenants)
    }
}
