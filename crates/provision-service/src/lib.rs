#![deny(unsafe_code)]

pub mod auth;
pub mod webhook;

use auth::{require_admin, AdminPrincipal, AdminTokens};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json, Router};
use chrono::Utc;
use provision_adapters::{
    HttpCrmConfig, HttpCrmError, HttpCrmProvisioner, MockCrmProvisioner, MockPaymentLinkIssuer,
};
use provision_core::{
    replay, AuditEntry, AuditQuery, AuditReader, CatalogError, CatalogStore, CrmProvisioner,
    EngineConfig, EngineDeps, ImportReport, JobFilter, JobHandle, JobState, PaymentLinkIssuer,
    PersistentAuditLog, Plan, PlanCatalog, PlanImportRow, ProvisioningEngine, ProvisioningError,
    ProvisioningJob, ProvisioningStores, ReplayedJob, StorageConfig, TenantRecord, TenantRegistry,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use webhook::{WebhookEnvelope, WebhookError, WebhookVerifier, SIGNATURE_HEADER};

/// CRM adapter selection.
#[derive(Debug, Clone, Default)]
pub enum CrmBackend {
    #[default]
    Mock,
    Http(HttpCrmConfig),
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Catalog file; `None` keeps plans and tenants in memory.
    pub catalog_path: Option<PathBuf>,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub crm: CrmBackend,
    /// Webhook signing secret; signature checks are skipped when unset.
    pub webhook_secret: Option<String>,
    /// Bearer tokens for the admin API. With none, every admin request is refused.
    pub admin_tokens: AdminTokens,
    pub payment_link_base: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            catalog_path: Some(PathBuf::from("data/catalog.json")),
            storage: StorageConfig::Memory,
            engine: EngineConfig::default(),
            crm: CrmBackend::Mock,
            webhook_secret: None,
            admin_tokens: AdminTokens::default(),
            payment_link_base: "https://checkout.local/pay".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<ProvisioningEngine>,
    pub catalog: Arc<CatalogStore>,
    pub audit: Arc<PersistentAuditLog>,
    pub links: Arc<dyn PaymentLinkIssuer>,
    pub verifier: Option<WebhookVerifier>,
    pub admin: Arc<AdminTokens>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            catalog_path,
            storage,
            engine,
            crm,
            webhook_secret,
            admin_tokens,
            payment_link_base,
        } = config;

        let catalog = match catalog_path {
            Some(path) => CatalogStore::load(path)?,
            None => CatalogStore::in_memory(),
        };
        let catalog = Arc::new(catalog);

        let storage_label = storage.label();
        let stores = ProvisioningStores::bootstrap(storage).await?;

        let crm: Arc<dyn CrmProvisioner> = match crm {
            CrmBackend::Mock => Arc::new(MockCrmProvisioner::new()),
            CrmBackend::Http(config) => Arc::new(HttpCrmProvisioner::new(config)?),
        };

        let verifier = match webhook_secret.filter(|s| !s.is_empty()) {
            Some(secret) => Some(WebhookVerifier::new(secret)),
            None => {
                warn!("no webhook secret configured; checkout webhooks are accepted unsigned");
                None
            }
        };

        if admin_tokens.is_empty() {
            warn!("no admin tokens configured; admin API requests will be refused");
        }

        let engine = ProvisioningEngine::new(EngineDeps::new(catalog.clone(), &stores, crm), engine);
        info!(
            storage = storage_label,
            crm = engine.crm_name(),
            "provisioning engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            catalog,
            audit: stores.audit,
            links: Arc::new(MockPaymentLinkIssuer::new(payment_link_base)),
            verifier,
            admin: Arc::new(admin_tokens),
        })
    }
}

/// Health and the checkout webhook are public; everything else needs an admin token.
pub fn build_router(state: ServiceState) -> Router {
    let admin = Router::new()
        .route("/v1/plans", get(list_plans))
        .route("/v1/plans/import", post(import_plans))
        .route("/v1/plans/export", get(export_plans))
        .route("/v1/plans/:plan_id", get(get_plan))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/:job_id", get(get_job))
        .route("/v1/jobs/:job_id/retry", post(retry_job))
        .route("/v1/jobs/:job_id/audit", get(job_audit))
        .route("/v1/audit", get(list_audit))
        .route("/v1/tenants", get(list_tenants))
        .route_layer(middleware::from_fn_with_state(
            state.admin.clone(),
            require_admin,
        ));

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/webhooks/checkout", post(checkout_webhook))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] ProvisioningError),
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("CRM adapter error: {0}")]
    Crm(#[from] HttpCrmError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] ProvisioningError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

fn core_status(err: &ProvisioningError) -> StatusCode {
    match err {
        ProvisioningError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        ProvisioningError::PlanNotFound(_) | ProvisioningError::PaymentNotCompleted { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ProvisioningError::JobNotFound(_) => StatusCode::NOT_FOUND,
        ProvisioningError::LeaseConflict { .. } | ProvisioningError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Http { status, message } => (status, message),
            ApiError::Core(err) => (core_status(&err), err.to_string()),
            ApiError::Catalog(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    job_backend: &'static str,
    audit_backend: &'static str,
    crm: &'static str,
    webhook_signatures: bool,
    admin_auth: bool,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "provision-service",
        job_backend: state.engine.job_backend(),
        audit_backend: state.audit.backend_label(),
        crm: state.engine.crm_name(),
        webhook_signatures: state.verifier.is_some(),
        admin_auth: !state.admin.is_empty(),
    })
}

#[derive(Debug, Clone, Serialize)]
struct WebhookResponse {
    status: &'static str,
    event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job: Option<JobHandle>,
}

/// Verify, decode and submit a checkout webhook.
///
/// Answers 200 once the job is durably recorded, so the gateway stops
/// redelivering; provisioning itself runs on the worker.
async fn checkout_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(verifier) = &state.verifier {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        verifier
            .verify(signature, &body, Utc::now().timestamp())
            .map_err(|err: WebhookError| {
                warn!(error = %err, "rejected checkout webhook");
                ApiError::unauthorized(format!("invalid webhook signature: {err}"))
            })?;
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("malformed webhook payload: {e}")))?;

    if !envelope.is_checkout_completed() {
        info!(event_id = %envelope.id, event_type = %envelope.event_type, "ignoring webhook event type");
        return Ok(Json(WebhookResponse {
            status: "ignored",
            event_id: envelope.id,
            job: None,
        }));
    }

    let event_id = envelope.id.clone();
    let event = envelope
        .into_checkout_event()
        .ok_or_else(|| ApiError::bad_request("checkout webhook has no session data"))?;
    let handle = state.engine.submit_checkout_event(event).await?;

    Ok(Json(WebhookResponse {
        status: if handle.created { "queued" } else { "duplicate" },
        event_id,
        job: Some(handle),
    }))
}

#[derive(Debug, Clone, Serialize)]
struct PlanListResponse {
    total: usize,
    items: Vec<Plan>,
}

async fn list_plans(State(state): State<ServiceState>) -> Result<Json<PlanListResponse>, ApiError> {
    let items = state.catalog.list_plans().await?;
    Ok(Json(PlanListResponse {
        total: items.len(),
        items,
    }))
}

async fn get_plan(
    Path(plan_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Plan>, ApiError> {
    state
        .catalog
        .plan(&plan_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("plan '{}' not found", plan_id)))
}

#[derive(Debug, Clone, Deserialize)]
struct ImportRequest {
    rows: Vec<PlanImportRow>,
    /// Issue payment links for published plans lacking one (default true).
    issue_links: Option<bool>,
}

async fn import_plans(
    State(state): State<ServiceState>,
    Json(request): Json<ImportRequest>,
) -> Result<Json<ImportReport>, ApiError> {
    if request.rows.is_empty() {
        return Err(ApiError::bad_request("import has no rows"));
    }
    let issuer = request
        .issue_links
        .unwrap_or(true)
        .then(|| state.links.as_ref());
    Ok(Json(state.catalog.import_rows(request.rows, issuer).await?))
}

#[derive(Debug, Clone, Serialize)]
struct ExportResponse {
    rows: Vec<PlanImportRow>,
}

async fn export_plans(State(state): State<ServiceState>) -> Result<Json<ExportResponse>, ApiError> {
    Ok(Json(ExportResponse {
        rows: state.catalog.export_rows()?,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct JobsQuery {
    state: Option<String>,
    plan_id: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct JobListResponse {
    backend: &'static str,
    returned: usize,
    items: Vec<ProvisioningJob>,
}

fn parse_state_filter(state: Option<&str>) -> Result<Option<JobState>, ApiError> {
    match state.map(|value| value.to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => JobState::parse(&value).map(Some).ok_or_else(|| {
            let expected = JobState::ALL
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            ApiError::bad_request(format!(
                "invalid state '{}'; expected one of: {}",
                value, expected
            ))
        }),
    }
}

async fn list_jobs(
    State(state): State<ServiceState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = JobFilter {
        state: parse_state_filter(query.state.as_deref())?,
        plan_id: query.plan_id,
        limit: Some(query.limit.unwrap_or(100).min(1000)),
        offset: query.offset.unwrap_or(0),
    };
    let items = state.engine.jobs(&filter).await?;
    Ok(Json(JobListResponse {
        backend: state.engine.job_backend(),
        returned: items.len(),
        items,
    }))
}

async fn get_job(
    Path(job_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ProvisioningJob>, ApiError> {
    Ok(Json(state.engine.job(&job_id).await?))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RetryRequest {
    note: Option<String>,
}

/// Re-queue a dead job. The audit entry names the authenticated principal.
async fn retry_job(
    Path(job_id): Path<String>,
    State(state): State<ServiceState>,
    Extension(AdminPrincipal(operator)): Extension<AdminPrincipal>,
    request: Option<Json<RetryRequest>>,
) -> Result<Json<JobHandle>, ApiError> {
    let note = request
        .and_then(|Json(request)| request.note)
        .filter(|note| !note.trim().is_empty());
    Ok(Json(
        state
            .engine
            .retry_dead_job(&job_id, &operator, note)
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct JobAuditResponse {
    job_id: String,
    items: Vec<AuditEntry>,
    replayed: Option<ReplayedJob>,
}

async fn job_audit(
    Path(job_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<JobAuditResponse>, ApiError> {
    // 404 for unknown jobs rather than an empty history.
    state.engine.job(&job_id).await?;
    let items = state
        .audit
        .entries(&AuditQuery {
            job_id: Some(job_id.clone()),
            ..AuditQuery::default()
        })
        .await?;
    let replayed = replay(&items)?;
    Ok(Json(JobAuditResponse {
        job_id,
        items,
        replayed,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct AuditListQuery {
    job_id: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct AuditListResponse {
    backend: &'static str,
    chain_valid: bool,
    returned: usize,
    items: Vec<AuditEntry>,
}

async fn list_audit(
    State(state): State<ServiceState>,
    Query(query): Query<AuditListQuery>,
) -> Result<Json<AuditListResponse>, ApiError> {
    let order = query
        .order
        .as_deref()
        .unwrap_or("desc")
        .to_ascii_lowercase();
    let descending = match order.as_str() {
        "desc" => true,
        "asc" => false,
        _ => {
            return Err(ApiError::bad_request(format!(
                "invalid order '{}'; expected asc or desc",
                order
            )))
        }
    };

    let items = state
        .audit
        .entries(&AuditQuery {
            job_id: query.job_id,
            descending,
            limit: Some(query.limit.unwrap_or(100).min(1000)),
            offset: query.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(AuditListResponse {
        backend: state.audit.backend_label(),
        chain_valid: state.audit.verify_chain().await?,
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Serialize)]
struct TenantListResponse {
    total: usize,
    items: Vec<TenantRecord>,
}

async fn list_tenants(
    State(state): State<ServiceState>,
) -> Result<Json<TenantListResponse>, ApiError> {
    let items = state.catalog.tenants().await?;
    Ok(Json(TenantListResponse {
        total: items.len(),
        items,
    }))
}
