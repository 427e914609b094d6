//! HTTP CRM client.
//!
//! Talks to a REST CRM that exposes sub-account creation and snapshot/template
//! application, forwarding the engine's idempotency keys as `Idempotency-Key`
//! headers and classifying failures through an [`ErrorClassification`] table.

use async_trait::async_trait;
use provision_core::{
    CrmError, CrmErrorKind, CrmProvisioner, ErrorClassification, SubAccountRequest,
    TemplateApplication,
};
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Connection settings for the HTTP CRM.
#[derive(Debug, Clone)]
pub struct HttpCrmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub classification: ErrorClassification,
}

impl HttpCrmConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: 30,
            classification: ErrorClassification::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpCrmError {
    #[error("Invalid CRM base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct CreateSubAccountBody<'a> {
    name: &'a str,
    email: Option<&'a str>,
    customer_id: &'a str,
    plan_id: &'a str,
}

#[derive(Debug, Serialize)]
struct ApplyTemplateBody<'a> {
    template_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedSubAccount {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

pub struct HttpCrmProvisioner {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    classification: ErrorClassification,
}

impl HttpCrmProvisioner {
    pub fn new(config: HttpCrmConfig) -> Result<Self, HttpCrmError> {
        let base_url = Url::parse(config.base_url.trim())
            .map_err(|_| HttpCrmError::InvalidBaseUrl(config.base_url.clone()))?;
        if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
            return Err(HttpCrmError::InvalidBaseUrl(config.base_url));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key,
            classification: config.classification,
        })
    }

    /// Base URL extended by `segments`, each percent-encoded as a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, CrmError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CrmError::permanent("CRM base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn post(&self, url: Url, idempotency_key: &str) -> RequestBuilder {
        let request = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, idempotency_key);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, CrmError> {
        let response = request.send().await.map_err(transport_error)?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(self.failure(response).await)
    }

    async fn failure(&self, response: Response) -> CrmError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let code = body.code.or(body.error);
        let detail = body.message.unwrap_or_else(|| text.trim().to_string());

        let kind = self.classification.classify(Some(status), code.as_deref());
        let message = if detail.is_empty() {
            format!("CRM returned {status}")
        } else {
            format!("CRM returned {status}: {detail}")
        };

        let error = match kind {
            CrmErrorKind::Transient => CrmError::transient(message),
            CrmErrorKind::Permanent => CrmError::permanent(message),
        }
        .with_status(status);
        match code {
            Some(code) => error.with_code(code),
            None => error,
        }
    }
}

fn transport_error(err: reqwest::Error) -> CrmError {
    if err.is_timeout() {
        CrmError::transient(format!("CRM request timed out: {err}")).with_code("timeout")
    } else {
        CrmError::transient(format!("CRM unreachable: {err}"))
    }
}

#[async_trait]
impl CrmProvisioner for HttpCrmProvisioner {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_sub_account(&self, request: &SubAccountRequest) -> Result<String, CrmError> {
        let body = CreateSubAccountBody {
            name: &request.name,
            email: request.email.as_deref(),
            customer_id: &request.customer_id,
            plan_id: &request.plan_id,
        };
        let url = self.endpoint(&["sub-accounts"])?;
        let response = self
            .send(self.post(url, &request.idempotency_key).json(&body))
            .await?;

        let created: CreatedSubAccount = response
            .json()
            .await
            .map_err(|e| CrmError::transient(format!("Malformed CRM response: {e}")))?;
        tracing::debug!(
            customer_id = %request.customer_id,
            sub_account_id = %created.id,
            "CRM sub-account created"
        );
        Ok(created.id)
    }

    async fn apply_template(&self, request: &TemplateApplication) -> Result<(), CrmError> {
        let url = self.endpoint(&["sub-accounts", request.sub_account_id.as_str(), "templates"])?;
        let body = ApplyTemplateBody {
            template_id: &request.template_id,
        };
        self.send(self.post(url, &request.idempotency_key).json(&body))
            .await?;
        tracing::debug!(
            sub_account_id = %request.sub_account_id,
            template_id = %request.template_id,
            "CRM template applied"
        );
        Ok(())
    }
}
