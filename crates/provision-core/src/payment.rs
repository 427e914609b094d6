use crate::catalog::Plan;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("payment link issuance failed: {0}")]
pub struct PaymentLinkError(pub String);

/// Payment gateway boundary used by catalog import.
#[async_trait]
pub trait PaymentLinkIssuer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Issue a hosted checkout link for a published plan.
    async fn issue_link(&self, plan: &Plan) -> Result<String, PaymentLinkError>;
}
