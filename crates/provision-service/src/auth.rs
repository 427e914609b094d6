//! Bearer-token authentication for the admin API.
//!
//! Tokens are configured as `principal:token` (a bare token authenticates as
//! `admin`). Only SHA-256 digests are kept in memory.

use crate::ApiError;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_PRINCIPAL: &str = "admin";
pub const MIN_TOKEN_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminTokenError {
    #[error("admin token entry is empty")]
    Empty,
    #[error("admin token for '{0}' is shorter than 16 characters")]
    TooShort(String),
}

/// Operator identity attached to authenticated admin requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminPrincipal(pub String);

#[derive(Clone)]
struct AdminToken {
    principal: String,
    digest: [u8; 32],
}

/// Accepted admin bearer tokens.
#[derive(Clone, Default)]
pub struct AdminTokens {
    tokens: Vec<AdminToken>,
}

impl std::fmt::Debug for AdminTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let principals: Vec<&str> = self.tokens.iter().map(|t| t.principal.as_str()).collect();
        f.debug_struct("AdminTokens")
            .field("principals", &principals)
            .finish()
    }
}

fn digest(token: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(token.as_bytes()));
    out
}

impl AdminTokens {
    pub fn parse<I, S>(entries: I) -> Result<Self, AdminTokenError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                return Err(AdminTokenError::Empty);
            }
            let (principal, token) = match entry.split_once(':') {
                Some((principal, token)) if !principal.trim().is_empty() => {
                    (principal.trim(), token.trim())
                }
                _ => (DEFAULT_PRINCIPAL, entry),
            };
            if token.len() < MIN_TOKEN_LEN {
                return Err(AdminTokenError::TooShort(principal.to_string()));
            }
            tokens.push(AdminToken {
                principal: principal.to_string(),
                digest: digest(token),
            });
        }
        Ok(Self { tokens })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Principal owning `presented`, if any.
    pub fn authenticate(&self, presented: &str) -> Option<&str> {
        let presented = digest(presented);
        // Every entry is compared so the match position does not show in timing.
        let mut found = None;
        for token in &self.tokens {
            let equal = token
                .digest
                .iter()
                .zip(presented.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0;
            if equal && found.is_none() {
                found = Some(token.principal.as_str());
            }
        }
        found
    }
}

/// Rejects requests without a configured bearer token and records the principal.
pub async fn require_admin(
    State(tokens): State<Arc<AdminTokens>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    let Some(presented) = presented else {
        return Err(ApiError::unauthorized("admin bearer token required"));
    };
    let Some(principal) = tokens.authenticate(presented).map(str::to_string) else {
        warn!(path = %request.uri().path(), "rejected admin request with unknown token");
        return Err(ApiError::unauthorized("invalid admin token"));
    };

    request.extensions_mut().insert(AdminPrincipal(principal));
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_and_bare_tokens() {
        let tokens = AdminTokens::parse([
            "ops@acme.test:0123456789abcdef-ops",
            "0123456789abcdef-bare",
        ])
        .unwrap();

        assert_eq!(tokens.authenticate("0123456789abcdef-ops"), Some("ops@acme.test"));
        assert_eq!(tokens.authenticate("0123456789abcdef-bare"), Some(DEFAULT_PRINCIPAL));
        assert_eq!(tokens.authenticate("0123456789abcdef-other"), None);
        assert!(!format!("{tokens:?}").contains("0123456789abcdef"));
    }

    #[test]
    fn rejects_short_and_empty_entries() {
        assert_eq!(
            AdminTokens::parse(["ops:short"]).unwrap_err(),
            AdminTokenError::TooShort("ops".to_string())
        );
        assert_eq!(AdminTokens::parse([" "]).unwrap_err(), AdminTokenError::Empty);
        assert!(AdminTokens::parse(Vec::<String>::new()).unwrap().is_empty());
    }
}
