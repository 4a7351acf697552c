//! Bearer-token verification seam.
//!
//! The identity provider is an external collaborator; the core only needs
//! a verified subject and its workspace memberships. A static-token
//! verifier ships for development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// What a verified token asserts.
#[derive(Debug, Clone)]
pub struct AuthClaims {
    pub subject: String,
    /// Workspaces the subject may act in. `None` means unrestricted
    /// (development verifier only).
    pub workspaces: Option<Vec<Uuid>>,
}

impl AuthClaims {
    pub fn allows(&self, workspace_id: Uuid) -> bool {
        match &self.workspaces {
            None => true,
            Some(list) => list.contains(&workspace_id),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token, returning its claims or `None`.
    async fn verify(&self, token: &str) -> Option<AuthClaims>;
}

/// Development verifier: one shared token, unrestricted claims.
pub struct StaticTokenVerifier {
    token: String,
}

impl StaticTokenVerifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Option<AuthClaims> {
        let expected = self.token.as_bytes();
        let provided = token.as_bytes();
        if expected.is_empty() || expected.len() != provided.len() {
            return None;
        }
        if bool::from(expected.ct_eq(provided)) {
            Some(AuthClaims {
                subject: "dev".to_string(),
                workspaces: None,
            })
        } else {
            None
        }
    }
}

/// Axum middleware: extract the bearer token, verify it, and stash the
/// claims as a request extension.
pub async fn auth_middleware(
    State(verifier): State<Arc<dyn TokenVerifier>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };
    let Some(claims) = verifier.verify(token).await else {
        metrics::counter!("api.auth_rejected").increment(1);
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };

    request.extensions_mut().insert(claims);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_verifier() {
        let verifier = StaticTokenVerifier::new("sekrit");
        assert!(verifier.verify("sekrit").await.is_some());
        assert!(verifier.verify("wrong!").await.is_none());
        assert!(verifier.verify("").await.is_none());

        let empty = StaticTokenVerifier::new("");
        assert!(empty.verify("").await.is_none());
    }

    #[test]
    fn test_claims_scoping() {
        let ws = Uuid::new_v4();
        let open = AuthClaims {
            subject: "dev".into(),
            workspaces: None,
        };
        assert!(open.allows(ws));

        let scoped = AuthClaims {
            subject: "user-1".into(),
            workspaces: Some(vec![ws]),
        };
        assert!(scoped.allows(ws));
        assert!(!scoped.allows(Uuid::new_v4()));
    }
}
