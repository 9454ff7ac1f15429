//! Machine-to-machine bearer authentication
//!
//! Non-interactive callers present a pre-issued signed token instead of
//! walking the browser flow. The token is verified cryptographically, then
//! gated on its grant type: only machine-credential issuance may reach the
//! machine path. A browser-issued token with a valid signature is still
//! rejected here — that is a security invariant, not a convenience check.

use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;
use tracing::{debug, warn};

use super::verifier::{IdentityClaims, TokenVerifier, VerifyError};
use crate::error::rpc_codes;

/// Machine-path authentication failures
#[derive(Debug, Error)]
pub enum M2mError {
    /// No `Authorization` header, wrong scheme, or empty token
    #[error("missing or malformed Authorization header; use: Authorization: Bearer <token>")]
    MissingCredential,

    /// The token is valid but was not issued under the machine grant
    #[error("token grant type '{0}' is not allowed on the machine path")]
    GrantTypeMismatch(String),

    /// Token verification failed
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

impl M2mError {
    /// JSON-RPC error code for the machine-path error envelope
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::MissingCredential => rpc_codes::UNAUTHORIZED,
            Self::GrantTypeMismatch(_) => rpc_codes::FORBIDDEN,
            Self::Verify(e) => {
                if e.is_retryable() {
                    rpc_codes::KEY_UNAVAILABLE
                } else {
                    rpc_codes::UNAUTHORIZED
                }
            }
        }
    }
}

/// Extract the bearer token from request headers.
///
/// # Errors
///
/// [`M2mError::MissingCredential`] when the header is absent, uses a scheme
/// other than `Bearer`, or carries an empty token.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, M2mError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .ok_or(M2mError::MissingCredential)?;

    if token.is_empty() {
        return Err(M2mError::MissingCredential);
    }

    Ok(token)
}

/// Authenticator for the machine path
pub struct M2mAuthenticator {
    verifier: Arc<dyn TokenVerifier>,
}

impl M2mAuthenticator {
    /// Create an authenticator delegating to the given verifier
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Authenticate a machine caller from its request headers.
    ///
    /// On success, returns the verified claims for the router to attach to
    /// the forwarded request context.
    ///
    /// # Errors
    ///
    /// See [`M2mError`] for the failure kinds.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<IdentityClaims, M2mError> {
        let token = extract_bearer(headers)?;
        let claims = self.verifier.verify(token).await?;

        if !claims.is_client_credentials() {
            let grant = claims.gty.unwrap_or_else(|| "none".to_string());
            warn!(grant_type = %grant, "Rejected non-machine token on machine path");
            return Err(M2mError::GrantTypeMismatch(grant));
        }

        debug!(subject = %claims.sub, azp = ?claims.azp, "Machine caller authenticated");
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    /// Verifier stub that trusts every token and returns fixed claims
    struct StubVerifier {
        claims: IdentityClaims,
    }

    #[async_trait]
    impl TokenVerifier for StubVerifier {
        async fn verify(&self, _token: &str) -> Result<IdentityClaims, VerifyError> {
            Ok(self.claims.clone())
        }
    }

    /// Verifier stub that always fails with the given kind
    struct FailingVerifier;

    #[async_trait]
    impl TokenVerifier for FailingVerifier {
        async fn verify(&self, _token: &str) -> Result<IdentityClaims, VerifyError> {
            Err(VerifyError::SignatureInvalid)
        }
    }

    fn claims(gty: &str) -> IdentityClaims {
        IdentityClaims {
            sub: "svc1".to_string(),
            iss: Some("https://tenant.auth0.example/".to_string()),
            aud: json!("https://api.example"),
            scope: None,
            azp: Some("client1".to_string()),
            gty: Some(gty.to_string()),
            exp: 4_102_444_800,
            iat: None,
            extra: HashMap::new(),
        }
    }

    fn bearer_headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", value.parse().unwrap());
        headers
    }

    fn authenticator(gty: &str) -> M2mAuthenticator {
        M2mAuthenticator::new(Arc::new(StubVerifier {
            claims: claims(gty),
        }))
    }

    #[tokio::test]
    async fn accepts_machine_credential_tokens() {
        let auth = authenticator("client-credentials");
        let claims = auth
            .authenticate(&bearer_headers("Bearer tok"))
            .await
            .unwrap();
        assert_eq!(claims.sub, "svc1");
        assert_eq!(claims.azp.as_deref(), Some("client1"));
    }

    #[tokio::test]
    async fn rejects_browser_issued_tokens_even_with_valid_signature() {
        let auth = authenticator("authorization_code");
        match auth.authenticate(&bearer_headers("Bearer tok")).await {
            Err(M2mError::GrantTypeMismatch(grant)) => {
                assert_eq!(grant, "authorization_code");
            }
            other => panic!("expected GrantTypeMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn grant_type_mismatch_maps_to_forbidden_code() {
        let auth = authenticator("authorization_code");
        let err = auth
            .authenticate(&bearer_headers("Bearer tok"))
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_code(), rpc_codes::FORBIDDEN);
    }

    #[tokio::test]
    async fn missing_header_is_a_credential_failure() {
        let auth = authenticator("client-credentials");
        let err = auth.authenticate(&HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, M2mError::MissingCredential));
        assert_eq!(err.to_rpc_code(), rpc_codes::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_a_credential_failure() {
        let auth = authenticator("client-credentials");
        let err = auth
            .authenticate(&bearer_headers("Basic dXNlcjpwYXNz"))
            .await
            .unwrap_err();
        assert!(matches!(err, M2mError::MissingCredential));
    }

    #[tokio::test]
    async fn empty_token_is_a_credential_failure() {
        let auth = authenticator("client-credentials");
        let err = auth
            .authenticate(&bearer_headers("Bearer "))
            .await
            .unwrap_err();
        assert!(matches!(err, M2mError::MissingCredential));
    }

    #[tokio::test]
    async fn verification_failure_propagates_as_verify() {
        let auth = M2mAuthenticator::new(Arc::new(FailingVerifier));
        let err = auth
            .authenticate(&bearer_headers("Bearer tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, M2mError::Verify(VerifyError::SignatureInvalid)));
        assert_eq!(err.to_rpc_code(), rpc_codes::UNAUTHORIZED);
    }
}
