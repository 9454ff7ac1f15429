//! Signed-token verification against the provider's published key set
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached; refreshed once on unknown `kid`).
//! 3. Verify the signature and `exp` with `jsonwebtoken`.
//! 4. Check issuer and audience explicitly, so each failure is its own kind.
//!
//! Callers must be able to tell a bad token from a transient key-fetch
//! failure; only the latter is worth retrying, and that policy lives in the
//! cache refresh here, never in per-request handling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::TrustConfig;

/// How long a fetched key set stays fresh
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Clock skew tolerated between the provider and this host
const CLOCK_LEEWAY_SECS: u64 = 60;

/// Token verification failures, narrow by design
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The signature does not verify against the provider's keys
    #[error("token signature verification failed")]
    SignatureInvalid,

    /// The token was issued by someone else
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer this deployment trusts
        expected: String,
        /// Issuer found in the token
        actual: String,
    },

    /// The token was not issued for this audience
    #[error("audience mismatch: token not issued for {expected}")]
    AudienceMismatch {
        /// Audience this deployment expects
        expected: String,
    },

    /// The token is past its expiry
    #[error("token expired")]
    Expired,

    /// The token is not structurally a JWT this gateway can read
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The JWT header carries no `kid`
    #[error("token header missing key id")]
    MissingKeyId,

    /// The `kid` is not in the provider's key set, even after a refresh
    #[error("unknown key id: {0}")]
    UnknownKeyId(String),

    /// The key set could not be retrieved; potentially transient
    #[error("failed to retrieve signing keys: {0}")]
    KeyRetrieval(String),

    /// The key set fetch did not complete within the configured bound
    #[error("signing key fetch timed out after {0}s")]
    KeyRetrievalTimeout(u64),
}

impl VerifyError {
    /// Whether the caller may reasonably retry after a backoff.
    ///
    /// True only for key-retrieval failures; a bad token stays bad.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyRetrieval(_) | Self::KeyRetrievalTimeout(_))
    }
}

/// Normalized claims of a successfully verified token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Subject identifier; always present when verification succeeds
    pub sub: String,
    /// Issuer URL
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience (single string or array)
    #[serde(default)]
    pub aud: Value,
    /// Space-separated scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// Authorized party (the client the token was issued to)
    #[serde(default)]
    pub azp: Option<String>,
    /// Grant type the token was issued under
    #[serde(default)]
    pub gty: Option<String>,
    /// Expiry (Unix timestamp); validated during decoding
    pub exp: u64,
    /// Issued-at (Unix timestamp)
    #[serde(default)]
    pub iat: Option<u64>,
    /// Provider-specific passthrough claims
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl IdentityClaims {
    /// Whether this token was issued under the machine-credentials grant.
    ///
    /// Auth0 spells the claim `client-credentials`; generic providers use
    /// `client_credentials`. Both count.
    #[must_use]
    pub fn is_client_credentials(&self) -> bool {
        self.gty
            .as_deref()
            .is_some_and(|g| g.replace('-', "_") == "client_credentials")
    }
}

/// Contract a token verifier must satisfy.
///
/// Stateless from the caller's view: a pure function of (token, trust
/// parameters) to claims or a narrow failure. Implementations may cache
/// key material internally.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a signed token and return its normalized claims
    async fn verify(&self, token: &str) -> Result<IdentityClaims, VerifyError>;
}

/// Cached JWKS entry; replaced wholesale so readers never see a partial set
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

impl CachedJwks {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= JWKS_TTL
    }
}

/// JWKS-backed verifier for one trust configuration
pub struct JwksVerifier {
    trust: TrustConfig,
    http: reqwest::Client,
    /// Keyed by JWKS URL; one entry per issuer in practice
    cache: DashMap<String, CachedJwks>,
}

impl JwksVerifier {
    /// Create a verifier over the given trust parameters
    #[must_use]
    pub fn new(trust: TrustConfig, http: reqwest::Client) -> Self {
        Self {
            trust,
            http,
            cache: DashMap::new(),
        }
    }

    /// Return the cached key set, fetching if absent or stale
    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet, VerifyError> {
        let jwks_url = self.trust.jwks_url();

        if !force_refresh {
            if let Some(cached) = self.cache.get(&jwks_url) {
                if !cached.is_stale() {
                    return Ok(cached.keys.clone());
                }
            }
        }

        debug!(url = %jwks_url, "Fetching JWKS");
        let timeout = self.trust.http_timeout();
        let response = tokio::time::timeout(timeout, self.http.get(&jwks_url).send())
            .await
            .map_err(|_| VerifyError::KeyRetrievalTimeout(timeout.as_secs()))?
            .map_err(|e| VerifyError::KeyRetrieval(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VerifyError::KeyRetrieval(format!(
                "key endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| VerifyError::KeyRetrieval(e.to_string()))?;

        self.cache.insert(
            jwks_url,
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );

        Ok(jwks)
    }

    /// Find a decoding key by `kid`, refreshing the cache once if not found
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey, VerifyError> {
        let jwks = self.jwks(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks(true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| VerifyError::UnknownKeyId(kid.to_string()))
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<IdentityClaims, VerifyError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        let kid = header.kid.clone().ok_or(VerifyError::MissingKeyId)?;

        let decoding_key = self.find_decoding_key(&kid).await?;

        // Audience and issuer are checked explicitly below so each mismatch
        // surfaces as its own failure kind.
        let mut validation = build_validation(&header);
        validation.validate_aud = false;

        let token_data: TokenData<IdentityClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation).map_err(map_jwt_error)?;
        let claims = token_data.claims;

        let expected_issuer = self.trust.issuer_url();
        let actual_issuer = claims.iss.clone().unwrap_or_default();
        if actual_issuer != expected_issuer {
            return Err(VerifyError::IssuerMismatch {
                expected: expected_issuer,
                actual: actual_issuer,
            });
        }

        if !self.trust.audience.is_empty() && !audience_matches(&claims.aud, &self.trust.audience) {
            return Err(VerifyError::AudienceMismatch {
                expected: self.trust.audience.clone(),
            });
        }

        if claims.sub.is_empty() {
            return Err(VerifyError::Malformed("token has no subject".to_string()));
        }

        Ok(claims)
    }
}

/// Map `jsonwebtoken` failures onto the narrow verification kinds
fn map_jwt_error(e: jsonwebtoken::errors::Error) -> VerifyError {
    use jsonwebtoken::errors::ErrorKind;

    match e.kind() {
        ErrorKind::ExpiredSignature => VerifyError::Expired,
        ErrorKind::InvalidSignature => VerifyError::SignatureInvalid,
        _ => VerifyError::Malformed(e.to_string()),
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = CLOCK_LEEWAY_SECS;
    v
}

/// Whether the token's `aud` claim names the expected audience.
///
/// Providers emit either a single string or an array.
fn audience_matches(aud_claim: &Value, expected: &str) -> bool {
    match aud_claim {
        Value::String(s) => s == expected,
        Value::Array(arr) => arr.iter().any(|v| v.as_str() == Some(expected)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn audience_matches_string_form() {
        assert!(audience_matches(&json!("https://api.example"), "https://api.example"));
        assert!(!audience_matches(&json!("https://other.example"), "https://api.example"));
    }

    #[test]
    fn audience_matches_array_member() {
        let aud = json!(["https://other.example", "https://api.example"]);
        assert!(audience_matches(&aud, "https://api.example"));
        assert!(!audience_matches(&json!([]), "https://api.example"));
    }

    #[test]
    fn audience_rejects_non_string_shapes() {
        assert!(!audience_matches(&json!(null), "https://api.example"));
        assert!(!audience_matches(&json!(42), "https://api.example"));
    }

    #[test]
    fn grant_type_normalizes_hyphen_and_underscore() {
        let mut claims = claims_fixture();

        claims.gty = Some("client-credentials".to_string());
        assert!(claims.is_client_credentials());

        claims.gty = Some("client_credentials".to_string());
        assert!(claims.is_client_credentials());

        claims.gty = Some("authorization_code".to_string());
        assert!(!claims.is_client_credentials());

        claims.gty = None;
        assert!(!claims.is_client_credentials());
    }

    #[test]
    fn claims_capture_passthrough_fields() {
        let claims: IdentityClaims = serde_json::from_value(json!({
            "sub": "svc1",
            "iss": "https://tenant.auth0.example/",
            "aud": "https://api.example",
            "gty": "client-credentials",
            "azp": "client1",
            "exp": 4_102_444_800_u64,
            "permissions": ["read:properties"]
        }))
        .unwrap();

        assert_eq!(claims.sub, "svc1");
        assert_eq!(claims.azp.as_deref(), Some("client1"));
        assert_eq!(claims.extra["permissions"], json!(["read:properties"]));
    }

    #[test]
    fn retryable_is_limited_to_key_retrieval() {
        assert!(VerifyError::KeyRetrieval("down".to_string()).is_retryable());
        assert!(VerifyError::KeyRetrievalTimeout(10).is_retryable());
        assert!(!VerifyError::Expired.is_retryable());
        assert!(!VerifyError::SignatureInvalid.is_retryable());
        assert!(
            !VerifyError::AudienceMismatch {
                expected: "a".to_string()
            }
            .is_retryable()
        );
    }

    fn claims_fixture() -> IdentityClaims {
        IdentityClaims {
            sub: "svc1".to_string(),
            iss: Some("https://tenant.auth0.example/".to_string()),
            aud: json!("https://api.example"),
            scope: None,
            azp: Some("client1".to_string()),
            gty: None,
            exp: 4_102_444_800,
            iat: None,
            extra: HashMap::new(),
        }
    }
}
