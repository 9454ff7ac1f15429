//! Upstream identity provider client
//!
//! The two network legs of the authorization-code flow: composing the
//! redirect to the provider's hosted authorization page, and exchanging the
//! returned code for tokens. The token endpoint is spoken in one of two
//! dialects selected by configuration: a JSON body carrying the provider
//! audience (domain-specific IdPs such as Auth0), or a form-encoded body
//! with HTTP Basic client authentication (generic OAuth providers).

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{AuthorizationRequest, state};
use crate::config::{TokenEndpointStyle, TrustConfig};
use crate::{Error, Result};

/// Authorization-code exchange failures.
///
/// A failed exchange is terminal for that authorization attempt: codes are
/// single-use, so the client never retries.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The token endpoint answered with a non-success status
    #[error("token endpoint returned HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code from the provider
        status: u16,
        /// Response body, truncated for logging safety
        body: String,
    },

    /// The success response is missing a required token
    #[error("token response missing {missing}")]
    Incomplete {
        /// Which token was absent
        missing: &'static str,
    },

    /// The exchange did not complete within the configured bound
    #[error("token exchange timed out after {0}s")]
    Timeout(u64),

    /// Network or decode failure talking to the token endpoint
    #[error("token endpoint request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// Tokens returned by a successful exchange
#[derive(Debug, Clone)]
pub struct TokenResponse {
    /// Access token for the provider's APIs
    pub access_token: String,
    /// OIDC identity token carrying the user claims
    pub id_token: String,
    /// Lifetime in seconds, if the provider reports one
    pub expires_in: Option<u64>,
}

/// Wire shape of the token endpoint response; both tokens are required but
/// either can be absent in a malformed success response.
#[derive(Debug, Deserialize)]
struct RawTokenResponse {
    access_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<u64>,
}

impl RawTokenResponse {
    fn into_token_response(self) -> std::result::Result<TokenResponse, ExchangeError> {
        let access_token = self.access_token.ok_or(ExchangeError::Incomplete {
            missing: "access_token",
        })?;
        let id_token = self.id_token.ok_or(ExchangeError::Incomplete {
            missing: "id_token",
        })?;
        Ok(TokenResponse {
            access_token,
            id_token,
            expires_in: self.expires_in,
        })
    }
}

/// Client for the upstream identity provider
#[derive(Clone)]
pub struct IdpClient {
    trust: TrustConfig,
    http: reqwest::Client,
}

impl IdpClient {
    /// Create a client over the given trust parameters
    #[must_use]
    pub fn new(trust: TrustConfig, http: reqwest::Client) -> Self {
        Self { trust, http }
    }

    /// Compose the redirect URL to the provider's authorization page.
    ///
    /// Deterministic; every dynamic segment is percent-encoded by the query
    /// serializer. The caller's original request rides along as the opaque
    /// `state` value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configured authorization endpoint is
    /// not a valid URL.
    pub fn authorize_url(
        &self,
        request: &AuthorizationRequest,
        callback_url: &str,
    ) -> Result<Url> {
        let mut auth_url = Url::parse(&self.trust.authorize_endpoint())
            .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {e}")))?;

        {
            let mut params = auth_url.query_pairs_mut();
            params.append_pair("client_id", &self.trust.client_id);
            params.append_pair("redirect_uri", callback_url);
            params.append_pair("response_type", "code");
            params.append_pair("scope", &self.trust.scope);

            // Only domain-specific providers understand an audience parameter
            if self.trust.token_style == TokenEndpointStyle::Json
                && !self.trust.audience.is_empty()
            {
                params.append_pair("audience", &self.trust.audience);
            }

            params.append_pair("state", &state::encode(request));
        }

        debug!(
            client_id = %request.client_id,
            redirect_url = %truncate(auth_url.as_str(), 150),
            "Composed authorization redirect"
        );

        Ok(auth_url)
    }

    /// Exchange an authorization code for tokens.
    ///
    /// One POST to the provider's token endpoint; never retried — the code
    /// is single-use and a second attempt would be rejected anyway.
    ///
    /// # Errors
    ///
    /// See [`ExchangeError`] for the failure kinds.
    pub async fn exchange_code(
        &self,
        code: &str,
        callback_url: &str,
    ) -> std::result::Result<TokenResponse, ExchangeError> {
        let token_url = self.trust.token_endpoint();

        let request = match self.trust.token_style {
            TokenEndpointStyle::Json => self.http.post(&token_url).json(&serde_json::json!({
                "grant_type": "authorization_code",
                "client_id": self.trust.client_id,
                "client_secret": self.trust.resolve_client_secret(),
                "code": code,
                "redirect_uri": callback_url,
            })),
            TokenEndpointStyle::FormBasic => self
                .http
                .post(&token_url)
                .basic_auth(&self.trust.client_id, Some(self.trust.resolve_client_secret()))
                .header(reqwest::header::ACCEPT, "application/json")
                .form(&[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", callback_url),
                ]),
        };

        let timeout = self.trust.http_timeout();
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| ExchangeError::Timeout(timeout.as_secs()))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = truncate(&response.text().await.unwrap_or_default(), 500).to_string();
            warn!(status, body = %body, "Token exchange rejected by provider");
            return Err(ExchangeError::Rejected { status, body });
        }

        let raw: RawTokenResponse = response.json().await?;
        raw.into_token_response()
    }
}

/// Truncate a string for logging, never splitting a UTF-8 boundary
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use super::*;

    fn trust(style: TokenEndpointStyle) -> TrustConfig {
        TrustConfig {
            domain: "tenant.auth0.example".to_string(),
            audience: "https://api.example".to_string(),
            client_id: "idp-client".to_string(),
            token_style: style,
            ..TrustConfig::default()
        }
    }

    fn request() -> AuthorizationRequest {
        AuthorizationRequest {
            client_id: "abc".to_string(),
            scope: "openid profile".to_string(),
            redirect_uri: None,
            state: None,
            extra: BTreeMap::new(),
        }
    }

    fn query_map(url: &Url) -> HashMap<String, String> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn authorize_url_carries_configured_client_and_state() {
        let client = IdpClient::new(trust(TokenEndpointStyle::Json), reqwest::Client::new());
        let url = client
            .authorize_url(&request(), "https://gateway.example/callback")
            .unwrap();

        assert_eq!(url.host_str(), Some("tenant.auth0.example"));
        assert_eq!(url.path(), "/authorize");

        let params = query_map(&url);
        assert_eq!(params["client_id"], "idp-client");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["redirect_uri"], "https://gateway.example/callback");
        assert_eq!(params["audience"], "https://api.example");

        // The state decodes back to the caller's original request
        let decoded = state::decode(&params["state"]).unwrap();
        assert_eq!(decoded.client_id, "abc");
        assert_eq!(decoded.scope, "openid profile");
    }

    #[test]
    fn authorize_url_percent_encodes_dynamic_segments() {
        let client = IdpClient::new(trust(TokenEndpointStyle::Json), reqwest::Client::new());
        let url = client
            .authorize_url(&request(), "https://gateway.example/callback?x=1&y=2")
            .unwrap();

        let raw_query = url.query().unwrap();
        assert!(raw_query.contains("redirect_uri=https%3A%2F%2Fgateway.example%2Fcallback%3Fx%3D1%26y%3D2"));
    }

    #[test]
    fn form_basic_style_omits_audience() {
        let client = IdpClient::new(trust(TokenEndpointStyle::FormBasic), reqwest::Client::new());
        let url = client
            .authorize_url(&request(), "https://gateway.example/callback")
            .unwrap();

        assert!(!query_map(&url).contains_key("audience"));
    }

    #[test]
    fn incomplete_token_response_names_the_missing_token() {
        let raw = RawTokenResponse {
            access_token: Some("a".to_string()),
            id_token: None,
            expires_in: None,
        };
        match raw.into_token_response() {
            Err(ExchangeError::Incomplete { missing }) => assert_eq!(missing, "id_token"),
            other => panic!("expected Incomplete, got {other:?}"),
        }

        let raw = RawTokenResponse {
            access_token: None,
            id_token: Some("i".to_string()),
            expires_in: None,
        };
        match raw.into_token_response() {
            Err(ExchangeError::Incomplete { missing }) => assert_eq!(missing, "access_token"),
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 100), "short");
        let s = "ééééé";
        let cut = truncate(s, 3);
        assert!(s.starts_with(cut));
        assert!(cut.len() <= 3);
    }
}
