//! Session/authorization provider seam
//!
//! The gateway never mints caller-facing sessions itself; an external
//! provider owns token issuance, client registration, and session storage.
//! This module is the contract that collaborator must satisfy. The gateway
//! hands it a normalized identity at the end of the browser flow and relays
//! its token/registration endpoints unchanged.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::AuthorizationRequest;

/// Session provider failures
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the request as malformed (caller at fault)
    #[error("session provider rejected the request: {0}")]
    Rejected(String),

    /// The presented session token is invalid or expired
    #[error("invalid or expired session token")]
    Unauthorized,

    /// The provider could not be reached or failed internally
    #[error("session provider unavailable: {0}")]
    Unavailable(String),
}

/// Identity record attached to a minted session.
///
/// Constructed once by the gateway after the browser flow completes and
/// owned by the provider afterwards; the gateway never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProps {
    /// Email address, when the identity token carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name, when the identity token carried one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stable subject identifier from the identity provider
    #[serde(rename = "sub")]
    pub subject: String,
}

/// Everything the provider needs to mint a session at the end of a flow
#[derive(Debug, Clone)]
pub struct SessionCompletion {
    /// The caller's original authorization request
    pub request: AuthorizationRequest,
    /// Scope the session is limited to (from the original request)
    pub scope: String,
    /// Provider-side key for the session, the identity's subject
    pub user_id: String,
    /// Human-readable label for consent/administration screens
    pub label: String,
    /// Opaque identity metadata carried on the session
    pub props: SessionProps,
}

/// Result of a completed authorization
#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    /// Where to send the caller to finish its own flow
    pub redirect_to: String,
}

/// The session/authorization provider collaborator.
///
/// Implementations live outside this crate; tests use in-memory fakes.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Parse the caller's authorization request from the `/authorize` query.
    ///
    /// The default implementation reads the standard OAuth parameters;
    /// providers with richer request shapes override it.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Rejected`] when the query is not a valid request.
    async fn parse_auth_request(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<AuthorizationRequest, ProviderError> {
        let mut extra = std::collections::BTreeMap::new();
        if let Some(response_type) = query.get("response_type") {
            extra.insert("responseType".to_string(), Value::String(response_type.clone()));
        }

        Ok(AuthorizationRequest {
            client_id: query.get("client_id").cloned().unwrap_or_default(),
            scope: query.get("scope").cloned().unwrap_or_default(),
            redirect_uri: query.get("redirect_uri").cloned(),
            state: query.get("state").cloned(),
            extra,
        })
    }

    /// Mint a session for a verified identity and return the redirect that
    /// sends the caller back into its own flow completion.
    async fn complete_authorization(
        &self,
        completion: SessionCompletion,
    ) -> Result<CompletedAuthorization, ProviderError>;

    /// Validate a session bearer token presented on the tool-serving path
    async fn authenticate(&self, token: &str) -> Result<SessionProps, ProviderError>;

    /// Handle a delegated token-endpoint request, body relayed unchanged
    async fn exchange_token(
        &self,
        form: HashMap<String, String>,
    ) -> Result<Value, ProviderError>;

    /// Handle a delegated client-registration request, body relayed unchanged
    async fn register_client(&self, registration: Value) -> Result<Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DefaultParser;

    #[async_trait]
    impl SessionProvider for DefaultParser {
        async fn complete_authorization(
            &self,
            _completion: SessionCompletion,
        ) -> Result<CompletedAuthorization, ProviderError> {
            unimplemented!("not used in this test")
        }

        async fn authenticate(&self, _token: &str) -> Result<SessionProps, ProviderError> {
            unimplemented!("not used in this test")
        }

        async fn exchange_token(
            &self,
            _form: HashMap<String, String>,
        ) -> Result<Value, ProviderError> {
            unimplemented!("not used in this test")
        }

        async fn register_client(&self, _registration: Value) -> Result<Value, ProviderError> {
            unimplemented!("not used in this test")
        }
    }

    #[tokio::test]
    async fn default_parser_reads_standard_oauth_parameters() {
        let query = HashMap::from([
            ("client_id".to_string(), "abc".to_string()),
            ("scope".to_string(), "openid profile".to_string()),
            ("redirect_uri".to_string(), "https://client.example/cb".to_string()),
            ("response_type".to_string(), "code".to_string()),
        ]);

        let request = DefaultParser.parse_auth_request(&query).await.unwrap();
        assert_eq!(request.client_id, "abc");
        assert_eq!(request.scope, "openid profile");
        assert_eq!(request.redirect_uri.as_deref(), Some("https://client.example/cb"));
        assert_eq!(request.extra["responseType"], "code");
    }

    #[tokio::test]
    async fn default_parser_tolerates_missing_client_id() {
        // Presence of the client id is the router's check, not the parser's
        let request = DefaultParser
            .parse_auth_request(&HashMap::new())
            .await
            .unwrap();
        assert!(request.client_id.is_empty());
    }

    #[test]
    fn session_props_serialize_with_sub_key() {
        let props = SessionProps {
            email: Some("e@x.com".to_string()),
            name: None,
            subject: "u1".to_string(),
        };
        let value = serde_json::to_value(&props).unwrap();
        assert_eq!(value["sub"], "u1");
        assert_eq!(value["email"], "e@x.com");
        assert!(value.get("name").is_none());
    }
}
