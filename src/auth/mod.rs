//! Authentication strategies and their building blocks
//!
//! The gateway supports four deployment variants behind one router:
//! delegated OAuth2 login against an upstream identity provider, bearer
//! validation of machine-issued signed tokens (M2M), a static bearer token,
//! and no authentication at all. The variants are one tagged union selected
//! by configuration, not parallel implementations.

pub mod identity;
pub mod idp;
pub mod m2m;
pub mod session;
pub mod state;
pub mod verifier;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{AuthConfig, TrustConfig};
use crate::{Error, Result};
use idp::IdpClient;
use m2m::M2mAuthenticator;
use session::SessionProvider;
use verifier::JwksVerifier;

/// A caller's original request to start an authorization flow.
///
/// Parsed by the session provider at `/authorize`, round-tripped through the
/// identity provider inside the opaque `state` parameter, and consumed
/// exactly once when the callback completes. Field names are camelCase on
/// the wire to match the session provider's request shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationRequest {
    /// Client identifier of the caller (required, non-empty)
    #[serde(default)]
    pub client_id: String,
    /// Requested scope, space-separated
    #[serde(default)]
    pub scope: String,
    /// Where the caller wants to end up after the flow completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    /// The caller's own state value, relayed untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Provider-specific passthrough fields (e.g. `responseType`)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The authentication strategy selected for this deployment.
///
/// Constructed once at startup from [`AuthConfig`] and injected into the
/// router; never a hidden singleton.
pub enum AuthStrategy {
    /// Delegated OAuth2 authorization-code flow against an upstream IdP.
    ///
    /// The session provider mints caller-facing sessions; an optional
    /// machine path validates M2M bearer tokens against the same trust
    /// configuration.
    OAuth {
        /// Upstream IdP client for the two browser-flow network legs
        idp: IdpClient,
        /// Session/authorization provider collaborator
        sessions: Arc<dyn SessionProvider>,
        /// Machine-path authenticator, when the deployment enables it
        machine: Option<M2mAuthenticator>,
    },
    /// Machine-to-machine bearer validation only
    M2m {
        /// Machine-path authenticator
        machine: M2mAuthenticator,
    },
    /// Static bearer token, compared in constant time
    StaticBearer {
        /// The expected token value
        token: String,
    },
    /// No authentication; every request passes through
    Disabled,
}

impl AuthStrategy {
    /// Build the strategy from configuration.
    ///
    /// The delegated-OAuth variant needs a session provider, which only an
    /// embedding application can supply; `sessions` is therefore optional
    /// here and validated against the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the mode's required parameters are
    /// missing or if `mode: oauth` is selected without a session provider.
    pub fn from_config(
        config: &AuthConfig,
        http_client: reqwest::Client,
        sessions: Option<Arc<dyn SessionProvider>>,
    ) -> Result<Self> {
        match config {
            AuthConfig::OAuth {
                trust,
                machine_path,
            } => {
                trust.validate_for_oauth()?;
                let sessions = sessions.ok_or_else(|| {
                    Error::Config(
                        "auth mode 'oauth' requires a session provider; \
                         embed the gateway and supply one via Gateway::with_session_provider"
                            .to_string(),
                    )
                })?;
                let idp = IdpClient::new(trust.clone(), http_client.clone());
                let machine = machine_path.then(|| machine_from_trust(trust, http_client));
                Ok(Self::OAuth {
                    idp,
                    sessions,
                    machine,
                })
            }
            AuthConfig::M2m { trust } => {
                trust.validate_for_m2m()?;
                Ok(Self::M2m {
                    machine: machine_from_trust(trust, http_client),
                })
            }
            AuthConfig::StaticBearer { token } => {
                let token = crate::config::resolve_secret(token);
                if token.is_empty() {
                    return Err(Error::Config(
                        "auth mode 'static' requires a non-empty bearer token".to_string(),
                    ));
                }
                Ok(Self::StaticBearer { token })
            }
            AuthConfig::Disabled => Ok(Self::Disabled),
        }
    }

    /// Short mode label for the health payload and startup logging
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Self::OAuth { .. } => "oauth",
            Self::M2m { .. } => "m2m",
            Self::StaticBearer { .. } => "static",
            Self::Disabled => "none",
        }
    }

    /// The machine-path authenticator, if this deployment serves one
    #[must_use]
    pub fn machine_authenticator(&self) -> Option<&M2mAuthenticator> {
        match self {
            Self::OAuth { machine, .. } => machine.as_ref(),
            Self::M2m { machine } => Some(machine),
            _ => None,
        }
    }
}

fn machine_from_trust(trust: &TrustConfig, http_client: reqwest::Client) -> M2mAuthenticator {
    let verifier = JwksVerifier::new(trust.clone(), http_client);
    M2mAuthenticator::new(Arc::new(verifier))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_request_uses_camel_case_wire_names() {
        let request = AuthorizationRequest {
            client_id: "abc".to_string(),
            scope: "openid profile".to_string(),
            redirect_uri: Some("https://client.example/done".to_string()),
            state: None,
            extra: BTreeMap::new(),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["clientId"], "abc");
        assert_eq!(value["redirectUri"], "https://client.example/done");
        assert!(value.get("client_id").is_none());
    }

    #[test]
    fn authorization_request_keeps_unknown_fields() {
        let value = serde_json::json!({
            "clientId": "abc",
            "scope": "openid",
            "responseType": "code"
        });

        let request: AuthorizationRequest = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(request.extra["responseType"], "code");

        let round_tripped = serde_json::to_value(&request).unwrap();
        assert_eq!(round_tripped, value);
    }
}
