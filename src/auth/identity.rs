//! Identity extraction and session binding
//!
//! At callback time the identity token arrived over the gateway's own TLS
//! exchange with the provider's token endpoint, so its payload is decoded
//! without re-verifying the signature. The decoded identity plus the
//! caller's original request are handed to the session provider to mint a
//! caller-facing session.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use super::AuthorizationRequest;
use super::session::{
    CompletedAuthorization, ProviderError, SessionCompletion, SessionProps, SessionProvider,
};

/// Identity token decode failures
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The payload segment is not valid structured data or has no subject
    #[error("identity token is malformed: {0}")]
    Malformed(String),
}

/// Identity decoded from the provider's identity token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable subject identifier
    pub subject: String,
    /// Email address, when present
    pub email: Option<String>,
    /// Display name, when present
    pub name: Option<String>,
}

impl Identity {
    /// Label for consent/administration screens: name, else email, else
    /// the subject identifier
    #[must_use]
    pub fn display_label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.subject.clone())
    }
}

/// Decode the payload segment of an identity token without verifying its
/// signature.
///
/// # Errors
///
/// [`IdentityError::Malformed`] if the token is not a JWT, the payload is
/// not valid JSON, or the `sub` claim is absent.
pub fn extract_identity(id_token: &str) -> Result<Identity, IdentityError> {
    let mut segments = id_token.split('.');
    let (Some(_header), Some(payload)) = (segments.next(), segments.next()) else {
        return Err(IdentityError::Malformed(
            "token does not have a payload segment".to_string(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| IdentityError::Malformed(format!("payload is not base64url: {e}")))?;

    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| IdentityError::Malformed(format!("payload is not JSON: {e}")))?;

    let subject = claims
        .get("sub")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IdentityError::Malformed("payload has no subject claim".to_string()))?
        .to_string();

    Ok(Identity {
        subject,
        email: claims.get("email").and_then(Value::as_str).map(String::from),
        name: claims.get("name").and_then(Value::as_str).map(String::from),
    })
}

/// Mint a session for a decoded identity and return where to send the
/// caller next.
///
/// The session is scoped to the original request's scope and keyed by the
/// identity's subject; `{email, name, sub}` ride along as opaque metadata
/// owned by the provider from here on.
///
/// # Errors
///
/// Propagates the provider's failure unchanged.
pub async fn bind_session(
    identity: Identity,
    original_request: AuthorizationRequest,
    provider: &dyn SessionProvider,
) -> Result<CompletedAuthorization, ProviderError> {
    let label = identity.display_label();
    let completion = SessionCompletion {
        scope: original_request.scope.clone(),
        user_id: identity.subject.clone(),
        label,
        props: SessionProps {
            email: identity.email,
            name: identity.name,
            subject: identity.subject.clone(),
        },
        request: original_request,
    };

    let completed = provider.complete_authorization(completion).await?;
    info!(subject = %identity.subject, "Session bound, flow complete");
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    /// Build an unsigned JWT-shaped token from a claims payload
    fn id_token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn extracts_subject_email_and_name() {
        let token = id_token(&json!({
            "sub": "u1",
            "email": "e@x.com",
            "name": "Ana",
            "iss": "https://tenant.auth0.example/"
        }));

        let identity = extract_identity(&token).unwrap();
        assert_eq!(
            identity,
            Identity {
                subject: "u1".to_string(),
                email: Some("e@x.com".to_string()),
                name: Some("Ana".to_string()),
            }
        );
    }

    #[test]
    fn missing_subject_is_malformed() {
        let token = id_token(&json!({"email": "e@x.com"}));
        assert!(matches!(
            extract_identity(&token),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn non_jwt_input_is_malformed() {
        for bad in ["", "no-dots-here", "a.%%%.c"] {
            assert!(
                matches!(extract_identity(bad), Err(IdentityError::Malformed(_))),
                "expected Malformed for {bad:?}"
            );
        }
    }

    #[test]
    fn non_json_payload_is_malformed() {
        let payload = URL_SAFE_NO_PAD.encode(b"plain text");
        let token = format!("h.{payload}.s");
        assert!(matches!(
            extract_identity(&token),
            Err(IdentityError::Malformed(_))
        ));
    }

    #[test]
    fn display_label_falls_back_name_email_subject() {
        let mut identity = Identity {
            subject: "u1".to_string(),
            email: Some("e@x.com".to_string()),
            name: Some("Ana".to_string()),
        };
        assert_eq!(identity.display_label(), "Ana");

        identity.name = None;
        assert_eq!(identity.display_label(), "e@x.com");

        identity.email = None;
        assert_eq!(identity.display_label(), "u1");
    }

    /// Provider fake that records the completion it was handed
    struct RecordingProvider {
        seen: Mutex<Option<SessionCompletion>>,
    }

    #[async_trait]
    impl SessionProvider for RecordingProvider {
        async fn complete_authorization(
            &self,
            completion: SessionCompletion,
        ) -> Result<CompletedAuthorization, ProviderError> {
            *self.seen.lock().unwrap() = Some(completion);
            Ok(CompletedAuthorization {
                redirect_to: "https://client.example/finish?code=session-code".to_string(),
            })
        }

        async fn authenticate(&self, _token: &str) -> Result<SessionProps, ProviderError> {
            Err(ProviderError::Unauthorized)
        }

        async fn exchange_token(
            &self,
            _form: HashMap<String, String>,
        ) -> Result<Value, ProviderError> {
            Err(ProviderError::Rejected("not used".to_string()))
        }

        async fn register_client(&self, _registration: Value) -> Result<Value, ProviderError> {
            Err(ProviderError::Rejected("not used".to_string()))
        }
    }

    #[tokio::test]
    async fn bind_session_scopes_to_the_original_request() {
        let provider = RecordingProvider {
            seen: Mutex::new(None),
        };
        let identity = Identity {
            subject: "u1".to_string(),
            email: Some("e@x.com".to_string()),
            name: None,
        };
        let request = AuthorizationRequest {
            client_id: "abc".to_string(),
            scope: "openid profile".to_string(),
            redirect_uri: None,
            state: None,
            extra: BTreeMap::new(),
        };

        let completed = bind_session(identity, request, &provider).await.unwrap();
        assert_eq!(
            completed.redirect_to,
            "https://client.example/finish?code=session-code"
        );

        let seen = provider.seen.lock().unwrap().take().unwrap();
        assert_eq!(seen.scope, "openid profile");
        assert_eq!(seen.user_id, "u1");
        assert_eq!(seen.label, "e@x.com");
        assert_eq!(seen.props.subject, "u1");
        assert_eq!(seen.props.email.as_deref(), Some("e@x.com"));
        assert_eq!(seen.request.client_id, "abc");
    }
}
