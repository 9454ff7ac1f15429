//! Tool-serving collaborator seam
//!
//! The gateway's only contract with the tool service is "forward an
//! authenticated request, relay the response unchanged". The service itself
//! (property search, parcel details, the upstream GIS client) lives behind
//! this trait; the shipped implementation relays JSON-RPC bodies over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::auth::session::SessionProps;
use crate::auth::verifier::IdentityClaims;
use crate::{Error, Result};

/// Who the authenticated caller is, attached to forwarded requests
#[derive(Debug, Clone)]
pub enum CallerContext {
    /// Browser-session caller, identity owned by the session provider
    Session(SessionProps),
    /// Machine caller with verified token claims
    Machine(Box<IdentityClaims>),
    /// Caller authenticated by the static bearer token
    StaticToken,
    /// No authentication configured
    Anonymous,
}

impl CallerContext {
    /// Subject identifier of the caller, when one exists
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::Session(props) => Some(&props.subject),
            Self::Machine(claims) => Some(&claims.sub),
            Self::StaticToken | Self::Anonymous => None,
        }
    }
}

/// Response relayed from the tool service, unchanged
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    /// HTTP status the service answered with
    pub status: u16,
    /// Response body as the service produced it
    pub body: Value,
}

/// The tool-serving collaborator
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Forward an already-authenticated JSON-RPC request and relay the
    /// response unchanged
    async fn forward(&self, body: Value, caller: &CallerContext) -> Result<RelayedResponse>;
}

/// Relays requests to the tool service over HTTP
pub struct HttpToolBackend {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpToolBackend {
    /// Create a relay to the given service URL
    #[must_use]
    pub fn new(url: String, http: reqwest::Client, timeout: Duration) -> Self {
        Self { url, http, timeout }
    }
}

#[async_trait]
impl ToolBackend for HttpToolBackend {
    async fn forward(&self, body: Value, caller: &CallerContext) -> Result<RelayedResponse> {
        let mut request = self.http.post(&self.url).json(&body);
        if let Some(subject) = caller.subject() {
            request = request.header("x-forwarded-user", subject);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| {
                Error::Upstream(format!(
                    "tool service did not answer within {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("tool service returned a non-JSON body: {e}")))?;

        debug!(status, subject = ?caller.subject(), "Relayed tool response");
        Ok(RelayedResponse { status, body })
    }
}

/// Convenience alias used by the router state
pub type SharedToolBackend = Arc<dyn ToolBackend>;
