//! Error types for the property gateway

use std::io;

use thiserror::Error;

use crate::auth::identity::IdentityError;
use crate::auth::idp::ExchangeError;
use crate::auth::m2m::M2mError;
use crate::auth::session::ProviderError;
use crate::auth::state::StateError;
use crate::auth::verifier::VerifyError;

/// Result type alias for the property gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Property gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or incomplete client request (400)
    #[error("Invalid request: {0}")]
    ClientRequest(String),

    /// Opaque state decode failure at the callback
    #[error(transparent)]
    State(#[from] StateError),

    /// Authorization-code exchange failure at the identity provider
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// Identity token decode failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Signed-token verification failure
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Machine-path credential failure
    #[error(transparent)]
    M2m(#[from] M2mError),

    /// Session/authorization provider failure
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Tool backend returned an error or an unexpected response shape
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to a JSON-RPC error code for the machine-path envelope
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::M2m(e) => e.to_rpc_code(),
            Self::Verify(e) => {
                if e.is_retryable() {
                    rpc_codes::KEY_UNAVAILABLE
                } else {
                    rpc_codes::UNAUTHORIZED
                }
            }
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::ClientRequest(_) => rpc_codes::INVALID_REQUEST,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }
}

/// JSON-RPC error codes used by the gateway
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Missing or invalid credentials (HTTP 401)
    pub const UNAUTHORIZED: i32 = -32001;
    /// Valid credentials, wrong grant type or scope (HTTP 403)
    pub const FORBIDDEN: i32 = -32002;
    /// Signing keys could not be retrieved; retryable (HTTP 503)
    pub const KEY_UNAVAILABLE: i32 = -32003;
}
