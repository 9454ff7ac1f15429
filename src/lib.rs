//! Property Gateway Library
//!
//! Authentication gateway for the property-data MCP service.
//!
//! # Deployment variants
//!
//! - **Delegated OAuth2**: browser flow against an upstream identity
//!   provider (Auth0-style JSON token endpoints or generic form/Basic ones),
//!   sessions minted by an injected session provider
//! - **M2M**: bearer validation of machine-issued signed tokens against the
//!   provider's published key set
//! - **Static bearer**: one shared token, compared in constant time
//! - **None**: open gateway for local development
//!
//! All variants share one router; authenticated requests are forwarded to
//! the tool service and its responses relayed unchanged.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
