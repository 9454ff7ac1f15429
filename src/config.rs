//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order; files that don't exist are silently skipped.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Tool service the gateway forwards authenticated requests to
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (PROPERTY_GATEWAY_ prefix)
        figment = figment.merge(Env::prefixed("PROPERTY_GATEWAY_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (scheme + host), used to compose the
    /// callback URL registered with the identity provider. Derived from the
    /// request's Host header when unset.
    pub public_url: Option<String>,
    /// Allowed CORS origin (`*` for any)
    pub cors_origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_url: None,
            cors_origin: "*".to_string(),
        }
    }
}

/// Tool service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// URL authenticated JSON-RPC requests are relayed to
    pub url: String,
    /// Per-request bound on the relay call, in seconds
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Authentication configuration — a tagged union of the deployment variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode")]
pub enum AuthConfig {
    /// Delegated OAuth2 login against an upstream identity provider
    #[serde(rename = "oauth")]
    OAuth {
        /// Trust parameters for the identity provider
        trust: TrustConfig,
        /// Also serve the machine path, validated against the same trust
        #[serde(default)]
        machine_path: bool,
    },
    /// Machine-to-machine bearer validation only
    #[serde(rename = "m2m")]
    M2m {
        /// Trust parameters for the identity provider
        trust: TrustConfig,
    },
    /// Static bearer token (supports `env:VAR_NAME` indirection)
    #[serde(rename = "static")]
    StaticBearer {
        /// The expected token value
        token: String,
    },
    /// No authentication
    #[serde(rename = "none")]
    Disabled,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::Disabled
    }
}

/// How the identity provider's token endpoint is spoken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TokenEndpointStyle {
    /// JSON request body carrying the provider audience (e.g. Auth0)
    #[default]
    Json,
    /// Form-encoded body with HTTP Basic client authentication
    FormBasic,
}

/// Per-deployment trust parameters for the identity provider.
///
/// Immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Identity provider domain, e.g. `tenant.auth0.com`
    pub domain: String,
    /// Expected token issuer; `https://{domain}/` when unset
    pub issuer: Option<String>,
    /// Expected token audience
    pub audience: String,
    /// Client id registered with the provider
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME` indirection)
    pub client_secret: String,
    /// Scope requested on the authorization redirect
    pub scope: String,
    /// Key-set location; `https://{domain}/.well-known/jwks.json` when unset
    pub jwks_uri: Option<String>,
    /// Authorization endpoint; `https://{domain}/authorize` when unset
    pub authorize_url: Option<String>,
    /// Token endpoint; `https://{domain}/oauth/token` when unset
    pub token_url: Option<String>,
    /// Token endpoint dialect
    pub token_style: TokenEndpointStyle,
    /// Bound on token-exchange and key-retrieval calls, in seconds
    pub http_timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            issuer: None,
            audience: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: "openid profile email".to_string(),
            jwks_uri: None,
            authorize_url: None,
            token_url: None,
            token_style: TokenEndpointStyle::Json,
            http_timeout_secs: 10,
        }
    }
}

impl TrustConfig {
    /// Expected token issuer URL
    #[must_use]
    pub fn issuer_url(&self) -> String {
        self.issuer
            .clone()
            .unwrap_or_else(|| format!("https://{}/", self.domain))
    }

    /// Key-set URL
    #[must_use]
    pub fn jwks_url(&self) -> String {
        self.jwks_uri
            .clone()
            .unwrap_or_else(|| format!("https://{}/.well-known/jwks.json", self.domain))
    }

    /// Authorization endpoint URL
    #[must_use]
    pub fn authorize_endpoint(&self) -> String {
        self.authorize_url
            .clone()
            .unwrap_or_else(|| format!("https://{}/authorize", self.domain))
    }

    /// Token endpoint URL
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.token_url
            .clone()
            .unwrap_or_else(|| format!("https://{}/oauth/token", self.domain))
    }

    /// Client secret with `env:VAR_NAME` indirection resolved
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }

    /// Bound applied to token-exchange and key-retrieval calls
    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    /// Check the parameters the delegated-OAuth mode needs
    pub fn validate_for_oauth(&self) -> Result<()> {
        if self.domain.is_empty() && (self.authorize_url.is_none() || self.token_url.is_none()) {
            return Err(Error::Config(
                "auth.trust.domain (or explicit authorize_url and token_url) is required for oauth mode"
                    .to_string(),
            ));
        }
        if self.client_id.is_empty() {
            return Err(Error::Config(
                "auth.trust.client_id is required for oauth mode".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the parameters the machine path needs
    pub fn validate_for_m2m(&self) -> Result<()> {
        if self.domain.is_empty() && self.jwks_uri.is_none() {
            return Err(Error::Config(
                "auth.trust.domain (or explicit jwks_uri) is required for m2m mode".to_string(),
            ));
        }
        if self.audience.is_empty() {
            return Err(Error::Config(
                "auth.trust.audience is required for m2m mode".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve a secret value, expanding the `env:VAR_NAME` indirection.
///
/// Unresolvable variables fall back to the literal value, matching how the
/// deployment surfaces the misconfiguration (an auth failure, not a crash).
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}
