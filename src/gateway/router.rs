//! HTTP router and handlers
//!
//! One router serves every deployment variant; each handler checks whether
//! the active strategy supports its route and answers 404 otherwise. All
//! handler state is per-request — nothing persists across invocations
//! except what the session provider and the JWKS cache hold externally.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use super::forward::{CallerContext, SharedToolBackend};
use crate::auth::m2m::{M2mError, extract_bearer};
use crate::auth::session::ProviderError;
use crate::auth::{AuthStrategy, identity, state as opaque};
use crate::error::rpc_codes;
use crate::protocol::JsonRpcResponse;

/// Name reported by the health endpoint
pub const SERVICE_NAME: &str = "property-gateway";

/// Shared application state
pub struct AppState {
    /// Active authentication strategy
    pub strategy: AuthStrategy,
    /// Tool-serving collaborator
    pub tools: SharedToolBackend,
    /// Externally visible base URL; the Host header is used when unset
    pub public_url: Option<String>,
}

impl AppState {
    /// The callback URL registered with the identity provider.
    ///
    /// Must match the registered redirect URI exactly, so deployments
    /// behind a proxy set `server.public_url`.
    fn callback_url(&self, headers: &HeaderMap) -> String {
        let base = self.public_url.clone().unwrap_or_else(|| {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        });
        format!("{}/callback", base.trim_end_matches('/'))
    }

    /// Endpoint list for the health payload and startup banner, per strategy
    pub(crate) fn endpoints(&self) -> Vec<&'static str> {
        match &self.strategy {
            AuthStrategy::OAuth { machine, .. } => {
                let mut endpoints =
                    vec!["/mcp", "/authorize", "/callback", "/register", "/token"];
                if machine.is_some() {
                    endpoints.push("/mcp-m2m");
                }
                endpoints
            }
            AuthStrategy::M2m { .. } => vec!["/mcp-m2m"],
            AuthStrategy::StaticBearer { .. } | AuthStrategy::Disabled => vec!["/mcp"],
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, cors_origin: &str) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/authorize", get(authorize_handler))
        .route("/callback", get(callback_handler))
        .route("/token", post(token_handler))
        .route("/register", post(register_handler))
        .route("/mcp", post(tools_handler))
        .route("/mcp-m2m", any(m2m_handler))
        .fallback(not_found_handler)
        .layer(CatchPanicLayer::new())
        .layer(cors_layer(cors_origin))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the CORS layer from the configured origin
fn cors_layer(origin: &str) -> CorsLayer {
    use tower_http::cors::Any;

    if origin == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(e) => {
            warn!(origin = %origin, error = %e, "Invalid CORS origin, allowing any");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// GET /health — static service info, no auth
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "auth": state.strategy.mode(),
        "endpoints": state.endpoints(),
    }))
}

/// GET /authorize — start the delegated browser flow
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let AuthStrategy::OAuth { idp, sessions, .. } = &state.strategy else {
        return not_found_handler().await.into_response();
    };

    let request = match sessions.parse_auth_request(&query).await {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Authorization request rejected by session provider");
            return client_error(format!("Invalid request: {e}"));
        }
    };

    if request.client_id.is_empty() {
        warn!("Authorization failed: missing client id in request");
        return client_error("Invalid request: Missing client_id".to_string());
    }

    let callback_url = state.callback_url(&headers);
    match idp.authorize_url(&request, &callback_url) {
        Ok(url) => {
            info!(client_id = %request.client_id, "Redirecting caller to identity provider");
            found_redirect(url.as_str())
        }
        Err(e) => {
            error!(error = %e, "Failed to compose authorization redirect");
            server_error(format!("Authorization error: {e}"))
        }
    }
}

/// Query parameters on the provider's callback redirect
#[derive(Debug, Deserialize)]
struct CallbackParams {
    /// Authorization code
    code: Option<String>,
    /// Opaque state carrying the caller's original request
    state: Option<String>,
    /// Error code, when the provider aborted the flow
    error: Option<String>,
    /// Human-readable error description
    error_description: Option<String>,
}

/// GET /callback — finish the delegated browser flow
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let AuthStrategy::OAuth { idp, sessions, .. } = &state.strategy else {
        return not_found_handler().await.into_response();
    };

    // A provider error short-circuits the flow before any exchange
    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "No description".to_string());
        warn!(error = %error, description = %description, "Identity provider returned an error");
        return client_error(format!("Authentication error: {error} - {description}"));
    }

    let (Some(code), Some(opaque_state)) = (params.code, params.state) else {
        warn!("Callback missing code or state parameter");
        return client_error("Missing code or state parameter".to_string());
    };

    // The state must decode back to the caller's original request
    let original_request = match opaque::decode(&opaque_state) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Failed to decode state parameter");
            return client_error(format!("Invalid state parameter: {e}"));
        }
    };

    // One exchange attempt; the code is single-use, so no retry on failure
    let callback_url = state.callback_url(&headers);
    let tokens = match idp.exchange_code(&code, &callback_url).await {
        Ok(tokens) => tokens,
        Err(e) => {
            error!(error = %e, "Token exchange failed");
            return server_error(format!("Failed to exchange code for token: {e}"));
        }
    };

    let identity = match identity::extract_identity(&tokens.id_token) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "Failed to decode identity token");
            return server_error(format!("Callback error: {e}"));
        }
    };

    info!(subject = %identity.subject, "Authenticated user at callback");

    match identity::bind_session(identity, original_request, sessions.as_ref()).await {
        Ok(completed) => found_redirect(&completed.redirect_to),
        Err(e) => {
            error!(error = %e, "Session provider failed to complete authorization");
            server_error(format!("Callback error: {e}"))
        }
    }
}

/// POST /token — delegate to the session provider's token endpoint
async fn token_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Form(form): axum::extract::Form<HashMap<String, String>>,
) -> Response {
    let AuthStrategy::OAuth { sessions, .. } = &state.strategy else {
        return not_found_handler().await.into_response();
    };

    match sessions.exchange_token(form).await {
        Ok(body) => Json(body).into_response(),
        Err(ProviderError::Rejected(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "error_description": message})),
        )
            .into_response(),
        Err(e) => server_error(format!("Token endpoint error: {e}")),
    }
}

/// POST /register — delegate to the session provider's client registration
async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<Value>,
) -> Response {
    let AuthStrategy::OAuth { sessions, .. } = &state.strategy else {
        return not_found_handler().await.into_response();
    };

    match sessions.register_client(registration).await {
        Ok(body) => (StatusCode::CREATED, Json(body)).into_response(),
        Err(ProviderError::Rejected(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_client_metadata", "error_description": message})),
        )
            .into_response(),
        Err(e) => server_error(format!("Registration error: {e}")),
    }
}

/// ANY /mcp-m2m — machine path
async fn m2m_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(machine) = state.strategy.machine_authenticator() else {
        return not_found_handler().await.into_response();
    };

    let claims = match machine.authenticate(&headers).await {
        Ok(claims) => claims,
        Err(e) => return m2m_error_response(&e),
    };

    let Some(body) = parse_rpc_body(&body) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            rpc_codes::PARSE_ERROR,
            "Request body is not valid JSON",
        );
    };

    forward(&state, body, CallerContext::Machine(Box::new(claims))).await
}

/// POST /mcp — tool-serving path for browser-session and static callers
async fn tools_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let caller = match &state.strategy {
        AuthStrategy::OAuth { sessions, .. } => {
            let token = match extract_bearer(&headers) {
                Ok(token) => token,
                Err(e) => return m2m_error_response(&e),
            };
            match sessions.authenticate(token).await {
                Ok(props) => CallerContext::Session(props),
                Err(ProviderError::Unauthorized) => {
                    return rpc_error_response(
                        StatusCode::UNAUTHORIZED,
                        rpc_codes::UNAUTHORIZED,
                        "Invalid or expired session token",
                    );
                }
                Err(e) => {
                    error!(error = %e, "Session provider failed to authenticate");
                    return rpc_error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        rpc_codes::INTERNAL_ERROR,
                        "Session validation failed",
                    );
                }
            }
        }
        AuthStrategy::StaticBearer { token: expected } => {
            let token = match extract_bearer(&headers) {
                Ok(token) => token,
                Err(e) => return m2m_error_response(&e),
            };
            if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
                CallerContext::StaticToken
            } else {
                warn!("Invalid static bearer token");
                return rpc_error_response(
                    StatusCode::UNAUTHORIZED,
                    rpc_codes::UNAUTHORIZED,
                    "Invalid token",
                );
            }
        }
        AuthStrategy::Disabled => CallerContext::Anonymous,
        // Machine deployments serve tools on /mcp-m2m only
        AuthStrategy::M2m { .. } => return not_found_handler().await.into_response(),
    };

    let Some(body) = parse_rpc_body(&body) else {
        return rpc_error_response(
            StatusCode::BAD_REQUEST,
            rpc_codes::PARSE_ERROR,
            "Request body is not valid JSON",
        );
    };

    forward(&state, body, caller).await
}

/// Fallback for unmatched paths
async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

/// Forward an authenticated request and relay the response unchanged
async fn forward(state: &AppState, body: Value, caller: CallerContext) -> Response {
    match state.tools.forward(body, &caller).await {
        Ok(relayed) => {
            let status =
                StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(relayed.body)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Tool service unreachable");
            rpc_error_response(
                StatusCode::BAD_GATEWAY,
                rpc_codes::INTERNAL_ERROR,
                format!("Tool service unreachable: {e}"),
            )
        }
    }
}

/// Parse a JSON-RPC body; an empty body (e.g. a GET probe) becomes null
fn parse_rpc_body(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return Some(Value::Null);
    }
    serde_json::from_slice(body).ok()
}

/// Map a machine-path failure to its status and error envelope
fn m2m_error_response(error: &M2mError) -> Response {
    let code = error.to_rpc_code();
    let status = match code {
        rpc_codes::FORBIDDEN => StatusCode::FORBIDDEN,
        rpc_codes::KEY_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::UNAUTHORIZED,
    };
    debug!(status = %status, code, "Machine-path authentication failed");
    rpc_error_response(status, code, error.to_string())
}

/// JSON-RPC-shaped error envelope with a null id
fn rpc_error_response(status: StatusCode, code: i32, message: impl Into<String>) -> Response {
    let mut response = (
        status,
        Json(JsonRpcResponse::error(None, code, message)),
    )
        .into_response();

    if status == StatusCode::UNAUTHORIZED {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }

    response
}

/// 302 to the given URL
fn found_redirect(url: &str) -> Response {
    match HeaderValue::from_str(url) {
        Ok(location) => {
            (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
        }
        Err(e) => {
            error!(error = %e, "Redirect target is not a valid header value");
            server_error("Redirect target is not a valid URL".to_string())
        }
    }
}

/// 400 with a human-readable text body
fn client_error(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

/// 500 with a human-readable text body
fn server_error(message: String) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_params_deserialize() {
        let params: CallbackParams =
            serde_urlencoded::from_str("code=abc123&state=xyz789").unwrap();
        assert_eq!(params.code, Some("abc123".to_string()));
        assert_eq!(params.state, Some("xyz789".to_string()));
        assert!(params.error.is_none());

        let params: CallbackParams =
            serde_urlencoded::from_str("error=access_denied&error_description=nope").unwrap();
        assert_eq!(params.error, Some("access_denied".to_string()));
        assert_eq!(params.error_description, Some("nope".to_string()));
    }

    #[test]
    fn parse_rpc_body_handles_empty_and_garbage() {
        assert_eq!(parse_rpc_body(&Bytes::new()), Some(Value::Null));
        assert_eq!(
            parse_rpc_body(&Bytes::from_static(b"{\"jsonrpc\":\"2.0\"}")),
            Some(json!({"jsonrpc": "2.0"}))
        );
        assert_eq!(parse_rpc_body(&Bytes::from_static(b"not json")), None);
    }
}
