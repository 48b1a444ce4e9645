use crate::cache::{COMPOSITE_DIR_NAME, is_composite_file_name};
use crate::codec::DecodeError;
use crate::compose::CompositeError;
use crate::fetch::FetchError;
use crate::pipeline::{self, CompositeRequest, PipelineError, ValidationError};
use crate::rate_limit::Throttled;
use crate::state::AppState;
use crate::token::COMPOSITE_ACTION;
use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Extension, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::io::ReaderStream;
use tracing::warn;

const MAX_FORWARDED_HOPS: usize = 16;

const MSG_INVALID_TOKEN: &str = "Invalid security token.";
const MSG_MISSING_PARAMETERS: &str = "Missing required parameters.";
const MSG_PLACEHOLDER_MOCKUP: &str = "Invalid mockup image URL (placeholder detected).";
const MSG_FETCH_FAILED: &str = "Failed to download source images.";
const MSG_IMAGE_RESOURCES: &str = "Failed to create image resources.";
const MSG_SAVE_FAILED: &str = "Failed to save composite image.";
const MSG_THROTTLED: &str = "Too many new composites. Please retry shortly.";

#[derive(Debug, Deserialize)]
pub struct CompositeForm {
    mockup_url: Option<String>,
    logo_url: Option<String>,
    nonce: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Serialize)]
struct CompositeResponse {
    url: String,
    from_cache: bool,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    nonce: String,
    action: &'static str,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/composite", post(create_composite))
        .route(
            &format!("/uploads/{COMPOSITE_DIR_NAME}/{{file}}"),
            get(serve_composite),
        );
    if state.config.token_endpoint_enabled {
        router = router.route("/token", get(issue_token));
    }
    if state.config.metrics_enabled {
        router = router.route("/metrics", get(metrics));
    }
    router.with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn issue_token(State(state): State<Arc<AppState>>) -> Json<TokenResponse> {
    Json(TokenResponse {
        nonce: state.signer.issue(COMPOSITE_ACTION),
        action: COMPOSITE_ACTION,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let body = state.metrics.gather()?;
    Ok((
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response())
}

#[allow(clippy::result_large_err)]
async fn create_composite(
    State(state): State<Arc<AppState>>,
    Extension(ClientAddr(client)): Extension<ClientAddr>,
    form: Result<Form<CompositeForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let Form(form) = form.map_err(|rejection| {
        ApiError::bad_request(MSG_MISSING_PARAMETERS).with_log_detail(rejection.body_text())
    })?;
    if let Some(action) = form.action.as_deref().map(str::trim)
        && !action.is_empty()
        && action != COMPOSITE_ACTION
    {
        return Err(ApiError::bad_request("Invalid action.")
            .with_log_detail(format!("unknown action {action}")));
    }
    let request = CompositeRequest {
        mockup_url: form.mockup_url,
        logo_url: form.logo_url,
        token: form.nonce,
    };
    let validated = pipeline::validate(&state.signer, &request).map_err(|err| {
        state.metrics.observe_composite_result("rejected");
        map_validation_error(err)
    })?;
    let artifact = pipeline::run(&state, &validated, client)
        .await
        .map_err(map_pipeline_error)?;

    let cache_hit = if artifact.from_cache { "true" } else { "false" };
    let mut response = Json(CompositeResponse {
        url: artifact.url,
        from_cache: artifact.from_cache,
    })
    .into_response();
    response
        .headers_mut()
        .insert("X-Composite-Cache-Hit", HeaderValue::from_static(cache_hit));
    Ok(response)
}

async fn serve_composite(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !is_composite_file_name(&file) {
        return ApiError::new(StatusCode::NOT_FOUND, "Not found.").into_response();
    }
    if state.config.hotlink_protection
        && let Some(origin) = state.config.site_origin.as_deref()
        && !referer_allowed(&headers, origin)
    {
        return ApiError::forbidden("Forbidden.").into_response();
    }
    let key = file.trim_end_matches(".png");
    let Some(artifact) = state.cache.lookup_key(key).await else {
        return ApiError::new(StatusCode::NOT_FOUND, "Not found.").into_response();
    };
    let file = match tokio::fs::File::open(&artifact.path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return ApiError::new(StatusCode::NOT_FOUND, "Not found.").into_response();
        }
        Err(err) => {
            return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "read failed")
                .with_log_detail(err.to_string())
                .into_response();
        }
    };
    let age = SystemTime::now()
        .duration_since(artifact.created_at)
        .unwrap_or_default();
    let max_age = state.config.cache_ttl.saturating_sub(age).as_secs();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(mime::IMAGE_PNG.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&artifact.size.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    let body = Body::from_stream(ReaderStream::new(file));
    (headers, body).into_response()
}

/// Mirrors the `RewriteCond %{HTTP_REFERER} !^origin [NC]` rule: a missing
/// referer is rejected as well.
fn referer_allowed(headers: &HeaderMap, origin: &str) -> bool {
    let Some(referer) = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    referer.len() >= origin.len()
        && referer.is_char_boundary(origin.len())
        && referer[..origin.len()].eq_ignore_ascii_case(origin)
}

/// Peer address after resolving trusted proxies. Inserted by `access_middleware`.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<IpAddr>);

pub async fn access_middleware(
    state: Arc<AppState>,
    mut request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/healthz" {
        return next.run(request).await;
    }
    let route_group = route_group(&path);
    let _inflight = state.metrics.inflight_guard();

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let client = peer.map(|peer| {
        client_ip(peer, request.headers(), &state.config.trusted_proxies)
    });
    request.extensions_mut().insert(ClientAddr(client));

    let response = next.run(request).await;
    state
        .metrics
        .observe_http_request(route_group, method.as_str(), response.status().as_str());
    if let Some(context) = response.extensions().get::<ErrorLogContext>() {
        warn!(
            method = %method,
            path = %path,
            client = ?client,
            status = response.status().as_u16(),
            detail = %context.detail,
            "request failed"
        );
    }
    response
}

fn route_group(path: &str) -> &'static str {
    match path {
        "/composite" => "composite",
        "/token" => "token",
        "/metrics" => "metrics",
        _ if path.starts_with("/uploads/") => "files",
        _ => "other",
    }
}

/// Uses `X-Forwarded-For` only when the peer is a trusted proxy, walking back
/// from the nearest hop to the first address that is not a proxy.
fn client_ip(peer: IpAddr, headers: &HeaderMap, trusted: &[IpNet]) -> IpAddr {
    let is_trusted = |ip: &IpAddr| trusted.iter().any(|net| net.contains(ip));
    if !is_trusted(&peer) {
        return peer;
    }
    let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    else {
        return peer;
    };
    for hop in forwarded.rsplit(',').take(MAX_FORWARDED_HOPS) {
        let Ok(ip) = hop.trim().parse::<IpAddr>() else {
            break;
        };
        if !is_trusted(&ip) {
            return ip;
        }
    }
    peer
}

fn throttled_response(throttled: Throttled) -> ApiError {
    let retry_after = throttled.retry_after.as_secs().max(1);
    ApiError::new(StatusCode::TOO_MANY_REQUESTS, MSG_THROTTLED)
        .with_header(header::RETRY_AFTER, HeaderValue::from(retry_after))
        .with_header("X-RateLimit-Limit", HeaderValue::from(throttled.limit))
        .with_header("X-RateLimit-Remaining", HeaderValue::from(0u64))
}

fn map_validation_error(error: ValidationError) -> ApiError {
    let detail = error.to_string();
    match error {
        ValidationError::InvalidToken => ApiError::forbidden(MSG_INVALID_TOKEN),
        ValidationError::MissingParameter { field } => {
            ApiError::bad_request(MSG_MISSING_PARAMETERS)
                .with_field("field", Value::String(field.to_string()))
        }
        ValidationError::PlaceholderMockup => ApiError::bad_request(MSG_PLACEHOLDER_MOCKUP),
    }
    .with_log_detail(detail)
}

fn map_pipeline_error(error: PipelineError) -> ApiError {
    let detail = error_chain(&error);
    let api_error = match &error {
        PipelineError::Fetch(err) => {
            let status = match err {
                FetchError::EmptyUrl | FetchError::InvalidUri | FetchError::Blocked => {
                    StatusCode::BAD_REQUEST
                }
                FetchError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                FetchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                FetchError::EmptyBody { .. }
                | FetchError::UpstreamStatus { .. }
                | FetchError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            };
            ApiError::new(status, MSG_FETCH_FAILED)
        }
        PipelineError::Decode(err) => {
            let status = match err {
                DecodeError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            ApiError::new(status, MSG_IMAGE_RESOURCES)
        }
        PipelineError::Composite(err) => {
            let status = match err {
                CompositeError::Worker => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            ApiError::new(status, MSG_IMAGE_RESOURCES)
        }
        PipelineError::Encode(_) | PipelineError::Store(_) => {
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, MSG_SAVE_FAILED)
        }
        PipelineError::Throttled(throttled) => throttled_response(*throttled),
    };
    api_error.with_log_detail(detail)
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !detail.ends_with(&cause_text) {
            detail.push_str(": ");
            detail.push_str(&cause_text);
        }
        source = cause.source();
    }
    detail
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
    pub headers: HeaderMap,
    pub log_detail: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message }),
            headers: HeaderMap::new(),
            log_detail: None,
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.body {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn with_header(mut self, name: impl header::IntoHeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_log_detail(mut self, detail: String) -> Self {
        if !detail.is_empty() {
            self.log_detail = Some(detail);
        }
        self
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "request failed")
            .with_log_detail(format!("{error:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_message = extract_error_message(&self.body);
        let mut response = (self.status, Json(self.body)).into_response();
        response.headers_mut().extend(self.headers);
        if let Some(message) = error_message.as_ref() {
            let sanitized = sanitize_error_header(message);
            if let Ok(value) = HeaderValue::from_str(&sanitized) {
                response.headers_mut().insert("X-Composite-Error", value);
            }
        }
        if let Some(detail) = self
            .log_detail
            .or_else(|| error_message.map(|message| sanitize_error_header(&message)))
        {
            response.extensions_mut().insert(ErrorLogContext { detail });
        }
        response
    }
}

#[derive(Clone)]
struct ErrorLogContext {
    detail: String,
}

fn extract_error_message(body: &Value) -> Option<String> {
    let Value::Object(map) = body else {
        return None;
    };
    map.get("error")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

fn sanitize_error_header(value: &str) -> String {
    let mut sanitized: String = value
        .chars()
        .filter(|ch| ch.is_ascii() && !ch.is_control())
        .collect();
    sanitized.truncate(200);
    sanitized
}
