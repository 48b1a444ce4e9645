use crate::cache::{CompositeArtifact, StoreError, cache_key};
use crate::codec::{self, DecodeError, EncodeError};
use crate::compose::{self, CompositeError};
use crate::fetch::FetchError;
use crate::rate_limit::Throttled;
use crate::state::AppState;
use crate::token::{COMPOSITE_ACTION, TokenSigner};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};

/// Mockup URLs containing this marker are lazy-load placeholders, not product images.
pub const PLACEHOLDER_MARKER: &str = "data:image/gif;base64";

/// Raw request fields as submitted by the storefront.
#[derive(Debug, Default, Clone)]
pub struct CompositeRequest {
    pub mockup_url: Option<String>,
    pub logo_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub mockup_url: String,
    pub logo_url: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid security token")]
    InvalidToken,
    #[error("missing required parameter {field}")]
    MissingParameter { field: &'static str },
    #[error("mockup url is a placeholder image")]
    PlaceholderMockup,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Composite(#[from] CompositeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Throttled(#[from] Throttled),
}

impl PipelineError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            PipelineError::Fetch(_) => "error_fetch",
            PipelineError::Decode(_) => "error_decode",
            PipelineError::Composite(_) => "error_compose",
            PipelineError::Encode(_) => "error_encode",
            PipelineError::Store(_) => "error_store",
            PipelineError::Throttled(_) => "throttled",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StageTimings {
    decode: Duration,
    compose: Duration,
    encode: Duration,
}

/// Checks the token first, then required fields, then the placeholder marker.
/// Nothing here touches the network.
pub fn validate(
    signer: &TokenSigner,
    request: &CompositeRequest,
) -> Result<ValidatedRequest, ValidationError> {
    let token = request.token.as_deref().unwrap_or_default();
    if !signer.verify(token, COMPOSITE_ACTION) {
        return Err(ValidationError::InvalidToken);
    }
    let mockup_url = sanitize_param(request.mockup_url.as_deref());
    if mockup_url.is_empty() {
        return Err(ValidationError::MissingParameter {
            field: "mockup_url",
        });
    }
    let logo_url = sanitize_param(request.logo_url.as_deref());
    if logo_url.is_empty() {
        return Err(ValidationError::MissingParameter { field: "logo_url" });
    }
    if mockup_url
        .to_ascii_lowercase()
        .contains(PLACEHOLDER_MARKER)
    {
        return Err(ValidationError::PlaceholderMockup);
    }
    Ok(ValidatedRequest {
        mockup_url,
        logo_url,
    })
}

fn sanitize_param(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

/// Serves from cache when possible, otherwise fetches, composites and stores.
/// Only generation is charged against the client's budget.
pub async fn run(
    state: &AppState,
    request: &ValidatedRequest,
    client: Option<IpAddr>,
) -> Result<CompositeArtifact, PipelineError> {
    let key = cache_key(&request.mockup_url, &request.logo_url);
    if let Some(hit) = state.cache.lookup(&request.mockup_url, &request.logo_url).await {
        debug!(key = %key, "composite cache hit");
        state.metrics.observe_composite_result("hit");
        return Ok(hit);
    }

    let permit = state.singleflight.acquire(&key);
    let leader = if permit.is_leader() {
        Some(permit)
    } else {
        let finished = permit.wait_result(state.config.singleflight_wait).await;
        if let Some(hit) = state.cache.lookup_key(&key).await {
            debug!(key = %key, "composite produced by concurrent request");
            state.metrics.observe_composite_result("coalesced");
            return Ok(hit);
        }
        if !finished {
            warn!(key = %key, "timed out waiting for concurrent composite");
        }
        None
    };
    if leader.is_some()
        && let Some(hit) = state.cache.lookup_key(&key).await
    {
        state.metrics.observe_composite_result("hit");
        return Ok(hit);
    }

    if let (Some(limiter), Some(client)) = (state.rate_limiter.as_ref(), client)
        && let Err(throttled) = limiter.try_acquire(client)
    {
        warn!(key = %key, client = %client, "composite generation throttled");
        state.metrics.observe_composite_result("throttled");
        return Err(throttled.into());
    }

    match generate(state, &key, request).await {
        Ok(artifact) => {
            state.metrics.observe_composite_result("miss");
            Ok(artifact)
        }
        Err(err) => {
            state.metrics.observe_composite_result(err.metric_label());
            Err(err)
        }
    }
}

async fn generate(
    state: &AppState,
    key: &str,
    request: &ValidatedRequest,
) -> Result<CompositeArtifact, PipelineError> {
    let started = Instant::now();
    let fetch_started = Instant::now();
    let mockup = fetch_source(state, "mockup", &request.mockup_url);
    let logo = fetch_source(state, "logo", &request.logo_url);
    let (mockup_bytes, logo_bytes) = tokio::try_join!(mockup, logo)?;
    state
        .metrics
        .observe_stage_duration("fetch", fetch_started.elapsed());

    // Owned by the blocking job, so a dropped request still holds its slot.
    let permit = state
        .composite_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| CompositeError::Worker)?;
    let max_pixels = state.config.max_decoded_pixels;
    let (png, timings) = task::spawn_blocking(move || {
        let _permit = permit;
        render_composite(&mockup_bytes, &logo_bytes, max_pixels)
    })
    .await
    .map_err(|_| CompositeError::Worker)??;
    state.metrics.observe_stage_duration("decode", timings.decode);
    state.metrics.observe_stage_duration("compose", timings.compose);
    state.metrics.observe_stage_duration("encode", timings.encode);

    let store_started = Instant::now();
    let artifact = state.cache.store(key, &png).await?;
    state
        .metrics
        .observe_stage_duration("store", store_started.elapsed());
    info!(
        key = %key,
        bytes = artifact.size,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "composite generated"
    );
    Ok(artifact)
}

async fn fetch_source(
    state: &AppState,
    role: &'static str,
    url: &str,
) -> Result<bytes::Bytes, PipelineError> {
    state.source.fetch(url).await.map_err(|err| {
        warn!(role, url = %url, error = %err, "source image fetch failed");
        state.metrics.observe_fetch_failure(err.kind());
        PipelineError::from(err)
    })
}

fn render_composite(
    mockup_bytes: &[u8],
    logo_bytes: &[u8],
    max_pixels: u64,
) -> Result<(Vec<u8>, StageTimings), PipelineError> {
    let mut timings = StageTimings::default();
    let started = Instant::now();
    let mockup = codec::decode(mockup_bytes, max_pixels)?;
    let logo = codec::decode(logo_bytes, max_pixels)?;
    timings.decode = started.elapsed();

    let started = Instant::now();
    let canvas = compose::compose(&mockup, &logo)?;
    drop((mockup, logo));
    timings.compose = started.elapsed();

    let started = Instant::now();
    let png = codec::encode_png(&canvas)?;
    timings.encode = started.elapsed();
    Ok((png, timings))
}
