#![allow(clippy::collapsible_if)]

mod cache;
mod codec;
mod compose;
mod config;
mod fetch;
mod http;
mod metrics;
mod pipeline;
mod rate_limit;
mod state;
mod token;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::state::AppState;
use axum::Router;
use axum::body::HttpBody;
use axum::http::{Response, header};
use axum::middleware;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::{
    CompressionLayer,
    predicate::{DefaultPredicate, Predicate},
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct NoImageCompression {
    inner: DefaultPredicate,
}

impl NoImageCompression {
    fn new() -> Self {
        Self {
            inner: DefaultPredicate::new(),
        }
    }
}

impl Predicate for NoImageCompression {
    fn should_compress<B>(&self, response: &Response<B>) -> bool
    where
        B: HttpBody,
    {
        if let Some(content_type) = response.headers().get(header::CONTENT_TYPE) {
            if let Ok(content_type) = content_type.to_str() {
                if content_type.starts_with("image/") {
                    return false;
                }
            }
        }
        self.inner.should_compress(response)
    }
}

fn build_app(state: Arc<AppState>) -> Router {
    let max_in_flight = state.config.max_in_flight_requests.max(1);
    let max_body = state.config.max_request_body_bytes.max(1024);
    let access_state = state.clone();
    http::router(state)
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(CompressionLayer::new().compress_when(NoImageCompression::new()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false)),
        )
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        .layer(middleware::from_fn(move |request, next| {
            let state = access_state.clone();
            async move { http::access_middleware(state, request, next).await }
        }))
        .layer(ConcurrencyLimitLayer::new(max_in_flight))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    if config.hotlink_protection && config.site_origin.is_none() {
        warn!("HOTLINK_PROTECTION is on but no SITE_ORIGIN could be derived; serving unguarded");
    }
    info!(
        upload_dir = %config.upload_dir.display(),
        public_base_url = %config.public_base_url,
        cache_ttl_days = config.cache_ttl.as_secs() / 86_400,
        sweep_interval_seconds = config.sweep_interval.as_secs(),
        fetch_timeout_seconds = config.fetch_timeout_seconds,
        fetch_retries = config.fetch_retries,
        max_concurrent_composites = config.max_concurrent_composites,
        rate_limit_per_minute = config.rate_limit_per_minute,
        allow_private_networks = config.allow_private_networks,
        "startup config summary"
    );

    let source = fetch::build_source(&config)?;
    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(AppState::new(config, source, metrics));

    let sweep_interval = state.config.sweep_interval;
    if !sweep_interval.is_zero() {
        let cache = state.cache.clone();
        let sweep_metrics = state.metrics.clone();
        tokio::spawn(async move {
            cache
                .sweep_loop(sweep_interval, move |report| {
                    sweep_metrics.add_sweep_removed(report.removed)
                })
                .await;
        });
    }

    let stats_interval = state.config.cache_stats_interval;
    if state.config.metrics_enabled && !stats_interval.is_zero() {
        let metrics_state = state.clone();
        tokio::spawn(async move {
            loop {
                metrics::refresh_metrics(&metrics_state).await;
                tokio::time::sleep(stats_interval).await;
            }
        });
    }

    let app = build_app(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "compositor listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
