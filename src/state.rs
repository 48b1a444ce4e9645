use crate::cache::{CompositeCache, GenerationSingleflight};
use crate::config::Config;
use crate::fetch::ImageSource;
use crate::metrics::Metrics;
use crate::rate_limit::GenerationLimiter;
use crate::token::TokenSigner;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: CompositeCache,
    pub source: Arc<dyn ImageSource>,
    pub signer: TokenSigner,
    pub singleflight: GenerationSingleflight,
    pub composite_semaphore: Arc<Semaphore>,
    pub rate_limiter: Option<GenerationLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Config, source: Arc<dyn ImageSource>, metrics: Arc<Metrics>) -> Self {
        let cache = CompositeCache::new(&config);
        let signer = TokenSigner::new(&config.token_secret, config.token_lifetime);
        let composite_semaphore = Arc::new(Semaphore::new(config.max_concurrent_composites));
        let rate_limiter =
            GenerationLimiter::new(config.rate_limit_per_minute, config.rate_limit_burst);
        Self {
            config: Arc::new(config),
            cache,
            source,
            signer,
            singleflight: GenerationSingleflight::new(),
            composite_semaphore,
            rate_limiter,
            metrics,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_state(upload_dir: std::path::PathBuf, source: Arc<dyn ImageSource>) -> AppState {
    AppState::new(
        crate::config::test_config(upload_dir),
        source,
        Arc::new(Metrics::new()),
    )
}
