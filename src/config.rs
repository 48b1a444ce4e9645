use anyhow::{Context, Result, anyhow};
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub token_secret: String,
    pub token_lifetime: Duration,
    pub token_endpoint_enabled: bool,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
    pub site_origin: Option<String>,
    pub hotlink_protection: bool,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub cache_stats_interval: Duration,
    pub fetch_timeout_seconds: u64,
    pub fetch_connect_timeout_seconds: u64,
    pub fetch_retries: u32,
    pub fetch_retry_backoff: Duration,
    pub max_source_bytes: usize,
    pub max_decoded_pixels: u64,
    pub max_concurrent_fetches: usize,
    pub max_concurrent_composites: usize,
    pub singleflight_wait: Duration,
    pub allow_http: bool,
    pub allow_private_networks: bool,
    pub max_in_flight_requests: usize,
    pub max_request_body_bytes: usize,
    pub rate_limit_per_minute: u64,
    pub rate_limit_burst: u64,
    pub trusted_proxies: Vec<IpNet>,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let token_secret = env::var("TOKEN_SECRET")
            .context("TOKEN_SECRET is required to sign composite tokens")?;
        if token_secret.trim().is_empty() {
            return Err(anyhow!("TOKEN_SECRET must not be empty"));
        }
        let token_lifetime = Duration::from_secs(parse_u64("TOKEN_LIFETIME_SECONDS", 86_400).max(2));
        let token_endpoint_enabled = parse_bool("TOKEN_ENDPOINT_ENABLED", true);

        let upload_dir = PathBuf::from(
            env::var("UPLOAD_DIR")
                .unwrap_or_else(|_| "/var/lib/logo-compositor/uploads".to_string()),
        );
        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{port}/uploads"));
        let public_base_url = public_base_url.trim_end_matches('/').to_string();
        let site_origin = match env::var("SITE_ORIGIN") {
            Ok(value) if !value.trim().is_empty() => {
                Some(value.trim().trim_end_matches('/').to_string())
            }
            _ => origin_of(&public_base_url)?,
        };
        let hotlink_protection = parse_bool("HOTLINK_PROTECTION", true);

        let cache_ttl = Duration::from_secs(parse_u64("CACHE_TTL_DAYS", 7).max(1) * 86_400);
        let sweep_interval = Duration::from_secs(parse_u64("SWEEP_INTERVAL_SECONDS", 86_400));
        let cache_stats_interval =
            Duration::from_secs(parse_u64("CACHE_STATS_INTERVAL_SECONDS", 300));

        let fetch_timeout_seconds = parse_u64("FETCH_TIMEOUT_SECONDS", 30).max(1);
        let fetch_connect_timeout_seconds = parse_u64("FETCH_CONNECT_TIMEOUT_SECONDS", 10).max(1);
        let fetch_retries = parse_u32("FETCH_RETRIES", 0);
        let fetch_retry_backoff = Duration::from_millis(parse_u64("FETCH_RETRY_BACKOFF_MS", 250));
        let max_source_bytes = parse_usize("MAX_SOURCE_BYTES", 20 * 1024 * 1024);
        let max_decoded_pixels = parse_u64("MAX_DECODED_PIXELS", 40_000_000);
        let max_concurrent_fetches = parse_usize("MAX_CONCURRENT_FETCHES", 16).max(1);
        let max_concurrent_composites = parse_usize("MAX_CONCURRENT_COMPOSITES", 4).max(1);
        let singleflight_wait = Duration::from_secs(parse_u64("SINGLEFLIGHT_WAIT_SECONDS", 30));
        let allow_http = parse_bool("ALLOW_HTTP", true);
        let allow_private_networks = parse_bool("ALLOW_PRIVATE_NETWORKS", false);

        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 256).max(1);
        let max_request_body_bytes = parse_usize("MAX_REQUEST_BODY_BYTES", 16 * 1024);
        let rate_limit_per_minute = parse_u64("RATE_LIMIT_PER_MINUTE", 0);
        let rate_limit_burst = parse_u64("RATE_LIMIT_BURST", 0);
        let trusted_proxies = parse_trusted_proxies("TRUSTED_PROXY_CIDRS")?;
        warn_on_broad_proxy_ranges(&trusted_proxies);
        let metrics_enabled = parse_bool("METRICS_ENABLED", true);

        Ok(Self {
            host,
            port,
            token_secret,
            token_lifetime,
            token_endpoint_enabled,
            upload_dir,
            public_base_url,
            site_origin,
            hotlink_protection,
            cache_ttl,
            sweep_interval,
            cache_stats_interval,
            fetch_timeout_seconds,
            fetch_connect_timeout_seconds,
            fetch_retries,
            fetch_retry_backoff,
            max_source_bytes,
            max_decoded_pixels,
            max_concurrent_fetches,
            max_concurrent_composites,
            singleflight_wait,
            allow_http,
            allow_private_networks,
            max_in_flight_requests,
            max_request_body_bytes,
            rate_limit_per_minute,
            rate_limit_burst,
            trusted_proxies,
            metrics_enabled,
        })
    }

    /// Directory holding `<key>.png` composites and the access policy file.
    pub fn composite_dir(&self) -> PathBuf {
        self.upload_dir.join(crate::cache::COMPOSITE_DIR_NAME)
    }
}

fn origin_of(raw: &str) -> Result<Option<String>> {
    let url = Url::parse(raw).with_context(|| format!("invalid PUBLIC_BASE_URL: {raw}"))?;
    let origin = url.origin();
    if !origin.is_tuple() {
        return Ok(None);
    }
    Ok(Some(origin.ascii_serialization()))
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().to_ascii_lowercase().parse().ok())
        .unwrap_or(default)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let list = raw
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();
    if list.is_empty() { None } else { Some(list) }
}

fn parse_trusted_proxies(key: &str) -> Result<Vec<IpNet>> {
    let values = match parse_list_env(key) {
        Some(values) => values,
        None => return Ok(Vec::new()),
    };
    let mut parsed = Vec::new();
    for value in values {
        if let Ok(net) = value.parse::<IpNet>() {
            parsed.push(net);
            continue;
        }
        if let Ok(addr) = value.parse::<IpAddr>() {
            parsed.push(IpNet::from(addr));
            continue;
        }
        return Err(anyhow!("invalid trusted proxy entry: {value}"));
    }
    Ok(parsed)
}

fn warn_on_broad_proxy_ranges(trusted: &[IpNet]) {
    for net in trusted {
        let prefix = net.prefix_len();
        let broad = if net.addr().is_ipv4() {
            prefix <= 8
        } else {
            prefix <= 32
        };
        if broad {
            warn!(
                cidr = %net,
                "trusted proxy range is very broad; clients may spoof IPs"
            );
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(upload_dir: PathBuf) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        token_secret: "test-secret".to_string(),
        token_lifetime: Duration::from_secs(86_400),
        token_endpoint_enabled: true,
        upload_dir,
        public_base_url: "https://shop.example/uploads".to_string(),
        site_origin: Some("https://shop.example".to_string()),
        hotlink_protection: true,
        cache_ttl: Duration::from_secs(7 * 86_400),
        sweep_interval: Duration::from_secs(86_400),
        cache_stats_interval: Duration::from_secs(300),
        fetch_timeout_seconds: 5,
        fetch_connect_timeout_seconds: 2,
        fetch_retries: 0,
        fetch_retry_backoff: Duration::from_millis(1),
        max_source_bytes: 1024 * 1024,
        max_decoded_pixels: 4_000_000,
        max_concurrent_fetches: 4,
        max_concurrent_composites: 2,
        singleflight_wait: Duration::from_secs(5),
        allow_http: true,
        allow_private_networks: true,
        max_in_flight_requests: 64,
        max_request_body_bytes: 16 * 1024,
        rate_limit_per_minute: 0,
        rate_limit_burst: 0,
        trusted_proxies: Vec::new(),
        metrics_enabled: true,
    }
}
