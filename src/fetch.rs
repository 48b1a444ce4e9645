use crate::config::Config;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use url::{Host, Url};

const USER_AGENT: &str = "logo-compositor/0.1";
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("image url is empty")]
    EmptyUrl,
    #[error("invalid image url")]
    InvalidUri,
    #[error("image fetch blocked")]
    Blocked,
    #[error("image too large")]
    TooLarge,
    #[error("image fetch from {url} returned an empty body")]
    EmptyBody { url: String },
    #[error("image fetch failed from {url}: {status}")]
    UpstreamStatus { status: StatusCode, url: String },
    #[error("image fetch failed from {url}")]
    Upstream { url: String },
    #[error("image fetch timed out for {url}")]
    Timeout { url: String },
}

impl FetchError {
    /// Failures worth another attempt: timeouts, connection errors, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Upstream { .. } => true,
            FetchError::UpstreamStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::EmptyUrl => "empty_url",
            FetchError::InvalidUri => "invalid_uri",
            FetchError::Blocked => "blocked",
            FetchError::TooLarge => "too_large",
            FetchError::EmptyBody { .. } => "empty_body",
            FetchError::UpstreamStatus { .. } => "upstream_status",
            FetchError::Upstream { .. } => "upstream",
            FetchError::Timeout { .. } => "timeout",
        }
    }
}

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>>;

/// Something that can turn an image URL into raw bytes.
pub trait ImageSource: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a>;
}

/// Builds the production source: HTTP, wrapped in retries when configured.
pub fn build_source(config: &Config) -> anyhow::Result<Arc<dyn ImageSource>> {
    let http = HttpImageSource::new(config)?;
    if config.fetch_retries == 0 {
        return Ok(Arc::new(http));
    }
    Ok(Arc::new(RetryingSource::new(
        http,
        config.fetch_retries,
        config.fetch_retry_backoff,
    )))
}

struct ResolvedHttpUrl {
    parsed: Url,
    host: String,
    addrs: Vec<SocketAddr>,
    is_ip_literal: bool,
}

pub struct HttpImageSource {
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
    connect_timeout: Duration,
    max_bytes: usize,
    allow_http: bool,
    allow_private_networks: bool,
}

impl HttpImageSource {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.fetch_timeout_seconds);
        let connect_timeout = Duration::from_secs(config.fetch_connect_timeout_seconds);
        let client = base_client(timeout, connect_timeout).build()?;
        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
            timeout,
            connect_timeout,
            max_bytes: config.max_source_bytes,
            allow_http: config.allow_http,
            allow_private_networks: config.allow_private_networks,
        })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(FetchError::EmptyUrl);
        }
        let resolved = self.validate_http_url(url).await?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| FetchError::Upstream {
                url: url.to_string(),
            })?;
        let mut response = self.send_pinned_request(&resolved).await?;
        let source_url = resolved.parsed.as_str();
        if response.status() != StatusCode::OK {
            return Err(FetchError::UpstreamStatus {
                status: response.status(),
                url: source_url.to_string(),
            });
        }
        if let Some(length) = response.content_length()
            && length > self.max_bytes as u64
        {
            return Err(FetchError::TooLarge);
        }
        let mut buffer = BytesMut::with_capacity(std::cmp::min(self.max_bytes, 64 * 1024));
        let mut total = 0usize;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return Err(classify_reqwest_error(&err, source_url)),
            };
            total = total.saturating_add(chunk.len());
            if total > self.max_bytes {
                return Err(FetchError::TooLarge);
            }
            buffer.extend_from_slice(&chunk);
        }
        if total == 0 {
            return Err(FetchError::EmptyBody {
                url: source_url.to_string(),
            });
        }
        debug!(url = %source_url, size = total, "fetched source image");
        Ok(buffer.freeze())
    }

    async fn validate_http_url(&self, url: &str) -> Result<ResolvedHttpUrl, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUri)?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(FetchError::InvalidUri);
        }
        if scheme == "http" && !self.allow_http {
            return Err(FetchError::Blocked);
        }
        let (addrs, is_ip_literal) = self.resolve_public_host(&parsed).await?;
        let host = parsed
            .host_str()
            .ok_or(FetchError::InvalidUri)?
            .to_string();
        Ok(ResolvedHttpUrl {
            parsed,
            host,
            addrs,
            is_ip_literal,
        })
    }

    async fn resolve_public_host(&self, url: &Url) -> Result<(Vec<SocketAddr>, bool), FetchError> {
        let allow_private = self.allow_private_networks;
        let host_raw = url.host_str().ok_or(FetchError::InvalidUri)?;
        let host = host_raw.trim_end_matches('.');
        let port = url
            .port_or_known_default()
            .unwrap_or_else(|| if url.scheme() == "https" { 443 } else { 80 });
        if !allow_private
            && (host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost"))
        {
            return Err(FetchError::Blocked);
        }
        if let Some(host) = url.host() {
            match host {
                Host::Ipv4(addr) => {
                    if !allow_private && is_private_ip(IpAddr::V4(addr)) {
                        return Err(FetchError::Blocked);
                    }
                    return Ok((vec![SocketAddr::new(IpAddr::V4(addr), port)], true));
                }
                Host::Ipv6(addr) => {
                    if !allow_private && is_private_ip(IpAddr::V6(addr)) {
                        return Err(FetchError::Blocked);
                    }
                    return Ok((vec![SocketAddr::new(IpAddr::V6(addr), port)], true));
                }
                Host::Domain(_) => {}
            }
        }
        if allow_private {
            return Ok((Vec::new(), false));
        }
        let mut addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|_| FetchError::Upstream {
                url: url.as_str().to_string(),
            })?
            .collect();
        addrs.retain(|addr| !is_private_ip(addr.ip()));
        if addrs.is_empty() {
            return Err(FetchError::Blocked);
        }
        Ok((addrs, false))
    }

    /// Connects only to the vetted addresses so a second DNS answer cannot
    /// steer the request somewhere private.
    async fn send_pinned_request(
        &self,
        resolved: &ResolvedHttpUrl,
    ) -> Result<reqwest::Response, FetchError> {
        let source_url = resolved.parsed.as_str();
        if resolved.is_ip_literal || resolved.addrs.is_empty() {
            return self
                .client
                .get(resolved.parsed.clone())
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err, source_url));
        }
        let mut last_err = None;
        for addr in resolved.addrs.iter().copied() {
            let client = self.client_with_resolve(&resolved.host, addr)?;
            match client.get(resolved.parsed.clone()).send().await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!(url = %source_url, addr = %addr, error = ?err, "pinned request failed");
                    last_err = Some(classify_reqwest_error(&err, source_url));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Upstream {
            url: source_url.to_string(),
        }))
    }

    fn client_with_resolve(
        &self,
        host: &str,
        addr: SocketAddr,
    ) -> Result<reqwest::Client, FetchError> {
        base_client(self.timeout, self.connect_timeout)
            .resolve(host, addr)
            .build()
            .map_err(|_| FetchError::Upstream {
                url: format!("{host}@{addr}"),
            })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(self.fetch_bytes(url))
    }
}

fn base_client(timeout: Duration, connect_timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(USER_AGENT)
}

fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Upstream {
            url: url.to_string(),
        }
    }
}

/// Retries transient failures of the wrapped source with exponential backoff.
pub struct RetryingSource<S> {
    inner: S,
    retries: u32,
    backoff: Duration,
}

impl<S: ImageSource> RetryingSource<S> {
    pub fn new(inner: S, retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            retries,
            backoff,
        }
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<Bytes, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.fetch(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if attempt < self.retries && err.is_transient() => {
                    let delay = self
                        .backoff
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(MAX_RETRY_BACKOFF);
                    warn!(
                        url = %url,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying source image fetch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<S: ImageSource> ImageSource for RetryingSource<S> {
    fn fetch<'a>(&'a self, url: &'a str) -> FetchFuture<'a> {
        Box::pin(self.fetch_with_retry(url))
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => is_private_v4(addr),
        IpAddr::V6(addr) => {
            if let Some(v4) = addr.to_ipv4() {
                return is_private_v4(v4);
            }
            addr.is_loopback()
                || addr.is_unicast_link_local()
                || addr.is_unique_local()
                || addr.is_multicast()
                || addr.is_unspecified()
        }
    }
}

fn is_private_v4(addr: std::net::Ipv4Addr) -> bool {
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_multicast()
        || addr.is_unspecified()
        || is_cgnat_v4(addr)
}

fn is_cgnat_v4(addr: std::net::Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    a == 100 && (b & 0b1100_0000) == 0b0100_0000
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use axum::Router;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::get;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route("/ok.png", get(|| async { vec![1u8, 2, 3, 4] }))
            .route("/empty.png", get(|| async { Vec::<u8>::new() }))
            .route(
                "/missing.png",
                get(|| async { (AxumStatus::NOT_FOUND, "missing") }),
            )
            .route("/huge.png", get(|| async { vec![0u8; 4096] }))
            .route(
                "/redirect.png",
                get(|| async {
                    (
                        AxumStatus::FOUND,
                        [(axum::http::header::LOCATION, "/ok.png")],
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn source(allow_private: bool) -> HttpImageSource {
        let dir = std::env::temp_dir();
        let mut config = test_config(dir);
        config.allow_private_networks = allow_private;
        config.max_source_bytes = 1024;
        HttpImageSource::new(&config).unwrap()
    }

    #[tokio::test]
    async fn fetches_bytes_from_local_server() {
        let addr = spawn_server().await;
        let bytes = source(true)
            .fetch(&format!("http://{addr}/ok.png"))
            .await
            .unwrap();
        assert_eq!(bytes.as_ref(), &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn non_ok_status_is_an_error() {
        let addr = spawn_server().await;
        let http = source(true);
        let err = http
            .fetch(&format!("http://{addr}/missing.png"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::UpstreamStatus { status, .. } if status == StatusCode::NOT_FOUND
        ));
        let err = http
            .fetch(&format!("http://{addr}/redirect.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::UpstreamStatus { .. }));
    }

    #[tokio::test]
    async fn empty_body_and_oversized_body_fail() {
        let addr = spawn_server().await;
        let http = source(true);
        let err = http
            .fetch(&format!("http://{addr}/empty.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody { .. }));
        let err = http
            .fetch(&format!("http://{addr}/huge.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge));
    }

    #[tokio::test]
    async fn rejects_bad_urls_before_connecting() {
        let http = source(false);
        assert!(matches!(http.fetch("  ").await, Err(FetchError::EmptyUrl)));
        assert!(matches!(
            http.fetch("ftp://example.com/a.png").await,
            Err(FetchError::InvalidUri)
        ));
        assert!(matches!(
            http.fetch("not a url").await,
            Err(FetchError::InvalidUri)
        ));
        assert!(matches!(
            http.fetch("http://127.0.0.1:9/a.png").await,
            Err(FetchError::Blocked)
        ));
        assert!(matches!(
            http.fetch("http://localhost/a.png").await,
            Err(FetchError::Blocked)
        ));
        assert!(matches!(
            http.fetch("http://[::1]/a.png").await,
            Err(FetchError::Blocked)
        ));
    }

    #[tokio::test]
    async fn plain_http_can_be_disabled() {
        let mut config = test_config(std::env::temp_dir());
        config.allow_http = false;
        let http = HttpImageSource::new(&config).unwrap();
        assert!(matches!(
            http.fetch("http://example.com/a.png").await,
            Err(FetchError::Blocked)
        ));
    }

    #[test]
    fn is_private_ip_handles_ipv4_mapped_ipv6() {
        let loopback: IpAddr = "::ffff:127.0.0.1".parse().unwrap();
        assert!(is_private_ip(loopback));
        let metadata: IpAddr = "::ffff:169.254.169.254".parse().unwrap();
        assert!(is_private_ip(metadata));
        let public: IpAddr = "::ffff:8.8.8.8".parse().unwrap();
        assert!(!is_private_ip(public));
    }

    #[test]
    fn is_private_ip_blocks_cgnat_range() {
        assert!(!is_private_ip("100.63.255.255".parse().unwrap()));
        assert!(is_private_ip("100.64.0.0".parse().unwrap()));
        assert!(is_private_ip("100.127.255.255".parse().unwrap()));
        assert!(!is_private_ip("100.128.0.0".parse().unwrap()));
    }

    struct FlakySource {
        failures: Mutex<Vec<FetchError>>,
        calls: AtomicUsize,
    }

    impl ImageSource for FlakySource {
        fn fetch<'a>(&'a self, _url: &'a str) -> FetchFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                match self.failures.lock().unwrap().pop() {
                    Some(err) => Err(err),
                    None => Ok(Bytes::from_static(b"img")),
                }
            })
        }
    }

    fn flaky(failures: Vec<FetchError>) -> RetryingSource<FlakySource> {
        RetryingSource::new(
            FlakySource {
                failures: Mutex::new(failures),
                calls: AtomicUsize::new(0),
            },
            2,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let source = flaky(vec![
            FetchError::Timeout { url: "u".into() },
            FetchError::UpstreamStatus {
                status: StatusCode::BAD_GATEWAY,
                url: "u".into(),
            },
        ]);
        assert_eq!(source.fetch("u").await.unwrap().as_ref(), b"img");
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let source = flaky(vec![
            FetchError::Upstream { url: "u".into() },
            FetchError::Upstream { url: "u".into() },
            FetchError::Upstream { url: "u".into() },
        ]);
        assert!(matches!(
            source.fetch("u").await,
            Err(FetchError::Upstream { .. })
        ));
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_skips_permanent_failures() {
        let source = flaky(vec![FetchError::UpstreamStatus {
            status: StatusCode::NOT_FOUND,
            url: "u".into(),
        }]);
        assert!(source.fetch("u").await.is_err());
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);
    }
}
