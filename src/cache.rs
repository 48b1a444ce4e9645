use crate::config::Config;
use anyhow::{Context, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use url::Url;

pub const COMPOSITE_DIR_NAME: &str = "composite-images";
pub const ACCESS_POLICY_FILE: &str = ".htaccess";
const TEMP_MARKER: &str = ".png.tmp-";
const TEMP_FILE_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create composite directory {path}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write composite temp file {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to publish composite {path}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct CompositeArtifact {
    pub key: String,
    pub path: PathBuf,
    pub url: String,
    pub created_at: SystemTime,
    pub size: u64,
    pub from_cache: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub kept: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
}

/// Disk-backed composite store keyed by the hash of the source URL pair.
/// File presence and mtime are the only metadata.
#[derive(Clone)]
pub struct CompositeCache {
    root: PathBuf,
    public_base_url: String,
    site_origin: Option<String>,
    ttl: Duration,
}

impl CompositeCache {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.composite_dir(),
            public_base_url: format!("{}/{COMPOSITE_DIR_NAME}", config.public_base_url),
            site_origin: config.site_origin.clone(),
            ttl: config.cache_ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.png"))
    }

    pub fn public_url(&self, key: &str) -> String {
        format!("{}/{key}.png", self.public_base_url)
    }

    pub async fn lookup(&self, mockup_url: &str, logo_url: &str) -> Option<CompositeArtifact> {
        self.lookup_key(&cache_key(mockup_url, logo_url)).await
    }

    /// Returns a fresh entry, purging it first if it has aged out.
    pub async fn lookup_key(&self, key: &str) -> Option<CompositeArtifact> {
        let path = self.entry_path(key);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return None,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = ?err, path = %path.display(), "composite metadata read failed");
                return None;
            }
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if !is_fresh(modified, self.ttl) {
            debug!(key = %key, "purging stale composite");
            if let Err(err) = tokio::fs::remove_file(&path).await
                && err.kind() != ErrorKind::NotFound
            {
                warn!(error = ?err, path = %path.display(), "stale composite removal failed");
            }
            return None;
        }
        Some(CompositeArtifact {
            key: key.to_string(),
            url: self.public_url(key),
            path,
            created_at: modified,
            size: metadata.len(),
            from_cache: true,
        })
    }

    /// Publishes `bytes` under `key` with a temp-file-then-rename so readers
    /// never observe a partial file.
    pub async fn store(&self, key: &str, bytes: &[u8]) -> Result<CompositeArtifact, StoreError> {
        self.ensure_root().await?;
        let path = self.entry_path(key);
        let nonce: u64 = rand::random();
        let temp_path = self.root.join(format!(".{key}{TEMP_MARKER}{nonce:016x}"));
        if let Err(source) = write_synced(&temp_path, bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: temp_path,
                source,
            });
        }
        if let Err(source) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StoreError::Publish { path, source });
        }
        debug!(key = %key, bytes = bytes.len(), "composite stored");
        Ok(CompositeArtifact {
            key: key.to_string(),
            url: self.public_url(key),
            path,
            created_at: SystemTime::now(),
            size: bytes.len() as u64,
            from_cache: false,
        })
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::CreateRoot {
                path: self.root.clone(),
                source,
            })?;
        let policy_path = self.root.join(ACCESS_POLICY_FILE);
        let result = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&policy_path)
            .await;
        match result {
            Ok(mut file) => {
                let policy = access_policy(self.site_origin.as_deref());
                let written = match file.write_all(policy.as_bytes()).await {
                    Ok(()) => file.flush().await,
                    Err(err) => Err(err),
                };
                if let Err(source) = written {
                    return Err(StoreError::CreateRoot {
                        path: policy_path,
                        source,
                    });
                }
                info!(path = %policy_path.display(), "wrote composite access policy");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(source) => Err(StoreError::CreateRoot {
                path: policy_path,
                source,
            }),
        }
    }

    /// Deletes aged-out composites and abandoned temp files. The access policy
    /// and unrelated files are left alone.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let root = self.root.clone();
        let ttl = self.ttl;
        tokio::task::spawn_blocking(move || sweep_dir(&root, ttl))
            .await
            .context("sweep task panicked")?
    }

    pub async fn sweep_loop(self, interval: Duration, on_sweep: impl Fn(&SweepReport) + Send) {
        loop {
            match self.sweep().await {
                Ok(report) => {
                    on_sweep(&report);
                    info!(
                        scanned = report.scanned,
                        removed = report.removed,
                        kept = report.kept,
                        "composite sweep complete"
                    );
                }
                Err(err) => warn!(error = ?err, "composite sweep failed"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<CacheStats> {
            let mut stats = CacheStats::default();
            for entry in list_files(&root)? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else {
                    continue;
                };
                if !matches!(classify(name), EntryKind::Composite) {
                    continue;
                }
                if let Ok(metadata) = entry.metadata() {
                    stats.entries += 1;
                    stats.bytes = stats.bytes.saturating_add(metadata.len());
                }
            }
            Ok(stats)
        })
        .await
        .context("cache stats task panicked")?
    }
}

/// SHA-256 over the canonical mockup URL, a NUL separator, then the canonical
/// logo URL. Swapping the pair yields a different key.
pub fn cache_key(mockup_url: &str, logo_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_url(mockup_url).as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_url(logo_url).as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalizes scheme and host case, default ports and percent-encoding, and
/// drops the fragment. Unparseable input is only trimmed.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    }
}

pub fn is_composite_file_name(name: &str) -> bool {
    match name.strip_suffix(".png") {
        Some(stem) => {
            stem.len() == 64
                && stem
                    .bytes()
                    .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
        }
        None => false,
    }
}

fn access_policy(site_origin: Option<&str>) -> String {
    let mut policy = String::from("# Protect composite images\nOptions -Indexes\n");
    if let Some(origin) = site_origin {
        policy.push_str("<IfModule mod_rewrite.c>\nRewriteEngine On\n");
        policy.push_str(&format!(
            "RewriteCond %{{HTTP_REFERER}} !^{} [NC]\n",
            origin.replace('.', "\\.")
        ));
        policy.push_str("RewriteRule .* - [F,L]\n</IfModule>\n");
    }
    policy
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

fn is_fresh(modified: SystemTime, ttl: Duration) -> bool {
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < ttl,
        Err(_) => true,
    }
}

enum EntryKind {
    Composite,
    Temp,
    Other,
}

fn classify(name: &str) -> EntryKind {
    if name == ACCESS_POLICY_FILE {
        EntryKind::Other
    } else if name.starts_with('.') && name.contains(TEMP_MARKER) {
        EntryKind::Temp
    } else if is_composite_file_name(name) {
        EntryKind::Composite
    } else {
        EntryKind::Other
    }
}

fn sweep_dir(root: &Path, ttl: Duration) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for entry in list_files(root)? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let max_age = match classify(name) {
            EntryKind::Composite => ttl,
            EntryKind::Temp => TEMP_FILE_GRACE.min(ttl),
            EntryKind::Other => continue,
        };
        report.scanned += 1;
        let modified = match entry.metadata().and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if is_fresh(modified, max_age) {
            report.kept += 1;
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => report.removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(error = ?err, path = %entry.path().display(), "sweep removal failed");
            }
        }
    }
    Ok(report)
}

fn list_files(dir: &Path) -> Result<Vec<std::fs::DirEntry>> {
    let mut entries = Vec::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(entries),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    for entry in read_dir {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Coalesces concurrent generation of the same key behind one leader. Waiters
/// re-check the disk cache once the leader finishes.
#[derive(Clone, Default)]
pub struct GenerationSingleflight {
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl GenerationSingleflight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, key: &str) -> SingleflightPermit {
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(entry) => SingleflightPermit {
                key: key.to_string(),
                notify: entry.get().clone(),
                is_leader: false,
                inner: self.inner.clone(),
            },
            Entry::Vacant(entry) => {
                let notify = Arc::new(Notify::new());
                entry.insert(notify.clone());
                SingleflightPermit {
                    key: key.to_string(),
                    notify,
                    is_leader: true,
                    inner: self.inner.clone(),
                }
            }
        }
    }
}

pub struct SingleflightPermit {
    key: String,
    notify: Arc<Notify>,
    is_leader: bool,
    inner: Arc<DashMap<String, Arc<Notify>>>,
}

impl SingleflightPermit {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Waits for the leader to finish. Returns false on timeout.
    pub async fn wait_result(self, timeout: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        // The leader may have finished before we registered.
        let pending = self
            .inner
            .get(&self.key)
            .map(|current| Arc::ptr_eq(current.value(), &self.notify))
            .unwrap_or(false);
        if !pending {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }
}

impl Drop for SingleflightPermit {
    fn drop(&mut self) {
        if !self.is_leader {
            return;
        }
        if let Some((_, notify)) = self.inner.remove(&self.key) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use filetime::FileTime;
    use tempfile::tempdir;

    fn backdate(path: &Path, age: Duration) {
        let when = FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_mtime(path, when).unwrap();
    }

    #[test]
    fn key_is_order_sensitive() {
        let forward = cache_key("https://a.example/m.png", "https://a.example/l.png");
        let reverse = cache_key("https://a.example/l.png", "https://a.example/m.png");
        assert_ne!(forward, reverse);
        assert_eq!(forward.len(), 64);
        assert_eq!(
            forward,
            cache_key("https://a.example/m.png", "https://a.example/l.png")
        );
    }

    #[test]
    fn key_separates_concatenation_boundaries() {
        assert_ne!(cache_key("ab", "c"), cache_key("a", "bc"));
    }

    #[test]
    fn canonical_url_normalizes_equivalent_spellings() {
        assert_eq!(
            canonical_url("  HTTPS://Shop.Example:443/img/logo.png#top "),
            "https://shop.example/img/logo.png"
        );
        assert_eq!(canonical_url(" not a url "), "not a url");
        assert_eq!(
            cache_key("https://shop.example/m.png", "https://shop.example/l.png"),
            cache_key("HTTPS://SHOP.example/m.png", "https://shop.example:443/l.png")
        );
    }

    #[test]
    fn composite_file_names_are_strict() {
        let key = "a".repeat(64);
        assert!(is_composite_file_name(&format!("{key}.png")));
        assert!(!is_composite_file_name(&format!("{}.png", "A".repeat(64))));
        assert!(!is_composite_file_name(".htaccess"));
        assert!(!is_composite_file_name(&format!(".{key}.png.tmp-1")));
        assert!(!is_composite_file_name("../etc/passwd.png"));
    }

    #[tokio::test]
    async fn store_then_lookup_hits() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let key = cache_key("m", "l");
        let stored = cache.store(&key, b"png-bytes").await.unwrap();
        assert!(!stored.from_cache);
        assert_eq!(
            stored.url,
            format!("https://shop.example/uploads/composite-images/{key}.png")
        );
        let hit = cache.lookup("m", "l").await.unwrap();
        assert!(hit.from_cache);
        assert_eq!(hit.path, stored.path);
        assert_eq!(hit.size, 9);
        assert_eq!(std::fs::read(&hit.path).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn store_writes_access_policy_once() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        cache.store(&cache_key("m", "l"), b"one").await.unwrap();
        let policy_path = cache.root().join(ACCESS_POLICY_FILE);
        let policy = std::fs::read_to_string(&policy_path).unwrap();
        assert!(policy.contains("RewriteCond %{HTTP_REFERER} !^https://shop\\.example [NC]"));
        assert!(policy.contains("RewriteRule .* - [F,L]"));

        std::fs::write(&policy_path, "custom").unwrap();
        cache.store(&cache_key("m", "l2"), b"two").await.unwrap();
        assert_eq!(std::fs::read_to_string(&policy_path).unwrap(), "custom");
    }

    #[tokio::test]
    async fn stale_entry_is_a_miss_and_removed() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let key = cache_key("m", "l");
        let stored = cache.store(&key, b"old").await.unwrap();
        backdate(&stored.path, Duration::from_secs(7 * 86_400 + 5));
        assert!(cache.lookup_key(&key).await.is_none());
        assert!(!stored.path.exists());
    }

    #[tokio::test]
    async fn entry_just_under_ttl_is_fresh() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let key = cache_key("m", "l");
        let stored = cache.store(&key, b"recent").await.unwrap();
        backdate(&stored.path, Duration::from_secs(7 * 86_400 - 120));
        assert!(cache.lookup_key(&key).await.is_some());
    }

    #[tokio::test]
    async fn store_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let key = cache_key("m", "l");
        cache.store(&key, b"first").await.unwrap();
        cache.store(&key, b"second").await.unwrap();
        let names = std::fs::read_dir(cache.root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
        assert!(names.contains(&format!("{key}.png")));
        assert!(names.contains(&ACCESS_POLICY_FILE.to_string()));
        assert_eq!(std::fs::read(cache.entry_path(&key)).unwrap(), b"second");
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_entry_or_temp_file() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let key = cache_key("m", "l");
        let blocker = cache.entry_path(&key);
        std::fs::create_dir_all(&blocker).unwrap();
        std::fs::write(blocker.join("occupied"), b"x").unwrap();

        let err = cache.store(&key, b"png-bytes").await.unwrap_err();
        assert!(matches!(err, StoreError::Publish { .. }));

        let mut names = std::fs::read_dir(cache.root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec![ACCESS_POLICY_FILE.to_string(), format!("{key}.png")]);
        assert!(blocker.is_dir());
        assert!(cache.lookup_key(&key).await.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_aged_entries() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        let fresh = cache.store(&cache_key("m", "fresh"), b"f").await.unwrap();
        let stale = cache.store(&cache_key("m", "stale"), b"s").await.unwrap();
        backdate(&stale.path, Duration::from_secs(8 * 86_400));

        let policy = cache.root().join(ACCESS_POLICY_FILE);
        backdate(&policy, Duration::from_secs(30 * 86_400));
        let unrelated = cache.root().join("notes.txt");
        std::fs::write(&unrelated, b"keep").unwrap();
        backdate(&unrelated, Duration::from_secs(30 * 86_400));
        let foreign_png = cache.root().join("banner.png");
        std::fs::write(&foreign_png, b"not ours").unwrap();
        backdate(&foreign_png, Duration::from_secs(30 * 86_400));
        let orphan = cache.root().join(format!(".{}.png.tmp-00ff", "b".repeat(64)));
        std::fs::write(&orphan, b"partial").unwrap();
        backdate(&orphan, Duration::from_secs(2 * 60 * 60));

        let report = cache.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                removed: 2,
                kept: 1,
            }
        );
        assert!(fresh.path.exists());
        assert!(!stale.path.exists());
        assert!(!orphan.exists());
        assert!(policy.exists());
        assert!(unrelated.exists());
        assert!(foreign_png.exists());
    }

    #[tokio::test]
    async fn sweep_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().join("absent")));
        assert_eq!(cache.sweep().await.unwrap(), SweepReport::default());
    }

    #[tokio::test]
    async fn stats_count_composites_only() {
        let dir = tempdir().unwrap();
        let cache = CompositeCache::new(&test_config(dir.path().to_path_buf()));
        cache.store(&cache_key("m", "a"), b"1234").await.unwrap();
        cache.store(&cache_key("m", "b"), b"56").await.unwrap();
        std::fs::write(cache.root().join("banner.png"), b"ignored").unwrap();
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 6);
    }

    #[tokio::test]
    async fn singleflight_elects_one_leader() {
        let flights = GenerationSingleflight::new();
        let leader = flights.acquire("k");
        let waiter = flights.acquire("k");
        assert!(leader.is_leader());
        assert!(!waiter.is_leader());
        let wait = tokio::spawn(waiter.wait_result(Duration::from_secs(5)));
        tokio::task::yield_now().await;
        drop(leader);
        assert!(wait.await.unwrap());
        assert!(flights.acquire("k").is_leader());
    }

    #[tokio::test]
    async fn singleflight_waiter_after_leader_finished_returns_immediately() {
        let flights = GenerationSingleflight::new();
        let leader = flights.acquire("k");
        let waiter = flights.acquire("k");
        drop(leader);
        assert!(waiter.wait_result(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn singleflight_waiter_times_out() {
        let flights = GenerationSingleflight::new();
        let _leader = flights.acquire("k");
        let waiter = flights.acquire("k");
        assert!(!waiter.wait_result(Duration::from_millis(20)).await);
    }
}
