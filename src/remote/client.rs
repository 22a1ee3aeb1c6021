//! Remote-tier client: a pluggable backend behind one typed seam, wrapped
//! with retry/backoff and bounded-age caches that a poll loop reconciles
//! against authoritative remote state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, sleep};

use crate::error::{FsError, FsResult};
use crate::models::Entry;
use crate::util::{norm_path, parent_of};

/// Contract every remote backend satisfies. Paths are normalized logical
/// paths; key layout inside the store is the backend's business.
///
/// Errors: `RemoteUnavailable` on connection loss, `NotFound` on a missing
/// path, `QuotaExceeded` on provider-side throttling.
#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Immediate children of a directory path.
    async fn list(&self, path: &str) -> FsResult<Vec<Entry>>;
    async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes>;
    async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry>;
    async fn rename(&self, path: &str, new_path: &str) -> FsResult<Entry>;
    async fn delete(&self, path: &str) -> FsResult<()>;
    async fn stat(&self, path: &str) -> FsResult<Option<Entry>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Every call goes to the backend.
    Off,
    /// Metadata only (dir + attr).
    Minimal,
    /// Metadata and read data.
    #[default]
    Full,
}

impl std::str::FromStr for CacheMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(CacheMode::Off),
            "minimal" => Ok(CacheMode::Minimal),
            "full" => Ok(CacheMode::Full),
            other => Err(format!("unknown cache mode {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RemoteTuning {
    pub cache_mode: CacheMode,
    /// TTL for cached read data.
    pub cache_max_age: Duration,
    /// Byte bound for cached read data.
    pub cache_max_size: u64,
    /// TTL for cached directory listings.
    pub dir_cache_time: Duration,
    /// TTL for cached attributes.
    pub attr_timeout: Duration,
    /// Interval of the reconciliation loop.
    pub poll_interval: Duration,
    /// Bound on a single backend call; a timed-out call surfaces as
    /// `RemoteUnavailable` and is retried like any transient failure.
    pub op_timeout: Duration,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
}

impl Default for RemoteTuning {
    fn default() -> Self {
        Self {
            cache_mode: CacheMode::Full,
            cache_max_age: Duration::from_secs(3600),
            cache_max_size: 10 * 1024 * 1024 * 1024,
            dir_cache_time: Duration::from_secs(300),
            attr_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(60),
            op_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay_ms: 100,
        }
    }
}

/// Retry `op` with doubling delay while the error is retryable. Each call
/// is bounded by `op_timeout`.
pub(crate) async fn with_retry<T, F, Fut>(
    max_retries: u32,
    initial_delay_ms: u64,
    op_timeout: Duration,
    op_name: &str,
    op: F,
) -> FsResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = FsResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(op_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(FsError::RemoteUnavailable(format!(
                "{op_name} timed out after {op_timeout:?}"
            ))),
        };
        match outcome {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt <= max_retries => {
                let delay_ms = initial_delay_ms * 2u64.pow(attempt - 1);
                debug!("{op_name} attempt {attempt} failed: {e}; retrying in {delay_ms}ms");
                sleep(Duration::from_millis(delay_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

type DataKey = (String, u64, usize);

pub struct RemoteClient<B: RemoteBackend> {
    backend: B,
    tuning: RemoteTuning,
    data_cache: moka::future::Cache<DataKey, Bytes>,
    dir_cache: moka::future::Cache<String, Arc<Vec<Entry>>>,
    attr_cache: moka::future::Cache<String, Option<Entry>>,
}

impl<B: RemoteBackend> RemoteClient<B> {
    pub fn new(backend: B, tuning: RemoteTuning) -> Self {
        let data_cache = moka::future::Cache::builder()
            .max_capacity(tuning.cache_max_size)
            .weigher(|_k: &DataKey, v: &Bytes| v.len().try_into().unwrap_or(u32::MAX))
            .time_to_live(tuning.cache_max_age)
            .support_invalidation_closures()
            .build();
        let dir_cache = moka::future::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(tuning.dir_cache_time)
            .build();
        let attr_cache = moka::future::Cache::builder()
            .max_capacity(100_000)
            .time_to_live(tuning.attr_timeout)
            .build();
        Self {
            backend,
            tuning,
            data_cache,
            dir_cache,
            attr_cache,
        }
    }

    pub fn tuning(&self) -> &RemoteTuning {
        &self.tuning
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn cache_meta(&self) -> bool {
        self.tuning.cache_mode != CacheMode::Off
    }

    fn cache_data(&self) -> bool {
        self.tuning.cache_mode == CacheMode::Full
    }

    async fn fetch_list(&self, dir: &str) -> FsResult<Vec<Entry>> {
        with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote list",
            || self.backend.list(dir),
        )
        .await
    }

    pub async fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        let dir = norm_path(path);
        if self.cache_meta() {
            if let Some(cached) = self.dir_cache.get(&dir).await {
                return Ok(cached.as_ref().clone());
            }
        }
        let entries = self.fetch_list(&dir).await?;
        if self.cache_meta() {
            self.dir_cache.insert(dir, Arc::new(entries.clone())).await;
        }
        Ok(entries)
    }

    pub async fn stat(&self, path: &str) -> FsResult<Option<Entry>> {
        let path = norm_path(path);
        if self.cache_meta() {
            if let Some(cached) = self.attr_cache.get(&path).await {
                return Ok(cached);
            }
        }
        let entry = with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote stat",
            || self.backend.stat(&path),
        )
        .await?;
        if self.cache_meta() {
            self.attr_cache.insert(path, entry.clone()).await;
        }
        Ok(entry)
    }

    pub async fn read(&self, path: &str, offset: u64, len: usize) -> FsResult<Bytes> {
        let path = norm_path(path);
        let key = (path.clone(), offset, len);
        if self.cache_data() {
            if let Some(cached) = self.data_cache.get(&key).await {
                return Ok(cached);
            }
        }
        let data = with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote read",
            || self.backend.read(&path, offset, len),
        )
        .await?;
        if self.cache_data() {
            self.data_cache.insert(key, data.clone()).await;
        }
        Ok(data)
    }

    pub async fn write(&self, path: &str, data: &[u8]) -> FsResult<Entry> {
        let path = norm_path(path);
        let entry = with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote write",
            || self.backend.write(&path, data),
        )
        .await?;
        self.invalidate_path(&path).await;
        Ok(entry)
    }

    pub async fn rename(&self, path: &str, new_path: &str) -> FsResult<Entry> {
        let path = norm_path(path);
        let new_path = norm_path(new_path);
        let entry = with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote rename",
            || self.backend.rename(&path, &new_path),
        )
        .await?;
        self.invalidate_path(&path).await;
        self.invalidate_path(&new_path).await;
        Ok(entry)
    }

    pub async fn delete(&self, path: &str) -> FsResult<()> {
        let path = norm_path(path);
        with_retry(
            self.tuning.max_retries,
            self.tuning.initial_retry_delay_ms,
            self.tuning.op_timeout,
            "remote delete",
            || self.backend.delete(&path),
        )
        .await?;
        self.invalidate_path(&path).await;
        Ok(())
    }

    /// Readiness probe, no retry: startup wants to fail fast.
    pub async fn probe(&self) -> FsResult<()> {
        match tokio::time::timeout(self.tuning.op_timeout, self.backend.list("/")).await {
            Ok(r) => r.map(|_| ()),
            Err(_) => Err(FsError::RemoteUnavailable(format!(
                "probe timed out after {:?}",
                self.tuning.op_timeout
            ))),
        }
    }

    async fn invalidate_path(&self, path: &str) {
        self.attr_cache.invalidate(&path.to_string()).await;
        self.dir_cache.invalidate(&parent_of(path)).await;
        self.dir_cache.invalidate(&path.to_string()).await;
        let p = path.to_string();
        let _ = self
            .data_cache
            .invalidate_entries_if(move |k: &DataKey, _v: &Bytes| k.0 == p);
    }

    /// One reconciliation pass: re-list every cached directory and replace
    /// entries that went stale. Returns how many listings were replaced.
    pub async fn poll_once(&self) -> FsResult<usize> {
        let cached_dirs: Vec<(String, Arc<Vec<Entry>>)> = self
            .dir_cache
            .iter()
            .map(|(k, v)| (k.as_ref().clone(), v))
            .collect();
        let mut replaced = 0usize;
        for (dir, old) in cached_dirs {
            let fresh = self.fetch_list(&dir).await?;
            if !listings_equal(&old, &fresh) {
                for path in changed_paths(&old, &fresh) {
                    self.attr_cache.invalidate(&path).await;
                    let p = path.clone();
                    let _ = self
                        .data_cache
                        .invalidate_entries_if(move |k: &DataKey, _v: &Bytes| k.0 == p);
                }
                self.dir_cache.insert(dir, Arc::new(fresh)).await;
                replaced += 1;
            }
        }
        Ok(replaced)
    }

    /// Long-lived reconciliation loop, stopped through the shutdown channel.
    pub async fn run_poller(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.cache_meta() {
            return;
        }
        let mut ticker = tokio::time::interval(self.tuning.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(n) => debug!("cache poll refreshed {n} directory listings"),
                        Err(e) => warn!("cache poll failed: {e}"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

fn listings_equal(a: &[Entry], b: &[Entry]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let key = |e: &Entry| (e.path.clone(), e.kind, e.size, e.mtime);
    let mut ka: Vec<_> = a.iter().map(key).collect();
    let mut kb: Vec<_> = b.iter().map(key).collect();
    ka.sort();
    kb.sort();
    ka == kb
}

/// Paths present in either listing whose (kind, size, mtime) differ.
fn changed_paths(old: &[Entry], fresh: &[Entry]) -> Vec<String> {
    use std::collections::HashMap;
    let index = |list: &[Entry]| -> HashMap<String, (crate::models::EntryKind, u64, std::time::SystemTime)> {
        list.iter()
            .map(|e| (e.path.clone(), (e.kind, e.size, e.mtime)))
            .collect()
    };
    let oi = index(old);
    let fi = index(fresh);
    let mut out = Vec::new();
    for (path, meta) in &oi {
        if fi.get(path) != Some(meta) {
            out.push(path.clone());
        }
    }
    for path in fi.keys() {
        if !oi.contains_key(path) {
            out.push(path.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memfs::MemBackend;

    fn fast_tuning() -> RemoteTuning {
        RemoteTuning {
            initial_retry_delay_ms: 1,
            ..RemoteTuning::default()
        }
    }

    #[tokio::test]
    async fn list_is_served_from_cache_until_poll_reconciles() {
        let backend = MemBackend::new();
        backend.seed("/docs/a.txt", b"aaa").await;
        let client = RemoteClient::new(backend, fast_tuning());

        assert_eq!(client.list("/docs").await.unwrap().len(), 1);

        // Mutate the store behind the cache's back.
        client.backend.seed("/docs/b.txt", b"bbb").await;
        assert_eq!(client.list("/docs").await.unwrap().len(), 1);

        let replaced = client.poll_once().await.unwrap();
        assert_eq!(replaced, 1);
        assert_eq!(client.list("/docs").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn write_through_client_invalidates_cached_listing() {
        let backend = MemBackend::new();
        backend.seed("/docs/a.txt", b"aaa").await;
        let client = RemoteClient::new(backend, fast_tuning());

        assert_eq!(client.list("/docs").await.unwrap().len(), 1);
        client.write("/docs/b.txt", b"bbb").await.unwrap();
        assert_eq!(client.list("/docs").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let backend = MemBackend::new();
        backend.fail_next_writes(2);
        let client = RemoteClient::new(backend, fast_tuning());

        let entry = client.write("/x.txt", b"payload").await.unwrap();
        assert_eq!(entry.size, 7);
        assert!(client.backend.contains("/x.txt").await);
    }

    #[tokio::test]
    async fn retries_exhaust_into_the_original_error() {
        let backend = MemBackend::new();
        backend.set_unavailable(true);
        let client = RemoteClient::new(backend, fast_tuning());

        let err = client.write("/x.txt", b"p").await.unwrap_err();
        assert!(matches!(err, crate::error::FsError::RemoteUnavailable(_)));
    }

    #[tokio::test]
    async fn cache_mode_off_always_hits_backend() {
        let backend = MemBackend::new();
        backend.seed("/a.txt", b"1").await;
        let tuning = RemoteTuning {
            cache_mode: CacheMode::Off,
            ..fast_tuning()
        };
        let client = RemoteClient::new(backend, tuning);

        assert_eq!(client.list("/").await.unwrap().len(), 1);
        client.backend.seed("/b.txt", b"2").await;
        // No cache in the way: the second listing sees the new object.
        assert_eq!(client.list("/").await.unwrap().len(), 2);
    }
}
