//! Source fetching: HTTP client with retries plus a local blob cache of raw payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sitepulse_core::Source;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "sitepulse-storage";

const BLOB_EXTENSION: &str = "bin";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Retrieves the raw payload of one source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError>;

    /// Drop every locally cached payload. Returns how many entries were removed.
    async fn invalidate(&self) -> anyhow::Result<usize> {
        Ok(0)
    }
}

#[async_trait]
impl<T: SourceFetcher + ?Sized> SourceFetcher for Arc<T> {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(source).await
    }

    async fn invalidate(&self) -> anyhow::Result<usize> {
        (**self).invalidate().await
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub key: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Persistent payload store keyed by source URL.
///
/// Each entry lives at `<root>/<sha256(url)>.bin` and is written through a
/// temp file plus rename, so readers never see a torn payload.
#[derive(Debug, Clone)]
pub struct BlobCache {
    root: PathBuf,
    max_age: Option<Duration>,
}

impl BlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_age: None,
        }
    }

    /// Entries older than `max_age` are treated as misses. `None` keeps them
    /// until [`BlobCache::clear`].
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_for(url: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root
            .join(format!("{}.{BLOB_EXTENSION}", Self::key_for(url)))
    }

    pub async fn get(&self, url: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(url);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("inspecting blob {}", path.display()))
            }
        };

        if let Some(max_age) = self.max_age {
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age >= max_age {
                debug!(url, age_secs = age.as_secs(), "blob expired");
                return Ok(None);
            }
        }

        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading blob {}", path.display())),
        }
    }

    pub async fn put(&self, url: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating blob directory {}", self.root.display()))?;

        let key = Self::key_for(url);
        let path = self.path_for(url);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob file {}", temp_path.display()))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| format!("writing temp blob file {}", temp_path.display()));
        }

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp blob {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredBlob {
            key,
            path,
            byte_size: bytes.len(),
        })
    }

    /// Remove every cached payload (and stray temp files).
    pub async fn clear(&self) -> anyhow::Result<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing blob directory {}", self.root.display()))
            }
        };

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing blob directory {}", self.root.display()))?
        {
            let path = entry.path();
            let is_blob = path
                .extension()
                .is_some_and(|ext| ext == BLOB_EXTENSION || ext == "tmp");
            if !is_blob {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing blob {}", path.display()))
                }
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Network fetcher: shared reqwest client, a global concurrency cap and
/// exponential backoff for transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Unavailable("fetcher is shutting down".to_string()))?;

        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(
                            status = status.as_u16(),
                            %final_url,
                            bytes = body.len(),
                            attempts = attempt + 1,
                            "source fetched"
                        );
                        return Ok(body);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying source fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying source fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
        self.fetch_bytes(&source.source_id, &source.url).await
    }
}

/// Fetcher that consults a [`BlobCache`] before going to the network.
///
/// Blob read/write problems are logged and ignored; only the inner fetch can
/// fail a call.
#[derive(Debug)]
pub struct CachingFetcher<F> {
    inner: F,
    blobs: BlobCache,
}

impl<F: SourceFetcher> CachingFetcher<F> {
    pub fn new(inner: F, blobs: BlobCache) -> Self {
        Self { inner, blobs }
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }
}

#[async_trait]
impl<F: SourceFetcher> SourceFetcher for CachingFetcher<F> {
    async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
        match self.blobs.get(&source.url).await {
            Ok(Some(bytes)) => {
                debug!(source_id = %source.source_id, bytes = bytes.len(), "blob cache hit");
                return Ok(bytes);
            }
            Ok(None) => {
                debug!(source_id = %source.source_id, "blob cache miss");
            }
            Err(err) => {
                warn!(source_id = %source.source_id, error = %format!("{err:#}"), "blob cache read failed");
            }
        }

        let bytes = self.inner.fetch(source).await?;

        if let Err(err) = self.blobs.put(&source.url, &bytes).await {
            warn!(source_id = %source.source_id, error = %format!("{err:#}"), "blob cache write failed");
        }
        Ok(bytes)
    }

    async fn invalidate(&self) -> anyhow::Result<usize> {
        let removed = self.blobs.clear().await?;
        let inner_removed = self.inner.invalidate().await?;
        Ok(removed + inner_removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for CountingFetcher {
        async fn fetch(&self, source: &Source) -> Result<Vec<u8>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::HttpStatus {
                    status: 503,
                    url: source.url.clone(),
                });
            }
            Ok(format!("payload-{n}").into_bytes())
        }
    }

    fn source() -> Source {
        Source::new("north", "North sheet", "https://sheets.example.invalid/north.csv")
    }

    /// Answers every connection with the same raw HTTP response.
    async fn serve_canned(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/sheet.csv")
    }

    fn no_retry_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 0,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        })
        .expect("client")
    }

    #[tokio::test]
    async fn http_fetcher_returns_the_body_of_a_success() {
        let url = serve_canned(
            "HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: 17\r\nConnection: close\r\n\r\ntask_id\nt1\nt2\nt3\n",
        )
        .await;
        let source = Source::new("local", "Local", url);

        let body = no_retry_fetcher().fetch(&source).await.expect("fetch");
        assert_eq!(body, b"task_id\nt1\nt2\nt3\n");
    }

    #[tokio::test]
    async fn http_fetcher_maps_error_status_to_fetch_error() {
        let url = serve_canned(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let err = no_retry_fetcher()
            .fetch_bytes("local", &url)
            .await
            .expect_err("404 must fail");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn blob_keys_are_stable_sha256_of_url() {
        assert_eq!(
            BlobCache::key_for("hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let blobs = BlobCache::new(dir.path().join("blobs"));
        let url = "https://sheets.example.invalid/a.csv";

        assert!(blobs.get(url).await.expect("get").is_none());
        blobs.put(url, b"first").await.expect("put");
        blobs.put(url, b"second").await.expect("put");
        assert_eq!(blobs.get(url).await.expect("get").as_deref(), Some(&b"second"[..]));
    }

    #[tokio::test]
    async fn clear_removes_every_blob() {
        let dir = tempdir().expect("tempdir");
        let blobs = BlobCache::new(dir.path());
        blobs.put("https://a", b"a").await.expect("put");
        blobs.put("https://b", b"b").await.expect("put");

        assert_eq!(blobs.clear().await.expect("clear"), 2);
        assert!(blobs.get("https://a").await.expect("get").is_none());
        assert_eq!(blobs.clear().await.expect("clear"), 0);
    }

    #[tokio::test]
    async fn clear_on_missing_directory_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let blobs = BlobCache::new(dir.path().join("never-created"));
        assert_eq!(blobs.clear().await.expect("clear"), 0);
    }

    #[tokio::test]
    async fn zero_max_age_treats_every_entry_as_expired() {
        let dir = tempdir().expect("tempdir");
        let blobs = BlobCache::new(dir.path()).with_max_age(Some(Duration::ZERO));
        blobs.put("https://a", b"a").await.expect("put");
        assert!(blobs.get("https://a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn caching_fetcher_serves_hits_without_network() {
        let dir = tempdir().expect("tempdir");
        let fetcher = CachingFetcher::new(CountingFetcher::new(false), BlobCache::new(dir.path()));

        let first = fetcher.fetch(&source()).await.expect("first fetch");
        let second = fetcher.fetch(&source()).await.expect("second fetch");

        assert_eq!(first, b"payload-0");
        assert_eq!(second, b"payload-0");
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_the_next_fetch_to_the_network() {
        let dir = tempdir().expect("tempdir");
        let fetcher = CachingFetcher::new(CountingFetcher::new(false), BlobCache::new(dir.path()));

        fetcher.fetch(&source()).await.expect("fetch");
        assert_eq!(fetcher.invalidate().await.expect("invalidate"), 1);
        let refetched = fetcher.fetch(&source()).await.expect("refetch");

        assert_eq!(refetched, b"payload-1");
        assert_eq!(fetcher.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unusable_blob_directory_does_not_fail_the_fetch() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("write blocker");
        let fetcher = CachingFetcher::new(CountingFetcher::new(false), BlobCache::new(blocker.join("blobs")));

        let bytes = fetcher.fetch(&source()).await.expect("fetch despite broken cache");
        assert_eq!(bytes, b"payload-0");
    }

    #[tokio::test]
    async fn network_failure_fails_the_fetch_and_stores_nothing() {
        let dir = tempdir().expect("tempdir");
        let fetcher = CachingFetcher::new(CountingFetcher::new(true), BlobCache::new(dir.path()));

        let err = fetcher.fetch(&source()).await.expect_err("network failure");
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert!(fetcher.blobs().get(&source().url).await.expect("get").is_none());
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }
}
