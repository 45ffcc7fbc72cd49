//! Local mirror store + HTTP transport utilities for the explorer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bpx_core::Collection;
use chrono::{DateTime, Utc};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

#[cfg(feature = "test-support")]
pub mod fake;

pub const CRATE_NAME: &str = "bpx-storage";

/// v2 added the `fundraising_events` collection.
pub const SCHEMA_VERSION: u32 = 2;
pub const CACHE_KEY: &str = "all_data";
const META_FILE: &str = "meta.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mirror store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mirror store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("mirror store json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Full snapshot of one collection as persisted in the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCollection<T> {
    pub timestamp: DateTime<Utc>,
    pub etag: Option<String>,
    pub data: Vec<T>,
}

impl<T> CachedCollection<T> {
    pub fn is_stale(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        is_stale(self.timestamp, now, window)
    }
}

/// Strictly older than the window counts as stale.
pub fn is_stale(timestamp: DateTime<Utc>, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    now.signed_duration_since(timestamp) > window
}

#[derive(Serialize)]
struct RecordRef<'a, T> {
    timestamp: DateTime<Utc>,
    etag: Option<&'a str>,
    data: &'a [T],
}

/// Record with `data` kept as undecoded JSON.
#[derive(Serialize, Deserialize)]
struct RawRecord {
    timestamp: DateTime<Utc>,
    etag: Option<String>,
    data: Box<RawValue>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    schema_version: u32,
}

/// Versioned on-disk mirror with one record per collection.
///
/// ```text
/// {root}/
/// ├── meta.json
/// ├── organisations/all_data.json
/// ├── projects/all_data.json
/// └── fundraising_events/all_data.json
/// ```
#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    /// Open (or create) the store and bring its schema to [`SCHEMA_VERSION`].
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::Unavailable {
                path: root.clone(),
                source,
            })?;
        let store = Self { root };
        store.migrate().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, collection: Collection) -> PathBuf {
        self.root
            .join(collection.as_str())
            .join(format!("{CACHE_KEY}.json"))
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        let meta_path = self.root.join(META_FILE);
        let found = match read_optional(&meta_path).await? {
            Some(bytes) => match serde_json::from_slice::<StoreMeta>(&bytes) {
                Ok(meta) => Some(meta.schema_version),
                Err(err) => {
                    warn!(error = %err, "ignoring unreadable mirror store meta");
                    None
                }
            },
            None => None,
        };

        match found {
            Some(version) if version == SCHEMA_VERSION => {}
            Some(version) if version > SCHEMA_VERSION => {
                warn!(
                    found = version,
                    supported = SCHEMA_VERSION,
                    "mirror store written by a newer schema; reinitializing"
                );
                for collection in Collection::ALL {
                    let dir = self.root.join(collection.as_str());
                    match fs::remove_dir_all(&dir).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Some(version) => {
                info!(from = version, to = SCHEMA_VERSION, "upgrading mirror store schema");
            }
            None => debug!(root = %self.root.display(), "initializing mirror store"),
        }

        for collection in Collection::ALL {
            fs::create_dir_all(self.root.join(collection.as_str())).await?;
        }
        if found != Some(SCHEMA_VERSION) {
            let bytes = serde_json::to_vec_pretty(&StoreMeta {
                schema_version: SCHEMA_VERSION,
            })?;
            write_atomic(&meta_path, &bytes).await?;
        }
        Ok(())
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<Option<CachedCollection<T>>, StoreError> {
        let path = self.record_path(collection);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                self.discard(collection, &path, &err).await?;
                Ok(None)
            }
        }
    }

    /// Replace the collection record wholesale, stamped with the current time.
    pub async fn save<T: Serialize>(
        &self,
        collection: Collection,
        data: &[T],
        etag: Option<&str>,
    ) -> Result<(), StoreError> {
        self.save_with_timestamp(collection, data, etag, Utc::now())
            .await
    }

    pub async fn save_with_timestamp<T: Serialize>(
        &self,
        collection: Collection,
        data: &[T],
        etag: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&RecordRef {
            timestamp,
            etag,
            data,
        })?;
        write_atomic(&self.record_path(collection), &bytes).await?;
        debug!(%collection, items = data.len(), "saved mirror record");
        Ok(())
    }

    /// Rewrite only the timestamp of an existing record. Returns `false` when
    /// there is nothing to touch.
    pub async fn touch_timestamp(&self, collection: Collection) -> Result<bool, StoreError> {
        let path = self.record_path(collection);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(false);
        };
        let mut record: RawRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                self.discard(collection, &path, &err).await?;
                return Ok(false);
            }
        };
        record.timestamp = Utc::now();
        let bytes = serde_json::to_vec(&record)?;
        write_atomic(&path, &bytes).await?;
        Ok(true)
    }

    async fn discard(
        &self,
        collection: Collection,
        path: &Path,
        err: &serde_json::Error,
    ) -> Result<(), StoreError> {
        warn!(%collection, error = %err, "discarding undecodable mirror record");
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Write via a uniquely named temp file in the same directory, then rename.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed attempt with the given zero-based index:
    /// `base_delay` doubled per attempt, capped at `max_delay`. With the
    /// defaults that is 2, 4, 8, 16 s, then 32 s thereafter.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: Some(format!("bpx/{}", env!("CARGO_PKG_VERSION"))),
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub etag: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Connection(String),
}

/// A single GET, no retries. Non-2xx statuses are returned, not raised.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &Url,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, FetchError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn get(
        &self,
        url: &Url,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        (**self).get(url, if_none_match).await
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
        })
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn get(
        &self,
        url: &Url,
        if_none_match: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Connection("request limiter closed".into()))?;

        let span = info_span!("http_fetch", url = %url);
        async move {
            let mut request = self.client.get(url.clone());
            if let Some(etag) = if_none_match {
                request = request.header(IF_NONE_MATCH, etag);
            }

            let resp = request.send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = resp
                .bytes()
                .await
                .map_err(|err| classify(err, url))?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "http response");

            Ok(FetchedResponse {
                status,
                final_url,
                etag,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &Url) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn open_writes_meta_and_collection_dirs() {
        let dir = tempdir().expect("tempdir");
        let store = MirrorStore::open(dir.path()).await.expect("open");

        let meta: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(meta["schema_version"], SCHEMA_VERSION);
        for collection in Collection::ALL {
            assert!(store.root().join(collection.as_str()).is_dir());
        }
    }

    #[tokio::test]
    async fn saved_record_loads_back_with_etag() {
        let dir = tempdir().expect("tempdir");
        let store = MirrorStore::open(dir.path()).await.expect("open");
        let data = vec![json!({"id": 1, "name": "CARE"}), json!({"id": 2, "name": "WWF"})];

        store
            .save_with_timestamp(Collection::Organisations, &data, Some("\"v1\""), ts(1))
            .await
            .expect("save");

        let loaded: CachedCollection<Value> = store
            .load(Collection::Organisations)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.timestamp, ts(1));
        assert_eq!(loaded.etag.as_deref(), Some("\"v1\""));
        assert_eq!(loaded.data, data);

        let other: Option<CachedCollection<Value>> =
            store.load(Collection::Projects).await.expect("load");
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn touch_rewrites_timestamp_only() {
        let dir = tempdir().expect("tempdir");
        let store = MirrorStore::open(dir.path()).await.expect("open");
        let data = vec![json!({"id": 7, "title": "Brunnen", "nested": {"b": 1, "a": 2}})];
        store
            .save_with_timestamp(Collection::Projects, &data, Some("W/\"abc\""), ts(1))
            .await
            .expect("save");

        assert!(store.touch_timestamp(Collection::Projects).await.expect("touch"));
        assert!(store.touch_timestamp(Collection::Projects).await.expect("touch again"));

        let loaded: CachedCollection<Value> =
            store.load(Collection::Projects).await.unwrap().unwrap();
        assert!(loaded.timestamp > ts(1));
        assert_eq!(loaded.etag.as_deref(), Some("W/\"abc\""));
        assert_eq!(loaded.data, data);
    }

    #[tokio::test]
    async fn touch_without_record_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let store = MirrorStore::open(dir.path()).await.expect("open");
        assert!(!store
            .touch_timestamp(Collection::FundraisingEvents)
            .await
            .expect("touch"));
        assert!(!store.record_path(Collection::FundraisingEvents).exists());
    }

    #[tokio::test]
    async fn undecodable_record_is_discarded() {
        let dir = tempdir().expect("tempdir");
        let store = MirrorStore::open(dir.path()).await.expect("open");
        let path = store.record_path(Collection::Projects);
        std::fs::write(&path, b"{not json").unwrap();

        let loaded: Option<CachedCollection<Value>> =
            store.load(Collection::Projects).await.expect("load");
        assert!(loaded.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn older_schema_keeps_existing_records() {
        let dir = tempdir().expect("tempdir");
        let orgs = dir.path().join("organisations");
        std::fs::create_dir_all(&orgs).unwrap();
        std::fs::write(dir.path().join(META_FILE), br#"{"schema_version":1}"#).unwrap();
        std::fs::write(
            orgs.join("all_data.json"),
            br#"{"timestamp":"2026-02-01T12:00:00Z","etag":null,"data":[{"id":1}]}"#,
        )
        .unwrap();

        let store = MirrorStore::open(dir.path()).await.expect("open");
        let loaded: CachedCollection<Value> =
            store.load(Collection::Organisations).await.unwrap().unwrap();
        assert_eq!(loaded.data, vec![json!({"id": 1})]);
        assert!(store.root().join("fundraising_events").is_dir());

        let meta: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(META_FILE)).unwrap()).unwrap();
        assert_eq!(meta["schema_version"], SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_reinitializes_records() {
        let dir = tempdir().expect("tempdir");
        {
            let store = MirrorStore::open(dir.path()).await.expect("open");
            store
                .save(Collection::Projects, &[json!({"id": 1})], None)
                .await
                .expect("save");
        }
        std::fs::write(dir.path().join(META_FILE), br#"{"schema_version":99}"#).unwrap();

        let store = MirrorStore::open(dir.path()).await.expect("reopen");
        let loaded: Option<CachedCollection<Value>> =
            store.load(Collection::Projects).await.expect("load");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn open_on_a_file_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let err = MirrorStore::open(blocker.join("mirror"))
            .await
            .expect_err("open should fail");
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[test]
    fn staleness_is_strictly_beyond_window() {
        let window = chrono::Duration::hours(24);
        let now = ts(10);
        assert!(is_stale(now - window - chrono::Duration::seconds(1), now, window));
        assert!(!is_stale(now - window + chrono::Duration::seconds(1), now, window));
        assert!(!is_stale(now - window, now, window));
    }

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_secs(32));
    }
}
