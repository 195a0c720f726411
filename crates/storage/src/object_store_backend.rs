use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{parse_url_opts, ObjectStore, PutPayload};
use riq_common::{Result, RiqError};
use tracing::warn;
use url::Url;

use crate::backend::{not_found, StorageBackend};
use crate::layout::unescape_segment;

/// Returns true if `path` looks like an object-store style URI.
#[must_use]
pub fn is_object_store_uri(path: &str) -> bool {
    path.contains("://")
}

#[derive(Debug, Clone)]
struct ObjectStoreSettings {
    retry_attempts: usize,
    retry_backoff_ms: u64,
    timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_backoff_ms: 250,
            timeout_secs: Some(30),
            connect_timeout_secs: Some(5),
        }
    }
}

impl ObjectStoreSettings {
    /// Defaults, then `RIQ_OBJECT_STORE_*` env vars, then `object_store.*` options.
    fn resolve(options: &HashMap<String, String>) -> Self {
        let mut s = Self::default();
        let pick = |env: &str, opt: &str| {
            options
                .get(opt)
                .cloned()
                .or_else(|| std::env::var(env).ok())
        };
        if let Some(v) =
            pick("RIQ_OBJECT_STORE_RETRY_ATTEMPTS", "object_store.retry_attempts")
                .and_then(|x| x.parse::<usize>().ok())
        {
            s.retry_attempts = v.max(1);
        }
        if let Some(v) = pick(
            "RIQ_OBJECT_STORE_RETRY_BACKOFF_MS",
            "object_store.retry_backoff_ms",
        )
        .and_then(|x| x.parse::<u64>().ok())
        {
            s.retry_backoff_ms = v;
        }
        if let Some(v) = pick("RIQ_OBJECT_STORE_TIMEOUT_SECS", "object_store.timeout_secs")
            .and_then(|x| x.parse::<u64>().ok())
        {
            s.timeout_secs = Some(v.max(1));
        }
        if let Some(v) = pick(
            "RIQ_OBJECT_STORE_CONNECT_TIMEOUT_SECS",
            "object_store.connect_timeout_secs",
        )
        .and_then(|x| x.parse::<u64>().ok())
        {
            s.connect_timeout_secs = Some(v.max(1));
        }
        s
    }
}

fn build_object_store_options(
    options: &HashMap<String, String>,
    settings: &ObjectStoreSettings,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (k, v) in options {
        if k.starts_with("object_store.") {
            continue;
        }
        out.insert(k.clone(), v.clone());
    }
    if let Some(v) = settings.timeout_secs {
        out.insert("timeout".to_string(), format!("{v} seconds"));
    }
    if let Some(v) = settings.connect_timeout_secs {
        out.insert("connect_timeout".to_string(), format!("{v} seconds"));
    }
    out
}

/// [`StorageBackend`] over any `object_store` implementation (S3/GCS/Azure/in-memory).
///
/// Async calls are bridged with `futures::executor::block_on`; callers run
/// on blocking threads.
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    root: String,
    settings: ObjectStoreSettings,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("store", &self.store.to_string())
            .field("root", &self.root)
            .finish()
    }
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, root: &str) -> Self {
        Self {
            store,
            root: root.trim_matches('/').to_string(),
            settings: ObjectStoreSettings::default(),
        }
    }

    /// Warehouse root at `uri`, e.g. `s3://bucket/warehouse`.
    ///
    /// `object_store.retry_attempts` style keys tune retries; every other key
    /// is passed to the store builder.
    pub fn from_uri(uri: &str, options: &HashMap<String, String>) -> Result<Self> {
        if !is_object_store_uri(uri) {
            return Err(RiqError::InvalidConfig(format!(
                "path '{uri}' is not an object-store uri; expected scheme://..."
            )));
        }
        let url = Url::parse(uri).map_err(|e| {
            RiqError::InvalidConfig(format!("invalid object-store uri '{uri}': {e}"))
        })?;
        let settings = ObjectStoreSettings::resolve(options);
        let (store, root) = parse_url_opts(&url, build_object_store_options(options, &settings))
            .map_err(|e| {
                RiqError::InvalidConfig(format!("failed to build object store for '{uri}': {e}"))
            })?;
        Ok(Self {
            store: Arc::from(store),
            root: root.as_ref().to_string(),
            settings,
        })
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "")
    }

    fn object_path(&self, path: &str) -> ObjectPath {
        if self.root.is_empty() {
            ObjectPath::from(path)
        } else {
            ObjectPath::from(format!("{}/{path}", self.root))
        }
    }

    // Undo the store's own part encoding so listed paths match what was put.
    fn relative_path(&self, location: &ObjectPath) -> String {
        let root_parts = self.root.split('/').filter(|p| !p.is_empty()).count();
        location
            .parts()
            .skip(root_parts)
            .map(|p| unescape_segment(p.as_ref()))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn with_retry<T>(
        &self,
        op: &str,
        path: &str,
        f: impl Fn() -> std::result::Result<T, object_store::Error>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(object_store::Error::NotFound { .. }) => return Err(not_found(path)),
                Err(e) if attempt >= self.settings.retry_attempts => {
                    return Err(RiqError::Execution(format!(
                        "object-store {op} failed after {attempt} attempts for '{path}': {e}"
                    )))
                }
                Err(e) => {
                    warn!(
                        operator = "ObjectStoreBackend",
                        op,
                        path,
                        attempt,
                        error = %e,
                        "retrying"
                    );
                    thread::sleep(Duration::from_millis(self.settings.retry_backoff_ms));
                    attempt += 1;
                }
            }
        }
    }
}

impl StorageBackend for ObjectStoreBackend {
    fn put(&self, path: &str, data: Bytes) -> Result<()> {
        let location = self.object_path(path);
        self.with_retry("put", path, || {
            futures::executor::block_on(
                self.store
                    .put(&location, PutPayload::from(data.clone())),
            )
            .map(|_| ())
        })
    }

    fn get(&self, path: &str) -> Result<Bytes> {
        let location = self.object_path(path);
        self.with_retry("get", path, || {
            futures::executor::block_on(async {
                self.store.get(&location).await?.bytes().await
            })
        })
    }

    fn get_range(&self, path: &str, range: Range<u64>) -> Result<Bytes> {
        let location = self.object_path(path);
        let range = range.start as usize..range.end as usize;
        self.with_retry("ranged get", path, || {
            futures::executor::block_on(self.store.get_range(&location, range.clone()))
        })
    }

    fn size(&self, path: &str) -> Result<u64> {
        let location = self.object_path(path);
        self.with_retry("head", path, || {
            futures::executor::block_on(self.store.head(&location)).map(|m| m.size as u64)
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = (!self.root.is_empty()).then(|| ObjectPath::from(self.root.as_str()));
        let metas = self.with_retry("list", prefix, || {
            futures::executor::block_on(self.store.list(root.as_ref()).try_collect::<Vec<_>>())
        })?;
        let mut out = metas
            .iter()
            .map(|m| self.relative_path(&m.location))
            .filter(|p| p.starts_with(prefix))
            .collect::<Vec<_>>();
        out.sort();
        Ok(out)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let location = self.object_path(path);
        self.with_retry("delete", path, || {
            futures::executor::block_on(self.store.delete(&location))
        })
    }
}
