//! Process-wide cache of values extracted during a run.
//!
//! Keys are stored locally unless they carry the [`REMOTE_PREFIX`], in
//! which case they are written through to a [`RemoteBackend`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Keys with this prefix live in the remote tier.
pub const REMOTE_PREFIX: &str = "remote:";

const SUMMARY_LIMIT: usize = 200;

/// Storage location of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Local,
    Remote,
}

impl Tier {
    pub fn of(key: &str) -> Self {
        if key.starts_with(REMOTE_PREFIX) {
            Self::Remote
        } else {
            Self::Local
        }
    }
}

/// What a [`CacheStore::set`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// Local key already present; the first value was kept.
    Ignored,
}

/// External key-value service backing the remote tier.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    async fn set(&self, key: &str, value: &Value) -> anyhow::Result<()>;
}

/// Two-tier cache shared by the resolver and report builders.
pub struct CacheStore {
    local: RwLock<HashMap<String, Value>>,
    remote: Option<Arc<dyn RemoteBackend>>,
    namespace: String,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("local_keys", &self.keys())
            .field("remote", &self.remote.is_some())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Local-only store.
    pub fn new() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: None,
            namespace: String::new(),
        }
    }

    /// Store whose `remote:` keys go to `backend`, prefixed with
    /// `namespace`.
    pub fn with_remote(backend: Arc<dyn RemoteBackend>, namespace: impl Into<String>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: Some(backend),
            namespace: namespace.into(),
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn remote_key(&self, key: &str) -> Option<String> {
        key.strip_prefix(REMOTE_PREFIX)
            .map(|stripped| format!("{}{}", self.namespace, stripped))
    }

    fn backend(&self, key: &str) -> Result<&Arc<dyn RemoteBackend>> {
        self.remote.as_ref().ok_or_else(|| {
            Error::backend_unavailable(key, "no remote cache backend configured")
        })
    }

    /// Look up `key` in its tier.
    pub async fn get(&self, key: &str) -> Result<Value> {
        let Some(remote_key) = self.remote_key(key) else {
            return self
                .local
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
                .ok_or_else(|| Error::KeyNotFound {
                    key: key.to_string(),
                });
        };

        let backend = self.backend(key)?;
        match backend.get(&remote_key).await {
            Ok(Some(value)) => {
                debug!(key, "remote cache hit");
                Ok(value)
            }
            Ok(None) => Err(Error::KeyNotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(Error::backend_unavailable(key, format!("{e:#}"))),
        }
    }

    /// Store `value` under `key`.
    ///
    /// Local keys keep their first value; a second write is logged and
    /// ignored. Remote keys are overwritten.
    pub async fn set(&self, key: &str, value: Value) -> Result<SetOutcome> {
        let tier = Tier::of(key);
        let summary = summarize(&value);

        let Some(remote_key) = self.remote_key(key) else {
            let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = local.get(key) {
                warn!(
                    key,
                    existing = %summarize(existing),
                    ignored = %summary,
                    "cache key already set, keeping first value"
                );
                return Ok(SetOutcome::Ignored);
            }
            local.insert(key.to_string(), value);
            info!(key, tier = ?tier, value = %summary, "cache set");
            return Ok(SetOutcome::Stored);
        };

        let backend = self.backend(key)?;
        backend
            .set(&remote_key, &value)
            .await
            .map_err(|e| Error::backend_unavailable(key, format!("{e:#}")))?;
        info!(key, tier = ?tier, value = %summary, "cache set");
        Ok(SetOutcome::Stored)
    }

    /// Resolve several keys at once, failing on the first miss.
    pub async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let value = self.get(key).await?;
            found.insert(key.clone(), value);
        }
        Ok(found)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Sorted local keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop every local entry. The remote tier is untouched.
    pub fn reset(&self) {
        self.local
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!("local cache reset");
    }
}

fn summarize(value: &Value) -> String {
    let text = value.to_string();
    if text.len() > SUMMARY_LIMIT {
        let mut end = SUMMARY_LIMIT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...(truncated)", &text[..end])
    } else {
        text
    }
}

/// In-process stand-in for a remote key-value service.
#[derive(Debug, Default)]
pub struct MemoryRemoteBackend {
    entries: RwLock<HashMap<String, Value>>,
    unavailable: AtomicBool,
}

impl MemoryRemoteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the service went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<Value> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemoteBackend {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.check()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &Value) -> anyhow::Result<()> {
        self.check()?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}
