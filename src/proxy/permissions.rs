//! Fine-grained authorization for authenticated principals.
//!
//! Each principal may have a JSON permission document under its home
//! directory:
//!
//! ```json
//! {
//!   "direct-tcpip": { "allows": ["db.internal:5432"] },
//!   "tcpip-forward": { "default": true, "blocks": ["0.0.0.0:22"] },
//!   "exec": { "default": false }
//! }
//! ```
//!
//! Keys are request kinds; the argument checked against a rule depends on
//! the kind (a `host:port`, a unix socket path for `direct-streamlocal` and
//! `streamlocal-forward`, a command line, or empty for `session`).
//!
//! # Cache
//!
//! [`PermissionCache`] keeps the last document for one principal and
//! reloads it once it is older than the update period. The cache fails
//! closed:
//!
//! - a missing file denies and forgets the cached document, so a file
//!   removed after a good load stops granting access at the next reload;
//! - an unreadable or malformed file is cached as an empty document
//!   (deny-all) with a fresh timestamp, so retries are rate-limited by the
//!   update period.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::config::{HomeDirLayout, MIN_PERMISSIONS_UPDATE_PERIOD, PermissionsConfig};

/// Rule for one request kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allows: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Vec<String>>,
}

impl Permission {
    /// An allow-list, when present, is the only thing consulted. Otherwise a
    /// block-list denies its entries and allows the rest. Without either,
    /// `default` decides.
    pub fn allow(&self, _request: &str, argument: &str) -> bool {
        if let Some(allows) = &self.allows {
            return allows.iter().any(|item| item == argument);
        }
        if let Some(blocks) = &self.blocks {
            return !blocks.iter().any(|item| item == argument);
        }
        self.default
    }
}

/// Rules keyed by request kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionDocument(pub HashMap<String, Permission>);

impl PermissionDocument {
    /// Request kinds without a rule are denied.
    pub fn allow(&self, request: &str, argument: &str) -> bool {
        self.0
            .get(request)
            .is_some_and(|permission| permission.allow(request, argument))
    }
}

/// Authorization check for requests made during an authenticated session.
#[async_trait]
pub trait Permissions: Send + Sync {
    async fn allow(&self, request: &str, argument: &str) -> bool;
}

/// Grants everything; used when no permission files are configured.
pub struct AllowAll;

#[async_trait]
impl Permissions for AllowAll {
    async fn allow(&self, _request: &str, _argument: &str) -> bool {
        true
    }
}

/// Denies everything.
pub struct DenyAll;

#[async_trait]
impl Permissions for DenyAll {
    async fn allow(&self, _request: &str, _argument: &str) -> bool {
        false
    }
}

#[derive(Default)]
struct Snapshot {
    document: Option<Arc<PermissionDocument>>,
    loaded_at: Option<Instant>,
}

/// Time-windowed cache over one principal's permission file.
pub struct PermissionCache {
    path: PathBuf,
    period: Duration,
    snapshot: RwLock<Snapshot>,
    reload: tokio::sync::Mutex<()>,
}

impl PermissionCache {
    /// `period` is raised to at least one second.
    pub fn new(path: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            path: path.into(),
            period: period.max(MIN_PERMISSIONS_UPDATE_PERIOD),
            snapshot: RwLock::new(Snapshot::default()),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    fn fresh(&self) -> Option<Arc<PermissionDocument>> {
        let snapshot = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        match (&snapshot.document, snapshot.loaded_at) {
            (Some(document), Some(at)) if at.elapsed() <= self.period => Some(document.clone()),
            _ => None,
        }
    }

    fn store(&self, document: Option<PermissionDocument>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        snapshot.loaded_at = document.as_ref().map(|_| Instant::now());
        snapshot.document = document.map(Arc::new);
    }

    /// Current document, reloading it when missing or stale. `None` means
    /// the file does not exist.
    async fn current(&self) -> Option<Arc<PermissionDocument>> {
        if let Some(document) = self.fresh() {
            return Some(document);
        }

        // One reload at a time; readers keep using `fresh` meanwhile
        let _reload = self.reload.lock().await;
        if let Some(document) = self.fresh() {
            return Some(document);
        }
        self.store(self.load().await);
        self.fresh()
    }

    async fn load(&self) -> Option<PermissionDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(contents) => match serde_json::from_slice::<PermissionDocument>(&contents) {
                Ok(document) => {
                    debug!(
                        "Loaded {} permission rules from {}",
                        document.0.len(),
                        self.path.display()
                    );
                    Some(document)
                }
                Err(e) => {
                    warn!("Malformed permissions file {}: {}", self.path.display(), e);
                    Some(PermissionDocument::default())
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No permissions file at {}", self.path.display());
                None
            }
            Err(e) => {
                warn!("Cannot read permissions file {}: {}", self.path.display(), e);
                Some(PermissionDocument::default())
            }
        }
    }

    #[cfg(test)]
    fn expire(&self) {
        self.snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .loaded_at = None;
    }
}

#[async_trait]
impl Permissions for PermissionCache {
    async fn allow(&self, request: &str, argument: &str) -> bool {
        match self.current().await {
            Some(document) => document.allow(request, argument),
            None => false,
        }
    }
}

/// One [`PermissionCache`] per principal, created on first use.
pub struct PermissionRegistry {
    layout: HomeDirLayout,
    config: PermissionsConfig,
    caches: DashMap<String, Arc<PermissionCache>>,
}

impl PermissionRegistry {
    pub fn new(layout: HomeDirLayout, config: PermissionsConfig) -> Self {
        Self {
            layout,
            config,
            caches: DashMap::new(),
        }
    }

    /// Checker for `principal`. Principals that cannot name a file get
    /// [`DenyAll`].
    pub fn for_principal(&self, principal: &str) -> Arc<dyn Permissions> {
        if let Some(cache) = self.caches.get(principal) {
            return cache.clone();
        }
        let Some(path) = self.layout.principal_file(principal, &self.config.file_name) else {
            debug!("No permissions location for principal {:?}", principal);
            return Arc::new(DenyAll);
        };
        self.caches
            .entry(principal.to_string())
            .or_insert_with(|| Arc::new(PermissionCache::new(path, self.config.update_period)))
            .clone()
    }
}
