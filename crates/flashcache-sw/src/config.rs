//! Worker configuration.
//!
//! Store names are version-qualified; bumping them is the only way to
//! invalidate previously cached data.

use std::path::Path;
use std::time::Duration;

use flashcache_common::retry::duration_ms;
use flashcache_common::{OfflineError, Result, RetryConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::router::{RouteRule, StoreTarget, UrlPattern};
use crate::strategy::Strategy;

/// Where the list of dynamically precached resources comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSource {
    /// JSON array of file names, relative to the scope.
    pub url: String,
    /// Prepended to every file name before resolving against the scope.
    pub prefix: String,
}

/// Everything the worker needs, built once and passed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the app; relative paths resolve against it.
    pub scope: Url,
    /// App-shell store, populated at install.
    pub shell_cache: String,
    /// Store for lazily cached content.
    pub dynamic_cache: Option<String>,
    /// Precached at install; any failure fails the install.
    pub static_assets: Vec<String>,
    /// Precached at install on a best-effort basis.
    pub index: Option<IndexSource>,
    /// Served for navigations when the network is down.
    pub offline_page: String,
    pub routes: Vec<RouteRule>,
    /// Per-fetch limit in milliseconds; `null` disables it.
    #[serde(with = "duration_ms::option")]
    pub fetch_timeout: Option<Duration>,
    pub index_retry: RetryConfig,
    /// Activate right after a successful install.
    pub skip_waiting: bool,
}

const APP_SHELL: &[&str] = &[
    "./flashcard.html",
    "./",
    "manifest.json",
    "icon-192x192.png",
    "icon-512x512.png",
];

impl Default for WorkerConfig {
    /// Stale-while-revalidate for everything under the scope, with decks
    /// kept in a separate dynamic store.
    fn default() -> Self {
        Self {
            scope: default_scope(),
            shell_cache: "flashcard-shell-v5".to_string(),
            dynamic_cache: Some("flashcard-dynamic-v5".to_string()),
            static_assets: APP_SHELL.iter().map(|s| s.to_string()).collect(),
            index: Some(IndexSource {
                url: "./cardholder/index.json".to_string(),
                prefix: "./cardholder/".to_string(),
            }),
            offline_page: "./flashcard.html".to_string(),
            routes: vec![
                RouteRule::new(
                    UrlPattern::prefix("./cardholder/"),
                    Strategy::StaleWhileRevalidate,
                    StoreTarget::Dynamic,
                ),
                RouteRule::new(
                    UrlPattern::Scope,
                    Strategy::StaleWhileRevalidate,
                    StoreTarget::Shell,
                ),
            ],
            fetch_timeout: Some(Duration::from_secs(10)),
            index_retry: RetryConfig::default(),
            skip_waiting: true,
        }
    }
}

impl WorkerConfig {
    /// Single `flashcard-cache-v4` store, cache-first for every request and
    /// no write-back: the first published version of the worker.
    pub fn legacy_cache_first() -> Self {
        let mut static_assets: Vec<String> = APP_SHELL.iter().map(|s| s.to_string()).collect();
        static_assets.push("./cardholder/index.json".to_string());

        Self {
            shell_cache: "flashcard-cache-v4".to_string(),
            dynamic_cache: None,
            static_assets,
            index: None,
            routes: vec![RouteRule::new(
                UrlPattern::Any,
                Strategy::CacheFirst { write_back: false },
                StoreTarget::Shell,
            )],
            fetch_timeout: None,
            skip_waiting: false,
            ..Self::default()
        }
    }

    /// Same configuration rooted at `scope`.
    pub fn with_scope(mut self, scope: Url) -> Self {
        self.scope = scope;
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| OfflineError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scope.cannot_be_a_base() || !self.scope.path().ends_with('/') {
            return Err(OfflineError::config(format!(
                "scope {} must be a directory URL ending in '/'",
                self.scope
            )));
        }
        if self.shell_cache.trim().is_empty() {
            return Err(OfflineError::config("shell_cache must not be empty"));
        }
        if self.dynamic_cache.as_deref() == Some(self.shell_cache.as_str()) {
            return Err(OfflineError::config(
                "dynamic_cache must differ from shell_cache",
            ));
        }
        for asset in &self.static_assets {
            self.resolve(asset)?;
        }
        self.resolve(&self.offline_page)?;
        if let Some(index) = &self.index {
            self.resolve(&index.url)?;
        }
        self.index_retry.validate()?;
        if matches!(self.fetch_timeout, Some(limit) if limit.is_zero()) {
            return Err(OfflineError::config("fetch_timeout must be positive"));
        }
        Ok(())
    }

    /// Store names kept at activation.
    pub fn whitelist(&self) -> Vec<&str> {
        let mut names = vec![self.shell_cache.as_str()];
        names.extend(self.dynamic_cache.as_deref());
        names
    }

    pub fn store_name(&self, target: StoreTarget) -> &str {
        match target {
            StoreTarget::Shell => self.shell_cache.as_str(),
            StoreTarget::Dynamic => self.dynamic_cache.as_deref().unwrap_or(&self.shell_cache),
        }
    }

    /// Resolve a scope-relative or absolute URL.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.scope.join(path).map_err(|e| {
            OfflineError::config_with_source(format!("cannot resolve {path:?} against scope"), e)
        })
    }
}

fn default_scope() -> Url {
    Url::parse("http://localhost/").expect("static URL is valid")
}
