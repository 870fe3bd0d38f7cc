//! Named request/response stores.
//!
//! ```text
//! CacheStorage
//!     └── Cache ("flashcard-shell-v5", "flashcard-dynamic-v5", ...)
//!             └── CacheKey (method + URL) → CacheEntry
//! ```
//!
//! Every `put`/`match` takes the store's lock once, so each call is atomic;
//! two concurrent writers to the same key resolve as last-writer-wins.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use flashcache_common::{OfflineError, Result};
use flashcache_net::{Fetcher, Request, Response, ResponseSource};
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::{Method, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

/// Identity of a stored request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    /// URL with the fragment removed; the query string is significant.
    pub url: String,
}

impl CacheKey {
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            url: key_url(&request.url),
        }
    }

    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET,
            url: key_url(url),
        }
    }
}

fn key_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: Response,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    fn new(key: CacheKey, response: Response) -> Self {
        let cached_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            key,
            response,
            cached_at,
        }
    }

    /// The stored response, marked as served from cache.
    pub fn to_response(&self) -> Response {
        self.response.clone().with_source(ResponseSource::Cache)
    }
}

/// A single named store.
#[derive(Debug)]
pub struct Cache {
    name: String,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl Cache {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        self.match_key(&CacheKey::for_request(request)).await
    }

    pub async fn match_key(&self, key: &CacheKey) -> Option<Response> {
        self.entries.read().await.get(key).map(CacheEntry::to_response)
    }

    /// Store `response` under `request`, replacing any earlier entry.
    pub async fn put(&self, request: &Request, response: Response) -> Result<()> {
        let key = CacheKey::for_request(request);
        check_storable(&key, &response)?;
        trace!(cache = %self.name, url = %key.url, status = %response.status, "Cache put");
        self.entries
            .write()
            .await
            .insert(key.clone(), CacheEntry::new(key, response));
        Ok(())
    }

    /// Fetch every URL and store the results, all or nothing.
    ///
    /// Nothing is written unless every fetch succeeds with a 2xx status.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<()> {
        if urls.is_empty() {
            return Ok(());
        }

        let fetched = try_join_all(urls.iter().map(|url| async move {
            let request = Request::get(url.clone());
            let response = fetcher.fetch(&request).await.map_err(|e| {
                OfflineError::network_with_source(format!("precache fetch of {url} failed"), e)
            })?;
            if !response.ok() {
                return Err(OfflineError::network(format!(
                    "precache fetch of {url} returned {}",
                    response.status
                )));
            }
            Ok::<_, OfflineError>((CacheKey::get(url), response))
        }))
        .await?;

        let mut entries = self.entries.write().await;
        for (key, response) in fetched {
            entries.insert(key.clone(), CacheEntry::new(key, response));
        }
        debug!(cache = %self.name, count = urls.len(), "Precached assets");
        Ok(())
    }

    /// Delete an entry.
    pub async fn delete(&self, request: &Request) -> bool {
        self.entries
            .write()
            .await
            .remove(&CacheKey::for_request(request))
            .is_some()
    }

    /// All stored keys.
    pub async fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn check_storable(key: &CacheKey, response: &Response) -> Result<()> {
    if key.method != Method::GET {
        return Err(OfflineError::store(format!(
            "cannot store {} request for {}",
            key.method, key.url
        )));
    }
    if response.status == StatusCode::PARTIAL_CONTENT {
        return Err(OfflineError::store(format!(
            "cannot store partial response for {}",
            key.url
        )));
    }
    Ok(())
}

/// All stores of one origin. Cloning shares the same stores.
#[derive(Debug, Clone, Default)]
pub struct CacheStorage {
    /// Stores in creation order; lookups across stores follow it.
    caches: Arc<RwLock<Vec<Arc<Cache>>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store, creating it if it doesn't exist.
    pub async fn open(&self, name: &str) -> Arc<Cache> {
        let mut caches = self.caches.write().await;
        if let Some(cache) = caches.iter().find(|c| c.name == name) {
            return Arc::clone(cache);
        }
        debug!(cache = %name, "Creating cache");
        let cache = Arc::new(Cache::new(name));
        caches.push(Arc::clone(&cache));
        cache
    }

    /// Check if a store exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.iter().any(|c| c.name == name)
    }

    /// Delete a store. Deleting a missing store is a no-op returning false.
    pub async fn delete(&self, name: &str) -> bool {
        let mut caches = self.caches.write().await;
        let before = caches.len();
        caches.retain(|c| c.name != name);
        caches.len() != before
    }

    /// All store names, in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    /// Match across all stores, first hit in creation order.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        self.match_key(&CacheKey::for_request(request)).await
    }

    pub async fn match_key(&self, key: &CacheKey) -> Option<Response> {
        let caches: Vec<Arc<Cache>> = self.caches.read().await.clone();
        for cache in caches {
            if let Some(response) = cache.match_key(key).await {
                return Some(response);
            }
        }
        None
    }
}
