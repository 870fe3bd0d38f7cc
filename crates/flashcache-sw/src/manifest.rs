//! Precache asset manifest.
//!
//! The static part comes straight from configuration. The dynamic part is a
//! JSON array of file names fetched at install time; each name is appended
//! to the index prefix and resolved against the scope. A dynamic part that
//! cannot be fetched or parsed is logged and dropped.

use flashcache_common::{retry_if, OfflineError, Result};
use hashbrown::HashSet;
use flashcache_net::{Fetcher, NetError, Request};
use tracing::{debug, warn};
use url::Url;

use crate::config::{IndexSource, WorkerConfig};

/// Ordered URLs to precache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    static_assets: Vec<Url>,
    dynamic_assets: Vec<Url>,
    index_error: Option<String>,
}

impl AssetManifest {
    /// The static part only.
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let static_assets = config
            .static_assets
            .iter()
            .map(|asset| config.resolve(asset))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            static_assets: dedup(static_assets),
            ..Self::default()
        })
    }

    /// Static part plus the dynamic index, if one is configured.
    ///
    /// Fails only if the static list is invalid.
    pub async fn resolve(config: &WorkerConfig, fetcher: &dyn Fetcher) -> Result<Self> {
        let mut manifest = Self::from_config(config)?;

        if let Some(index) = &config.index {
            let fetched = retry_if(
                &config.index_retry,
                || fetch_index(config, index, fetcher),
                OfflineError::is_retryable,
            )
            .await;

            match fetched {
                Ok(assets) => {
                    debug!(count = assets.len(), index = %index.url, "Loaded dynamic manifest");
                    manifest.dynamic_assets = dedup(
                        assets
                            .into_iter()
                            .filter(|url| !manifest.static_assets.contains(url))
                            .collect(),
                    );
                }
                Err(e) => {
                    warn!(index = %index.url, error = %e, "Dynamic manifest unavailable, precaching static assets only");
                    manifest.index_error = Some(e.to_string());
                }
            }
        }

        Ok(manifest)
    }

    pub fn static_assets(&self) -> &[Url] {
        &self.static_assets
    }

    pub fn dynamic_assets(&self) -> &[Url] {
        &self.dynamic_assets
    }

    /// Why the dynamic part is missing, if it is.
    pub fn index_error(&self) -> Option<&str> {
        self.index_error.as_deref()
    }

    /// Static then dynamic entries.
    pub fn entries(&self) -> impl Iterator<Item = &Url> {
        self.static_assets.iter().chain(self.dynamic_assets.iter())
    }

    pub fn len(&self) -> usize {
        self.static_assets.len() + self.dynamic_assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetch the index and expand it. The index URL itself comes first so the
/// deck list is available offline too.
///
/// Network failures and 5xx statuses come back as network errors and are
/// retried; anything else is a manifest error and is final.
async fn fetch_index(
    config: &WorkerConfig,
    index: &IndexSource,
    fetcher: &dyn Fetcher,
) -> Result<Vec<Url>> {
    let index_url = config.resolve(&index.url)?;
    let response = fetcher
        .fetch(&Request::get(index_url.clone()))
        .await
        .map_err(OfflineError::from)?;

    if !response.ok() {
        let status = response.status;
        let error = NetError::Status {
            url: index_url,
            status,
        };
        return Err(if status.is_server_error() {
            OfflineError::network_with_source("index not available", error)
        } else {
            OfflineError::manifest_with_source("index not available", error)
        });
    }

    let names: Vec<String> = response
        .json()
        .map_err(|e| OfflineError::manifest_with_source(format!("parsing {index_url}"), e))?;

    let mut assets = Vec::with_capacity(names.len() + 1);
    assets.push(index_url);
    for name in names {
        let expanded = format!("{}{}", index.prefix, name);
        assets.push(config.resolve(&expanded)?);
    }
    Ok(assets)
}

/// Drop repeated URLs, keeping the first occurrence.
fn dedup(mut urls: Vec<Url>) -> Vec<Url> {
    let mut seen = HashSet::with_capacity(urls.len());
    urls.retain(|url| seen.insert(url.clone()));
    urls
}
