//! Caching strategies.
//!
//! A network failure never escapes a strategy: it becomes a fallback
//! response, a pass-through, or a logged warning. Only store write
//! failures are returned as errors.

use std::sync::Arc;

use flashcache_common::{OfflineError, Result};
use flashcache_net::{Fetcher, Request, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

use crate::store::{Cache, CacheKey, CacheStorage};
use crate::WorkerEvent;

/// How an intercepted request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    /// Serve from cache; on a miss go to the network, storing the result
    /// only when `write_back` is set.
    CacheFirst {
        #[serde(default)]
        write_back: bool,
    },
    /// Serve from cache; on a miss fetch and store. When the network is
    /// down, navigations get the offline page and everything else a 503.
    NetworkFallback,
    /// Serve from cache immediately and refresh the entry in the background.
    StaleWhileRevalidate,
}

/// Result of handling an intercepted request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The worker declined; the host performs its default network fetch.
    Passthrough,
    /// Respond with `response`. `refresh` is set when a background cache
    /// refresh was started for this request.
    Respond {
        response: Response,
        refresh: Option<RefreshTask>,
    },
}

impl FetchOutcome {
    fn respond(response: Response) -> Self {
        Self::Respond {
            response,
            refresh: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, Self::Passthrough)
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Respond { response, .. } => Some(response),
            Self::Passthrough => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Respond { response, .. } => Some(response),
            Self::Passthrough => None,
        }
    }

    /// Detach the background refresh, if any.
    pub fn take_refresh(&mut self) -> Option<RefreshTask> {
        match self {
            Self::Respond { refresh, .. } => refresh.take(),
            Self::Passthrough => None,
        }
    }
}

/// Handle to a stale-while-revalidate background refresh.
///
/// Dropping it does not cancel the refresh. Failures are also reported as
/// [`WorkerEvent::RefreshFailed`].
#[derive(Debug)]
pub struct RefreshTask {
    url: String,
    handle: JoinHandle<Result<()>>,
}

impl RefreshTask {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the refresh to settle.
    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| OfflineError::internal(format!("refresh task for {} failed: {e}", self.url)))?
    }
}

/// Runs strategies against the shared storage and network.
#[derive(Clone)]
pub(crate) struct Executor {
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    offline_page: CacheKey,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Executor {
    pub(crate) fn new(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
        offline_page: CacheKey,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            offline_page,
            events,
        }
    }

    pub(crate) async fn execute(
        &self,
        strategy: Strategy,
        store: Arc<Cache>,
        request: Request,
    ) -> Result<FetchOutcome> {
        match strategy {
            Strategy::CacheFirst { write_back } => {
                self.cache_first(store, request, write_back).await
            }
            Strategy::NetworkFallback => self.network_fallback(store, request).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(store, request).await,
        }
    }

    async fn cache_first(
        &self,
        store: Arc<Cache>,
        request: Request,
        write_back: bool,
    ) -> Result<FetchOutcome> {
        if let Some(cached) = self.lookup(&store, &request).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(FetchOutcome::respond(cached));
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if write_back && response.status == StatusCode::OK {
                    store.put(&request, response.clone()).await?;
                }
                Ok(FetchOutcome::respond(response))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache miss and network failed, passing through");
                Ok(FetchOutcome::Passthrough)
            }
        }
    }

    async fn network_fallback(&self, store: Arc<Cache>, request: Request) -> Result<FetchOutcome> {
        if let Some(cached) = self.lookup(&store, &request).await {
            debug!(url = %request.url, "Cache hit");
            return Ok(FetchOutcome::respond(cached));
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    store.put(&request, response.clone()).await?;
                }
                Ok(FetchOutcome::respond(response))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failed, serving fallback");
                Ok(FetchOutcome::respond(self.offline_fallback(&request).await))
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        store: Arc<Cache>,
        request: Request,
    ) -> Result<FetchOutcome> {
        let cached = self.lookup(&store, &request).await;
        let (network_tx, network_rx) = oneshot::channel();
        let refresh = self.spawn_refresh(store, request.clone(), network_tx);

        if let Some(cached) = cached {
            debug!(url = %request.url, "Serving stale copy, refreshing in background");
            return Ok(FetchOutcome::Respond {
                response: cached,
                refresh: Some(refresh),
            });
        }

        let response = match network_rx.await {
            Ok(Some(response)) => response,
            _ => {
                warn!(url = %request.url, "No cached copy and network failed, serving fallback");
                self.offline_fallback(&request).await
            }
        };
        Ok(FetchOutcome::Respond {
            response,
            refresh: Some(refresh),
        })
    }

    /// Fetch `request` on a separate task, hand the response to `network_tx`
    /// as soon as it arrives, then store it.
    fn spawn_refresh(
        &self,
        store: Arc<Cache>,
        request: Request,
        network_tx: oneshot::Sender<Option<Response>>,
    ) -> RefreshTask {
        let url = request.url.to_string();
        let fetcher = Arc::clone(&self.fetcher);
        let events = self.events.clone();
        let span = tracing::debug_span!("refresh", url = %url);

        let task_url = url.clone();
        let handle = tokio::spawn(
            async move {
                let result = refresh(fetcher.as_ref(), &store, &request, network_tx).await;
                match &result {
                    Ok(stored) => {
                        debug!(stored, "Background refresh settled");
                        let _ = events.send(WorkerEvent::RefreshCompleted {
                            url: task_url,
                            stored: *stored,
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, category = e.category(), "Background refresh failed");
                        let _ = events.send(WorkerEvent::RefreshFailed {
                            url: task_url,
                            error: e.to_string(),
                        });
                    }
                }
                result.map(|_| ())
            }
            .instrument(span),
        );

        RefreshTask { url, handle }
    }

    /// The rule's own store first, then every other store.
    async fn lookup(&self, store: &Cache, request: &Request) -> Option<Response> {
        match store.match_request(request).await {
            Some(response) => Some(response),
            None => self.storage.match_request(request).await,
        }
    }

    /// The offline page for navigations, otherwise an empty 503.
    async fn offline_fallback(&self, request: &Request) -> Response {
        if request.is_navigation() {
            if let Some(page) = self.storage.match_key(&self.offline_page).await {
                return page;
            }
            warn!(url = %request.url, offline_page = %self.offline_page.url, "Offline page not cached");
        }
        Response::service_unavailable()
    }
}

/// Returns whether the fresh response was stored.
async fn refresh(
    fetcher: &dyn Fetcher,
    store: &Cache,
    request: &Request,
    network_tx: oneshot::Sender<Option<Response>>,
) -> Result<bool> {
    let response = match fetcher.fetch(request).await {
        Ok(response) => response,
        Err(e) => {
            let _ = network_tx.send(None);
            return Err(e.into());
        }
    };

    let _ = network_tx.send(Some(response.clone()));

    if response.status != StatusCode::OK {
        debug!(status = %response.status, "Not storing non-200 refresh");
        return Ok(false);
    }
    store.put(request, response).await?;
    Ok(true)
}
