//! The offline worker: lifecycle plus request handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flashcache_common::Result;
use flashcache_net::{Fetcher, Request, TimeoutFetcher};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::WorkerConfig;
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::manifest::AssetManifest;
use crate::router::{Route, Router};
use crate::store::{CacheKey, CacheStorage};
use crate::strategy::{Executor, FetchOutcome};
use crate::WorkerEvent;

/// One version of the offline worker.
pub struct OfflineWorker {
    config: Arc<WorkerConfig>,
    router: Router,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    executor: Executor,
    lifecycle: RwLock<Lifecycle>,
    clients_claimed: AtomicBool,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineWorker {
    /// Build a worker over `storage`, which may still hold stores written by
    /// earlier versions.
    pub fn new(
        config: WorkerConfig,
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WorkerEvent>)> {
        config.validate()?;
        let router = Router::new(&config)?;
        let offline_page = CacheKey::get(&config.resolve(&config.offline_page)?);

        let fetcher: Arc<dyn Fetcher> = match config.fetch_timeout {
            Some(limit) => Arc::new(TimeoutFetcher::new(fetcher, limit)),
            None => fetcher,
        };

        let (events, event_rx) = mpsc::unbounded_channel();
        let executor = Executor::new(
            storage.clone(),
            Arc::clone(&fetcher),
            offline_page,
            events.clone(),
        );

        Ok((
            Self {
                config: Arc::new(config),
                router,
                storage,
                fetcher,
                executor,
                lifecycle: RwLock::new(Lifecycle::new()),
                clients_claimed: AtomicBool::new(false),
                events,
            },
            event_rx,
        ))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub async fn state(&self) -> WorkerState {
        self.lifecycle.read().await.state()
    }

    /// Whether open pages have been claimed by this worker.
    pub fn clients_claimed(&self) -> bool {
        self.clients_claimed.load(Ordering::Acquire)
    }

    /// Precache the app shell and, best effort, the dynamic index.
    ///
    /// On failure the worker becomes `Redundant` and the error is returned.
    /// With `skip_waiting` set, a successful install activates immediately.
    #[instrument(skip(self), fields(cache = %self.config.shell_cache))]
    pub async fn install(&self) -> Result<()> {
        self.set_state(WorkerState::Installing).await?;

        match self.precache().await {
            Ok(()) => {
                self.set_state(WorkerState::Installed).await?;
                info!("Install complete");
            }
            Err(e) => {
                warn!(error = %e, "Install failed");
                self.set_state(WorkerState::Redundant).await?;
                return Err(e);
            }
        }

        if self.config.skip_waiting {
            debug!("Skipping waiting phase");
            self.activate().await?;
        }
        Ok(())
    }

    async fn precache(&self) -> Result<()> {
        let shell = self.storage.open(&self.config.shell_cache).await;
        let manifest = AssetManifest::resolve(&self.config, self.fetcher.as_ref()).await?;

        shell
            .add_all(self.fetcher.as_ref(), manifest.static_assets())
            .await?;

        if let Some(reason) = manifest.index_error() {
            let _ = self.events.send(WorkerEvent::IndexUnavailable {
                error: reason.to_string(),
            });
        }

        if let Err(e) = shell
            .add_all(self.fetcher.as_ref(), manifest.dynamic_assets())
            .await
        {
            warn!(error = %e, count = manifest.dynamic_assets().len(), "Dynamic assets not precached");
            let _ = self.events.send(WorkerEvent::IndexUnavailable {
                error: e.to_string(),
            });
        }

        info!(
            static_assets = manifest.static_assets().len(),
            dynamic_assets = manifest.dynamic_assets().len(),
            "Precached app shell"
        );
        Ok(())
    }

    /// Delete every store not in the whitelist, then claim open pages.
    #[instrument(skip(self))]
    pub async fn activate(&self) -> Result<()> {
        self.set_state(WorkerState::Activating).await?;

        let whitelist = self.config.whitelist();
        for name in self.storage.keys().await {
            if !whitelist.contains(&name.as_str()) {
                self.storage.delete(&name).await;
                info!(cache = %name, "Deleted stale cache");
                let _ = self.events.send(WorkerEvent::CacheDeleted { name });
            }
        }

        self.set_state(WorkerState::Activated).await?;
        self.claim_clients();
        Ok(())
    }

    fn claim_clients(&self) {
        if !self.clients_claimed.swap(true, Ordering::AcqRel) {
            debug!("Claimed open clients");
            let _ = self.events.send(WorkerEvent::ControllerChange);
        }
    }

    /// Routing decision for `request` in the current state.
    pub async fn route(&self, request: &Request) -> Route {
        self.router.route(request, self.state().await)
    }

    /// Handle an intercepted request.
    ///
    /// Network failures are absorbed into the outcome; only store write
    /// failures are returned as errors.
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome> {
        match self.route(&request).await {
            Route::Passthrough => Ok(FetchOutcome::Passthrough),
            Route::Intercept { strategy, store } => {
                let store = self.storage.open(&store).await;
                self.executor.execute(strategy, store, request).await
            }
        }
    }

    async fn set_state(&self, next: WorkerState) -> Result<()> {
        let previous = self.lifecycle.write().await.transition(next)?;
        debug!(from = ?previous, to = ?next, "State change");
        let _ = self
            .events
            .send(WorkerEvent::StateChange { state: next });
        Ok(())
    }
}

impl std::fmt::Debug for OfflineWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("shell_cache", &self.config.shell_cache)
            .field("dynamic_cache", &self.config.dynamic_cache)
            .field("clients_claimed", &self.clients_claimed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RouteRule, StoreTarget, UrlPattern};
    use crate::strategy::Strategy;
    use bytes::Bytes;
    use flashcache_common::RetryConfig;
    use flashcache_net::mock::MockFetcher;
    use http::StatusCode;
    use std::time::Duration;
    use url::Url;

    const SCOPE: &str = "https://cards.example/";
    const INDEX: &str = "https://cards.example/cardholder/index.json";
    const DECK: &str = "https://cards.example/cardholder/french.json";

    fn config() -> WorkerConfig {
        WorkerConfig {
            skip_waiting: false,
            index_retry: RetryConfig::none(),
            ..WorkerConfig::default().with_scope(Url::parse(SCOPE).unwrap())
        }
    }

    fn shell_fetcher() -> Arc<MockFetcher> {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond("https://cards.example/flashcard.html", 200, "<html>cards</html>")
            .respond("https://cards.example/", 200, "<html>root</html>")
            .respond("https://cards.example/manifest.json", 200, "{}")
            .respond("https://cards.example/icon-192x192.png", 200, "png")
            .respond("https://cards.example/icon-512x512.png", 200, "png");
        fetcher
    }

    fn worker(
        config: WorkerConfig,
        storage: CacheStorage,
        fetcher: Arc<MockFetcher>,
    ) -> (OfflineWorker, mpsc::UnboundedReceiver<WorkerEvent>) {
        OfflineWorker::new(config, storage, fetcher).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    async fn running(fetcher: Arc<MockFetcher>) -> OfflineWorker {
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);
        worker.install().await.unwrap();
        worker.activate().await.unwrap();
        worker
    }

    #[tokio::test]
    async fn test_install_precaches_static_assets() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);

        worker.install().await.unwrap();
        assert_eq!(worker.state().await, WorkerState::Installed);

        let shell = worker.storage().open("flashcard-shell-v5").await;
        for asset in &worker.config().static_assets {
            let url = worker.config().resolve(asset).unwrap();
            assert!(
                shell.match_request(&Request::get(url.clone())).await.is_some(),
                "{url} not precached"
            );
        }
    }

    #[tokio::test]
    async fn test_install_precaches_dynamic_index() {
        let fetcher = shell_fetcher();
        fetcher
            .respond(INDEX, 200, r#"["french.json"]"#)
            .respond(DECK, 200, r#"{"cards": []}"#);
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);

        worker.install().await.unwrap();

        let shell = worker.storage().open("flashcard-shell-v5").await;
        assert!(shell.match_request(&get(DECK)).await.is_some());
        assert!(shell.match_request(&get(INDEX)).await.is_some());
    }

    #[tokio::test]
    async fn test_install_survives_index_failure() {
        let fetcher = shell_fetcher();
        fetcher.fail(INDEX, "offline");
        let (worker, mut rx) = worker(config(), CacheStorage::new(), fetcher);

        worker.install().await.unwrap();

        let hit = worker
            .storage()
            .match_request(&get("https://cards.example/flashcard.html"))
            .await;
        assert!(hit.is_some());
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, WorkerEvent::IndexUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_install_survives_missing_deck() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, r#"["french.json"]"#).respond(DECK, 404, "");
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);

        worker.install().await.unwrap();

        let shell = worker.storage().open("flashcard-shell-v5").await;
        assert!(shell.match_request(&get(DECK)).await.is_none());
        assert_eq!(shell.len().await, 5);
    }

    #[tokio::test]
    async fn test_static_failure_makes_worker_redundant() {
        let fetcher = shell_fetcher();
        fetcher.fail("https://cards.example/manifest.json", "offline");
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);

        assert!(worker.install().await.is_err());
        assert_eq!(worker.state().await, WorkerState::Redundant);
        assert!(worker.activate().await.is_err());
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (worker, _rx) = worker(config(), CacheStorage::new(), shell_fetcher());
        let err = worker.activate().await.unwrap_err();
        assert_eq!(err.category(), "state");
    }

    #[tokio::test]
    async fn test_activate_deletes_stale_stores() {
        let storage = CacheStorage::new();
        storage.open("flashcard-cache-v3").await;
        storage.open("flashcard-cache-v4").await;
        storage.open("flashcard-dynamic-v5").await;

        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let (worker, mut rx) = worker(config(), storage.clone(), fetcher);
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        let mut names = storage.keys().await;
        names.sort();
        assert_eq!(names, vec!["flashcard-dynamic-v5", "flashcard-shell-v5"]);
        assert!(worker.clients_claimed());

        let events = drain(&mut rx);
        assert!(events.contains(&WorkerEvent::CacheDeleted {
            name: "flashcard-cache-v3".to_string()
        }));
        assert!(events.contains(&WorkerEvent::ControllerChange));
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::ControllerChange)
        );
    }

    #[tokio::test]
    async fn test_skip_waiting_activates_after_install() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let config = WorkerConfig {
            skip_waiting: true,
            ..config()
        };
        let (worker, _rx) = worker(config, CacheStorage::new(), fetcher);

        worker.install().await.unwrap();
        assert_eq!(worker.state().await, WorkerState::Activated);
        assert!(worker.clients_claimed());
    }

    #[tokio::test]
    async fn test_not_intercepting_before_activation() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let (worker, _rx) = worker(config(), CacheStorage::new(), fetcher);
        worker.install().await.unwrap();

        let outcome = worker
            .handle_fetch(get("https://cards.example/flashcard.html"))
            .await
            .unwrap();
        assert!(outcome.is_passthrough());
    }

    #[tokio::test]
    async fn test_post_is_passed_through() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let worker = running(fetcher.clone()).await;
        let calls_before = fetcher.total_calls();

        let post = Request::post(
            Url::parse("https://cards.example/flashcard.html").unwrap(),
            Bytes::from_static(b"score=3"),
        );
        let outcome = worker.handle_fetch(post).await.unwrap();

        assert!(outcome.is_passthrough());
        assert_eq!(fetcher.total_calls(), calls_before);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_through_worker() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, r#"["french.json"]"#).respond(DECK, 200, "v1");
        let worker = running(fetcher.clone()).await;

        fetcher.respond(DECK, 200, "v2");

        let mut first = worker.handle_fetch(get(DECK)).await.unwrap();
        assert_eq!(first.response().unwrap().body, Bytes::from_static(b"v1"));
        first.take_refresh().unwrap().join().await.unwrap();

        let second = worker.handle_fetch(get(DECK)).await.unwrap();
        assert_eq!(second.response().unwrap().body, Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_refreshed_decks_land_in_dynamic_store() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let worker = running(fetcher.clone()).await;

        let spanish = "https://cards.example/cardholder/spanish.json";
        fetcher.respond(spanish, 200, "hola");
        let mut outcome = worker.handle_fetch(get(spanish)).await.unwrap();
        outcome.take_refresh().unwrap().join().await.unwrap();

        let dynamic = worker.storage().open("flashcard-dynamic-v5").await;
        assert!(dynamic.match_request(&get(spanish)).await.is_some());
    }

    #[tokio::test]
    async fn test_navigation_falls_back_to_main_page() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let config = WorkerConfig {
            routes: vec![RouteRule::new(
                UrlPattern::Scope,
                Strategy::NetworkFallback,
                StoreTarget::Dynamic,
            )],
            ..config()
        };
        let (worker, _rx) = worker(config, CacheStorage::new(), fetcher.clone());
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        fetcher.fail("https://cards.example/review", "offline");
        let request = Request::navigate(Url::parse("https://cards.example/review").unwrap());
        let outcome = worker.handle_fetch(request).await.unwrap();

        assert_eq!(
            outcome.response().unwrap().body,
            Bytes::from_static(b"<html>cards</html>")
        );
    }

    #[tokio::test]
    async fn test_hung_network_times_out_to_503() {
        let fetcher = Arc::new(MockFetcher::new().with_latency(Duration::from_millis(200)));
        let config = WorkerConfig {
            static_assets: Vec::new(),
            index: None,
            fetch_timeout: Some(Duration::from_millis(20)),
            routes: vec![RouteRule::new(
                UrlPattern::Scope,
                Strategy::NetworkFallback,
                StoreTarget::Shell,
            )],
            ..config()
        };
        let (worker, _rx) = worker(config, CacheStorage::new(), fetcher.clone());
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        fetcher.respond(DECK, 200, "late");
        let outcome = worker.handle_fetch(get(DECK)).await.unwrap();
        assert_eq!(
            outcome.response().unwrap().status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_legacy_worker_serves_cache_first() {
        let fetcher = shell_fetcher();
        fetcher.respond(INDEX, 200, "[]");
        let config = WorkerConfig::legacy_cache_first().with_scope(Url::parse(SCOPE).unwrap());
        let (worker, _rx) = worker(config, CacheStorage::new(), fetcher.clone());
        worker.install().await.unwrap();
        worker.activate().await.unwrap();

        fetcher.fail("https://cards.example/flashcard.html", "offline");
        let outcome = worker
            .handle_fetch(get("https://cards.example/flashcard.html"))
            .await
            .unwrap();
        assert_eq!(
            outcome.response().unwrap().body,
            Bytes::from_static(b"<html>cards</html>")
        );

        let other = "https://fonts.example/card.woff2";
        fetcher.respond(other, 200, "font");
        worker.handle_fetch(get(other)).await.unwrap();
        assert!(worker.storage().match_request(&get(other)).await.is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = WorkerConfig {
            shell_cache: String::new(),
            ..WorkerConfig::default()
        };
        let result = OfflineWorker::new(config, CacheStorage::new(), Arc::new(MockFetcher::new()));
        assert!(result.is_err());
    }
}
