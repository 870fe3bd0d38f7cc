//! # Flashcache Offline Worker
//!
//! Offline caching for the flashcard web app: precache the app shell at
//! install, evict stores from older versions at activation, and serve
//! intercepted requests from cache with one of three strategies.
//!
//! ## Features
//!
//! - **Lifecycle**: explicit install/activate state machine
//! - **Precache**: static app shell plus a dynamically fetched deck index
//! - **Routing**: URL-pattern rules mapping requests to strategies
//! - **Strategies**: cache-first, network fallback, stale-while-revalidate
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     ├── Lifecycle (Parsed → Installing → Installed → Activating → Activated)
//!     ├── Router ── Request → Route (Passthrough | Intercept)
//!     ├── Executor ── Strategy → FetchOutcome (+ RefreshTask)
//!     └── CacheStorage
//!             └── Cache
//!                     └── Request → Response
//! ```

pub mod config;
pub mod lifecycle;
pub mod manifest;
pub mod router;
pub mod store;
pub mod strategy;
pub mod worker;

pub use config::{IndexSource, WorkerConfig};
pub use lifecycle::{Lifecycle, WorkerState};
pub use manifest::AssetManifest;
pub use router::{Route, RouteRule, Router, StoreTarget, UrlPattern};
pub use store::{Cache, CacheEntry, CacheKey, CacheStorage};
pub use strategy::{FetchOutcome, RefreshTask, Strategy};
pub use worker::OfflineWorker;

/// Notifications published on the worker's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Lifecycle state changed.
    StateChange { state: WorkerState },
    /// A store outside the whitelist was deleted at activation.
    CacheDeleted { name: String },
    /// Open pages are now controlled by this worker.
    ControllerChange,
    /// The dynamic part of the precache was skipped.
    IndexUnavailable { error: String },
    /// A background refresh finished; `stored` is false for non-200 responses.
    RefreshCompleted { url: String, stored: bool },
    /// A background refresh failed; the cached copy was left as is.
    RefreshFailed { url: String, error: String },
}
