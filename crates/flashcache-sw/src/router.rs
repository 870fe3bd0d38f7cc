//! Request classification.
//!
//! Routing looks only at the request method and URL. Patterns are compared
//! against the URL with its query string and fragment removed, so
//! `flashcard.html?v=2` routes like `flashcard.html`.

use flashcache_common::{OfflineError, Result};
use flashcache_net::Request;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use url::Url;

use crate::config::WorkerConfig;
use crate::lifecycle::WorkerState;
use crate::strategy::Strategy;

/// URL pattern as written in configuration.
///
/// `Exact` and `Prefix` take absolute URLs or paths relative to the worker
/// scope; `Suffix` compares against the URL path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlPattern {
    /// Exactly this resource.
    Exact(String),
    /// Everything under this URL.
    Prefix(String),
    /// Paths ending with this string, e.g. ".png".
    Suffix(String),
    /// Everything under the worker scope.
    Scope,
    /// Every URL, including other origins.
    Any,
}

impl UrlPattern {
    pub fn exact(url: &str) -> Self {
        Self::Exact(url.to_string())
    }

    pub fn prefix(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }

    pub fn suffix(suffix: &str) -> Self {
        Self::Suffix(suffix.to_string())
    }

    fn compile(&self, scope: &Url) -> Result<Matcher> {
        let resolve = |s: &str| {
            scope.join(s).map(|u| canonical(&u)).map_err(|e| {
                OfflineError::config_with_source(format!("invalid route pattern {s:?}"), e)
            })
        };
        Ok(match self {
            UrlPattern::Exact(s) => Matcher::Exact(resolve(s)?),
            UrlPattern::Prefix(s) => Matcher::Prefix(resolve(s)?),
            UrlPattern::Suffix(s) => Matcher::Suffix(s.clone()),
            UrlPattern::Scope => Matcher::Prefix(canonical(scope)),
            UrlPattern::Any => Matcher::Any,
        })
    }
}

/// Which configured store a rule reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTarget {
    #[default]
    Shell,
    /// The dynamic-content store, or the shell store when none is configured.
    Dynamic,
}

/// A pattern and what to do with requests matching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    pub pattern: UrlPattern,
    pub strategy: Strategy,
    #[serde(default)]
    pub store: StoreTarget,
}

impl RouteRule {
    pub fn new(pattern: UrlPattern, strategy: Strategy, store: StoreTarget) -> Self {
        Self {
            pattern,
            strategy,
            store,
        }
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Leave the request to default network handling.
    Passthrough,
    /// Serve the request with `strategy`, using the store named `store`.
    Intercept { strategy: Strategy, store: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Any,
}

impl Matcher {
    fn matches(&self, url: &Url) -> bool {
        match self {
            Matcher::Exact(target) => canonical(url) == *target,
            Matcher::Prefix(prefix) => canonical(url).starts_with(prefix.as_str()),
            Matcher::Suffix(suffix) => url.path().ends_with(suffix.as_str()),
            Matcher::Any => true,
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: Matcher,
    strategy: Strategy,
    store: String,
}

/// Classifies requests against the configured rules, first match wins.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<CompiledRule>,
}

impl Router {
    /// Compile the rules of `config`, resolving relative patterns against its scope.
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let rules = config
            .routes
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    matcher: rule.pattern.compile(&config.scope)?,
                    strategy: rule.strategy,
                    store: config.store_name(rule.store).to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Decide how `request` is handled while the worker is in `state`.
    pub fn route(&self, request: &Request, state: WorkerState) -> Route {
        if state != WorkerState::Activated {
            trace!(url = %request.url, ?state, "Worker not controlling, passing through");
            return Route::Passthrough;
        }

        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Non-GET request, passing through");
            return Route::Passthrough;
        }

        match self.rules.iter().find(|rule| rule.matcher.matches(&request.url)) {
            Some(rule) => {
                debug!(url = %request.url, strategy = ?rule.strategy, store = %rule.store, "Route matched");
                Route::Intercept {
                    strategy: rule.strategy,
                    store: rule.store.clone(),
                }
            }
            None => {
                trace!(url = %request.url, "No route matched");
                Route::Passthrough
            }
        }
    }
}

/// URL without query and fragment.
fn canonical(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.into()
}
