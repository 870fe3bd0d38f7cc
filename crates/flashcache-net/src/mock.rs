//! In-memory [`Fetcher`] for tests and offline simulation.
//!
//! URLs without a registered reply fail like an unreachable network.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Reply {
    Respond(Response),
    Fail(String),
}

#[derive(Debug, Default)]
struct State {
    replies: HashMap<String, Reply>,
    calls: Vec<String>,
}

/// Fetcher answering from a table of canned replies keyed by URL.
#[derive(Debug, Default)]
pub struct MockFetcher {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, to exercise timeouts and background refreshes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reply to `url` with `status` and `body`, replacing any earlier reply.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(status, body);
        response.url = url::Url::parse(url).ok();
        self.set(url, Reply::Respond(response));
        self
    }

    /// Make fetches of `url` fail at the network level.
    pub fn fail(&self, url: &str, reason: &str) -> &Self {
        self.set(url, Reply::Fail(reason.to_string()));
        self
    }

    /// Number of fetches issued for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == url).count()
    }

    /// Total fetches issued.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.len()
    }

    fn set(&self, url: &str, reply: Reply) {
        self.lock().replies.insert(url.to_string(), reply);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        let url = request.url.as_str().to_string();
        let reply = {
            let mut state = self.lock();
            state.calls.push(url.clone());
            state.replies.get(&url).cloned()
        };

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(reason)) => Err(NetError::RequestFailed(reason)),
            None => Err(NetError::RequestFailed(format!("no route to {url}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_canned_reply_and_call_count() {
        let fetcher = MockFetcher::new();
        fetcher.respond("https://cards.example/manifest.json", 200, "{}");

        let request = Request::parse("https://cards.example/manifest.json").unwrap();
        let response = fetcher.fetch(&request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(fetcher.calls("https://cards.example/manifest.json"), 1);
    }

    #[tokio::test]
    async fn test_unknown_url_fails() {
        let fetcher = MockFetcher::new();
        let request = Request::parse("https://cards.example/nowhere").unwrap();
        assert!(fetcher.fetch(&request).await.is_err());
        assert_eq!(fetcher.total_calls(), 1);
    }
}
