//! Scripted transport for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use tether_common::{ApiRequest, ApiResponse, Error, Result};

use crate::transport::HttpTransport;

/// What the mock does for one call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with this response.
    Respond(ApiResponse),
    /// Fail with a network error carrying this message.
    Fail(String),
    /// Never answer; the caller's deadline has to cancel the call.
    Hang,
}

impl MockReply {
    /// JSON response with the given status.
    pub fn json(status: u16, value: Value) -> Self {
        MockReply::Respond(ApiResponse::json(status, &value))
    }

    /// Empty response with the given status.
    pub fn status(status: u16) -> Self {
        MockReply::Respond(ApiResponse::new(status, ""))
    }

    /// Network failure.
    pub fn fail(message: impl Into<String>) -> Self {
        MockReply::Fail(message.into())
    }
}

#[derive(Debug)]
struct MockState {
    /// One-shot replies consumed in order.
    script: VecDeque<MockReply>,
    /// Sticky replies by URL, used when the script is empty.
    routes: HashMap<String, MockReply>,
    /// Reply when neither script nor routes match.
    fallback: MockReply,
    /// Every request seen, with the (tokio) time it arrived.
    calls: Vec<(ApiRequest, Instant)>,
}

/// In-memory transport that replays scripted replies.
///
/// Replies are chosen from, in order: the one-shot script, the per-URL
/// routes, and the fallback (200 with `{}` unless changed). Every call is
/// recorded so tests can assert on what went over the "network".
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a mock that answers every request with `200 {}`.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                script: VecDeque::new(),
                routes: HashMap::new(),
                fallback: MockReply::json(200, Value::Object(Default::default())),
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread is the only way to poison this lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a one-shot reply.
    pub fn push(&self, reply: MockReply) -> &Self {
        self.lock().script.push_back(reply);
        self
    }

    /// Reply to every request for `url` with `reply`.
    pub fn route(&self, url: impl Into<String>, reply: MockReply) -> &Self {
        self.lock().routes.insert(url.into(), reply);
        self
    }

    /// Replace the fallback reply.
    pub fn set_fallback(&self, reply: MockReply) -> &Self {
        self.lock().fallback = reply;
        self
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<ApiRequest> {
        self.lock().calls.iter().map(|(r, _)| r.clone()).collect()
    }

    /// Arrival times of all requests received so far.
    pub fn call_times(&self) -> Vec<Instant> {
        self.lock().calls.iter().map(|(_, t)| *t).collect()
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn next_reply(&self, request: &ApiRequest) -> MockReply {
        let mut state = self.lock();
        state.calls.push((request.clone(), Instant::now()));
        if let Some(reply) = state.script.pop_front() {
            return reply;
        }
        state
            .routes
            .get(&request.url)
            .cloned()
            .unwrap_or_else(|| state.fallback.clone())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        match self.next_reply(request) {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fail(message) => Err(Error::Network(message)),
            MockReply::Hang => futures::future::pending().await,
        }
    }
}
