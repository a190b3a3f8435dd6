//! Scripted transport for session and patcher tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqcache_core::{CachedRequest, Error, OriginResponse};

use crate::transport::Transport;

type Handler = dyn Fn(&CachedRequest) -> Result<OriginResponse, Error> + Send + Sync;

/// Records every request and answers with a handler.
#[derive(Clone)]
pub struct MockTransport {
    handler: Arc<Mutex<Arc<Handler>>>,
    requests: Arc<Mutex<Vec<CachedRequest>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport").field("calls", &self.calls()).finish()
    }
}

impl MockTransport {
    pub fn new(handler: impl Fn(&CachedRequest) -> Result<OriginResponse, Error> + Send + Sync + 'static) -> Self {
        Self { handler: Arc::new(Mutex::new(Arc::new(handler))), requests: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Always answer 200 with `body` and `headers`.
    pub fn ok(body: &'static str, headers: &'static [(&'static str, &'static str)]) -> Self {
        Self::new(move |request| {
            let mut response = OriginResponse::new(request.clone(), 200).body(body);
            for (name, value) in headers {
                response = response.header(name, value);
            }
            Ok(response)
        })
    }

    /// Swap the handler for subsequent requests.
    pub fn respond_with(&self, handler: impl Fn(&CachedRequest) -> Result<OriginResponse, Error> + Send + Sync + 'static) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn requests(&self) -> Vec<CachedRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &CachedRequest) -> Result<OriginResponse, Error> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(request.clone());
        let handler = self.handler.lock().unwrap_or_else(PoisonError::into_inner).clone();
        handler(request)
    }
}
