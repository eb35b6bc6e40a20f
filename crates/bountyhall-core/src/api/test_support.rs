//! Scripted in-memory transport for exercising the gateway and client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::Notify;

use super::request::{HttpRequest, HttpResponse};
use super::transport::{Transport, TransportError};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Records every request and answers through a handler closure.
///
/// A URL can be held with `hold`, making calls to it wait until the
/// returned `Notify` is signalled. The request is recorded before waiting.
pub struct FakeTransport {
    requests: Mutex<Vec<HttpRequest>>,
    handler: Box<Handler>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            handler: Box::new(handler),
            holds: Mutex::new(HashMap::new()),
        })
    }

    pub fn hold(&self, url: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds
            .lock()
            .unwrap()
            .insert(url.to_string(), notify.clone());
        notify
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url)
            .collect()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.requests_to(url).len()
    }

    pub fn total_calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let hold = self.holds.lock().unwrap().get(&request.url).cloned();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        (self.handler)(&request)
    }
}

pub fn bearer(request: &HttpRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

pub fn content_type(request: &HttpRequest) -> Option<String> {
    request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn json_response(status: StatusCode, body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(status, body.to_string())
}
