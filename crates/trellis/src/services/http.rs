use crate::error::EngineError;
use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub trait HttpTransport {
    fn send(&self, request: HttpRequest) -> LocalBoxFuture<'static, Result<HttpResponse, EngineError>>;
}

/// Canned responses keyed by `METHOD url`; every request is kept for
/// inspection. Unknown requests get a 404.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    responses: RefCell<IndexMap<String, HttpResponse>>,
    requests: RefCell<Vec<HttpRequest>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: &str, url: &str, response: HttpResponse) {
        self.responses
            .borrow_mut()
            .insert(format!("{} {url}", method.to_uppercase()), response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.borrow().clone()
    }
}

impl HttpTransport for RecordingTransport {
    fn send(&self, request: HttpRequest) -> LocalBoxFuture<'static, Result<HttpResponse, EngineError>> {
        let key = format!("{} {}", request.method.to_uppercase(), request.url);
        let response = self
            .responses
            .borrow()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| HttpResponse {
                status: 404,
                body: String::new(),
            });
        log::debug!("{key} -> {}", response.status);
        self.requests.borrow_mut().push(request);
        future::ready(Ok(response)).boxed_local()
    }
}
