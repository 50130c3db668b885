//! `app.fetch.*` over the network.

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use reqwest::Method;
use trellis::EngineError;
use trellis::services::{HttpRequest, HttpResponse, HttpTransport};

#[derive(Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn failure(error: impl std::fmt::Display) -> EngineError {
    EngineError::Service {
        service: "http",
        message: error.to_string(),
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> LocalBoxFuture<'static, Result<HttpResponse, EngineError>> {
        let client = self.client.clone();
        async move {
            let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(failure)?;
            log::debug!("{method} {}", request.url);
            let mut builder = client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            let response = builder.send().await.map_err(failure)?;
            let status = response.status().as_u16();
            let body = response.text().await.map_err(failure)?;
            Ok(HttpResponse { status, body })
        }
        .boxed_local()
    }
}
