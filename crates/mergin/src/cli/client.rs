//! reqwest-backed implementation of the engine's `HttpClient` trait.

use mergin_core::error::{MerginError, Result};
use mergin_core::http::{BoxFuture, CancelToken, HttpClient, HttpRequest, HttpResponse, Method};

/// HTTP transport over a shared [`reqwest::Client`].
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Build the transport. Connection pooling lives in the inner client,
    /// so one instance should be shared for the whole session.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mergin-cli/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MerginError::NetworkUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    async fn perform(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MerginError::NetworkUnavailable(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| MerginError::NetworkUnavailable(e.to_string()))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

impl HttpClient for ReqwestClient {
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            cancel.check()?;
            // cancellation aborts the in-flight request by dropping it
            tokio::select! {
                response = self.perform(request) => response,
                _ = cancel.cancelled() => Err(MerginError::Cancelled),
            }
        })
    }
}
