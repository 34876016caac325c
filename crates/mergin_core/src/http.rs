//! HTTP transport abstraction.
//!
//! The engine never talks to a socket itself; it issues [`HttpRequest`]
//! values through the object-safe [`HttpClient`] trait and consumes
//! [`HttpResponse`] values. This keeps the protocol logic independent of the
//! HTTP library (the CLI plugs in reqwest, tests plug in the in-process mock
//! server) and gives every request a uniform cancellation point.
//!
//! ## Object safety
//!
//! `HttpClient` is used behind `Arc<dyn HttpClient>`, so its method returns
//! a boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{MerginError, Result};

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Deadline for metadata-sized requests. Streaming bodies (chunk transfers)
/// run without an overall deadline; implementations should apply an idle-gap
/// timer instead.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP method subset used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET request
    Get,
    /// POST request
    Post,
    /// DELETE request
    Delete,
}

impl Method {
    /// Method name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

/// One request to the server.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL including query string
    pub url: String,
    /// Extra headers as (name, value) pairs
    pub headers: Vec<(String, String)>,
    /// Request body, empty for GET
    pub body: Vec<u8>,
    /// Overall deadline, `None` for streaming transfers
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// GET request for a metadata-sized reply.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            timeout: Some(METADATA_TIMEOUT),
        }
    }

    /// POST request with a raw body.
    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body,
            timeout: Some(METADATA_TIMEOUT),
        }
    }

    /// POST request with a JSON body and content type.
    pub fn post_json(url: impl Into<String>, json: &serde_json::Value) -> Self {
        let mut request = Self::post(url, json.to_string().into_bytes());
        request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        request
    }

    /// DELETE request.
    pub fn delete(url: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            timeout: Some(METADATA_TIMEOUT),
        }
    }

    /// Add a bearer `Authorization` header.
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        self
    }

    /// Remove the overall deadline (streaming chunk transfers).
    pub fn streaming(mut self) -> Self {
        self.timeout = None;
        self
    }
}

/// One reply from the server.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// True for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> std::result::Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Capability to issue HTTP requests with cancellation.
///
/// Implementations must watch `cancel` while the request is in flight and
/// resolve with [`MerginError::Cancelled`] promptly once it fires; transport
/// failures (DNS, connect, reset) map to
/// [`MerginError::NetworkUnavailable`]. Non-2xx replies are returned as
/// ordinary responses; status handling is the caller's concern.
pub trait HttpClient: Send + Sync {
    /// Issue one request and await its reply.
    fn send<'a>(
        &'a self,
        request: HttpRequest,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<HttpResponse>>;
}

/// Percent-encode a value for use inside a query string.
///
/// Unreserved characters and `/` (common in project-relative file paths)
/// pass through, everything else is encoded byte-wise.
pub fn encode_query_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decode a percent-encoded query component.
///
/// Malformed escapes are passed through verbatim.
pub fn decode_query_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let decoded = (bytes[i] == b'%' && i + 2 < bytes.len())
            .then(|| std::str::from_utf8(&bytes[i + 1..i + 3]).ok())
            .flatten()
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Cancellation flag shared between a transaction and its in-flight requests.
///
/// Cloned tokens observe the same flag. Cancelling is idempotent and sticky:
/// once fired, every waiter wakes and every later check sees the flag set.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Fresh, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token fires; immediately when it already has.
    pub async fn cancelled(&self) {
        // re-check after arming the waiter so a concurrent cancel() is not lost
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Fail fast with [`MerginError::Cancelled`] when the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MerginError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders() {
        let request = HttpRequest::get("https://example.com/v1/project/ns/p");
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.timeout, Some(METADATA_TIMEOUT));

        let request = HttpRequest::post("https://example.com/x", b"body".to_vec())
            .with_bearer("tok")
            .streaming();
        assert!(request.timeout.is_none());
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer tok".to_string())]
        );
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let request = HttpRequest::post_json("https://e/x", &serde_json::json!({"a": 1}));
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Content-Type" && v == "application/json"));
        assert_eq!(request.body, br#"{"a":1}"#);
    }

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse { status: 200, body: vec![] }.is_success());
        assert!(HttpResponse { status: 299, body: vec![] }.is_success());
        assert!(!HttpResponse { status: 404, body: vec![] }.is_success());
        assert!(!HttpResponse { status: 500, body: vec![] }.is_success());
    }

    #[test]
    fn test_encode_query_component() {
        assert_eq!(encode_query_component("a/b c.txt"), "a/b%20c.txt");
        assert_eq!(encode_query_component("plain-name_1.gpkg"), "plain-name_1.gpkg");
        assert_eq!(encode_query_component("q&a?x"), "q%26a%3Fx");
    }

    #[test]
    fn test_decode_query_component_roundtrip() {
        for value in ["a/b c.txt", "q&a?x", "ümlaut.gpkg", "100%"] {
            assert_eq!(decode_query_component(&encode_query_component(value)), value);
        }
        // malformed escapes pass through
        assert_eq!(decode_query_component("50%"), "50%");
        assert_eq!(decode_query_component("%zz"), "%zz");
    }

    #[tokio::test]
    async fn test_cancel_token_is_sticky_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(clone.is_cancelled());
        assert!(matches!(clone.check(), Err(MerginError::Cancelled)));

        // resolves immediately after the fact
        clone.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        task.await.unwrap();
    }
}
