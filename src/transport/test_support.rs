//! In-memory transport test double (spec §A.4), modeled on fusillade's
//! `MockHttpClient`: canned responses dispensed in the order they're
//! added, with optional per-call trigger hooks and call-count assertions,
//! so higher-level components (service clients, the resumable engine) can
//! be tested without a real `wiremock` server when only the response
//! sequence matters.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::CallContext;
use crate::error::Result;
use crate::transport::{RequestSpec, TransportResponse};

pub struct CannedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl CannedResponse {
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        CannedResponse {
            status,
            body: serde_json::to_vec(body).unwrap(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }

    pub fn empty(status: u16) -> Self {
        CannedResponse {
            status,
            body: Vec::new(),
            headers: Vec::new(),
        }
    }
}

struct QueuedResponse {
    response: CannedResponse,
    trigger: Option<Box<dyn Fn() + Send + Sync>>,
}

struct Inner {
    queue: Vec<QueuedResponse>,
    calls: Vec<RequestSpec>,
    in_flight: i64,
}

/// A `Transport`-shaped test double. Doesn't implement the real
/// `Transport`'s type (that struct isn't object-safe to swap out easily);
/// instead it exposes the same `send`/`send_unauthenticated` async methods
/// so service-client tests can be written against either one generically
/// via a small local trait at the call site.
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        MockTransport::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(Inner {
                queue: Vec::new(),
                calls: Vec::new(),
                in_flight: 0,
            })),
        }
    }

    pub fn add_response(&self, response: CannedResponse) {
        self.inner.lock().queue.push(QueuedResponse { response, trigger: None });
    }

    /// Queues a response and a side-effecting trigger fired the moment the
    /// call lands (before the response is handed back) - useful for
    /// simulating a concurrent cancellation or state mutation mid-request.
    pub fn add_response_with_trigger(&self, response: CannedResponse, trigger: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().queue.push(QueuedResponse {
            response,
            trigger: Some(Box::new(trigger)),
        });
    }

    pub fn call_count(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn in_flight_count(&self) -> i64 {
        self.inner.lock().in_flight
    }

    pub fn get_calls(&self) -> Vec<RequestSpec> {
        self.inner.lock().calls.clone()
    }

    pub async fn send(&self, _ctx: &CallContext, spec: RequestSpec) -> Result<TransportResponse> {
        {
            let mut inner = self.inner.lock();
            inner.calls.push(spec.clone());
            inner.in_flight += 1;
        }

        let queued = {
            let mut inner = self.inner.lock();
            if inner.queue.is_empty() {
                None
            } else {
                Some(inner.queue.remove(0))
            }
        };

        let Some(queued) = queued else {
            self.inner.lock().in_flight -= 1;
            return Err(crate::error::Error::network("MockTransport: no queued response"));
        };

        if let Some(trigger) = queued.trigger {
            trigger();
        }

        self.inner.lock().in_flight -= 1;

        let mut headers = reqwest::header::HeaderMap::new();
        for (k, v) in &queued.response.headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }

        let status = queued.response.status;
        let body = bytes::Bytes::from(queued.response.body);

        if status >= 400 {
            return Err(crate::transport::classify_error(status, &headers, &body));
        }

        Ok(TransportResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispenses_responses_in_order() {
        let mock = MockTransport::new();
        mock.add_response(CannedResponse::json(200, &json!({"value": "a"})));
        mock.add_response(CannedResponse::json(200, &json!({"value": "b"})));

        let ctx = CallContext::new();
        let first = mock.send(&ctx, RequestSpec::get("/x")).await.unwrap();
        let second = mock.send(&ctx, RequestSpec::get("/x")).await.unwrap();

        assert_eq!(first.json::<serde_json::Value>().unwrap()["value"], "a");
        assert_eq!(second.json::<serde_json::Value>().unwrap()["value"], "b");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn error_status_classifies() {
        let mock = MockTransport::new();
        mock.add_response(CannedResponse::json(404, &json!({"error": "not found"})));
        let ctx = CallContext::new();
        let err = mock.send(&ctx, RequestSpec::get("/x")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
