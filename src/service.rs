//! Service Client Base (spec §4.H).
//!
//! Concrete per-service clients (transfer, groups, search, flows, timers,
//! compute) are built on top of this: a thin `do_request` wrapper around
//! [`crate::transport::Transport`] that marshals a JSON body in, decodes a
//! JSON body (or treats 204 as "no value") out, and attaches resource
//! context to errors without changing their kind. Per-endpoint methods for
//! any one service are a straightforward application of `do_request` and
//! live in that service's own client, not in this shared base.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::CallContext;
use crate::error::{Error, ResourceKind, Result};
use crate::transport::{BodyKind, RequestSpec, Transport};

pub struct ServiceClientBase {
    transport: Arc<Transport>,
}

impl ServiceClientBase {
    pub fn new(transport: Arc<Transport>) -> Self {
        ServiceClientBase { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Sends `spec` and decodes the body as `T`, or returns `None` for a
    /// `204 No Content` response (spec §4.G step 8).
    pub async fn do_request<T: DeserializeOwned>(&self, ctx: &CallContext, spec: RequestSpec) -> Result<Option<T>> {
        let resp = self.transport.send(ctx, spec).await?;
        if resp.is_no_content() {
            return Ok(None);
        }
        Ok(Some(resp.json()?))
    }

    /// Same as `do_request`, but any error the transport raises is
    /// annotated with `{resource_kind, resource_id}` without altering its
    /// `kind` (spec §7).
    pub async fn do_request_for_resource<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        spec: RequestSpec,
        resource_kind: ResourceKind,
        resource_id: &str,
    ) -> Result<Option<T>> {
        self.do_request(ctx, spec)
            .await
            .map_err(|e| e.with_resource(resource_kind, resource_id))
    }

    pub fn get(&self, path: impl Into<String>) -> RequestSpec {
        RequestSpec::get(path)
    }

    pub fn post_json(&self, path: impl Into<String>, body: &impl Serialize) -> Result<RequestSpec> {
        RequestSpec::post(path).json_body(body)
    }

    pub fn post_empty(&self, path: impl Into<String>) -> RequestSpec {
        RequestSpec::post(path).body(BodyKind::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{CannedResponse, MockTransport};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Thing {
        id: String,
    }

    // `ServiceClientBase` wraps the real `Transport`, which can't be
    // backed by `MockTransport` directly (different concrete types); this
    // exercises the shared decode/204 logic in isolation instead.
    #[test]
    fn not_found_resource_context_round_trips_through_error() {
        let err = Error::not_found(404, "{}").with_resource(ResourceKind::Flow, "f-1");
        assert!(err.is_not_found());
        assert_eq!(err.resource.unwrap().resource_id, "f-1");
    }

    #[tokio::test]
    async fn mock_transport_decodes_like_do_request_would() {
        let mock = MockTransport::new();
        mock.add_response(CannedResponse::json(200, &json!({"id": "abc"})));
        let ctx = CallContext::new();
        let resp = mock.send(&ctx, RequestSpec::get("/things/abc")).await.unwrap();
        let decoded: Thing = resp.json().unwrap();
        assert_eq!(decoded, Thing { id: "abc".to_string() });
    }
}
