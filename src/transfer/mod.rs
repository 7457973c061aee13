//! Transfer Task Protocol (spec §4.K) and its resumable engine (§4.L).
//!
//! `TransferClient` is the one concrete service client the core ships (spec
//! §4.H: "one concrete client... to exercise §4.K/§4.L end to end"); the
//! wire shapes here follow spec §6's "Transfer service" contract exactly
//! (`DATA_TYPE` envelopes, `submission_id`, `/task/{id}` polling).

pub mod resumable;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::error::{Error, ResourceKind, Result};
use crate::service::ServiceClientBase;
use crate::transport::{RequestSpec, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Transfer,
    Delete,
}

impl TaskKind {
    fn envelope_data_type(&self) -> &'static str {
        match self {
            TaskKind::Transfer => "transfer",
            TaskKind::Delete => "delete",
        }
    }

    fn item_data_type(&self) -> &'static str {
        match self {
            TaskKind::Transfer => "transfer_item",
            TaskKind::Delete => "delete_item",
        }
    }
}

/// `{data_type tag, source_path?, destination_path?, path, recursive?,
/// checksum_algorithm?, external_checksum?}` (spec §3). `data_type` is
/// filled in from the parent request's kind if left unset; supplying a
/// mismatched value is a validation error rather than silently overridden,
/// so a caller who got it wrong hears about it instead of being surprised
/// by what went over the wire.
#[derive(Debug, Clone, Default)]
pub struct TransferItem {
    pub data_type: Option<String>,
    pub source_path: Option<String>,
    pub destination_path: Option<String>,
    pub path: Option<String>,
    pub recursive: Option<bool>,
    pub checksum_algorithm: Option<String>,
    pub external_checksum: Option<String>,
}

impl TransferItem {
    pub fn transfer(source_path: impl Into<String>, destination_path: impl Into<String>, recursive: bool) -> Self {
        TransferItem {
            data_type: None,
            source_path: Some(source_path.into()),
            destination_path: Some(destination_path.into()),
            path: None,
            recursive: Some(recursive),
            checksum_algorithm: None,
            external_checksum: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        TransferItem {
            data_type: None,
            source_path: None,
            destination_path: None,
            path: Some(path.into()),
            recursive: None,
            checksum_algorithm: None,
            external_checksum: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransferFlags {
    pub verify_checksum: bool,
    pub encrypt: bool,
    pub preserve_mtime: bool,
    pub delete_destination_extra: bool,
    pub notify_on_succeeded: bool,
    pub notify_on_failed: bool,
    pub notify_on_inactive: bool,
}

/// `{kind, source_endpoint?, destination_endpoint?, endpoint_for_delete?,
/// items[], submission_id, label?, deadline?, sync_level?, flags, data_type
/// tag}` (spec §3 "Transfer Task Request").
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    pub data_type: Option<String>,
    pub source_endpoint: Option<String>,
    pub destination_endpoint: Option<String>,
    pub endpoint_for_delete: Option<String>,
    pub items: Vec<TransferItem>,
    pub submission_id: Option<String>,
    pub label: Option<String>,
    pub sync_level: Option<u8>,
    pub flags: TransferFlags,
}

impl TaskRequest {
    pub fn transfer(source_endpoint: impl Into<String>, destination_endpoint: impl Into<String>, items: Vec<TransferItem>) -> Self {
        TaskRequest {
            kind: TaskKind::Transfer,
            data_type: None,
            source_endpoint: Some(source_endpoint.into()),
            destination_endpoint: Some(destination_endpoint.into()),
            endpoint_for_delete: None,
            items,
            submission_id: None,
            label: None,
            sync_level: None,
            flags: TransferFlags::default(),
        }
    }

    pub fn delete(endpoint: impl Into<String>, items: Vec<TransferItem>) -> Self {
        TaskRequest {
            kind: TaskKind::Delete,
            data_type: None,
            source_endpoint: None,
            destination_endpoint: None,
            endpoint_for_delete: Some(endpoint.into()),
            items,
            submission_id: None,
            label: None,
            sync_level: None,
            flags: TransferFlags::default(),
        }
    }

    /// Fills in `data_type` on the request and every item (defaulting from
    /// `kind` when unset, rejecting an explicit mismatch), and checks the
    /// "at least one item" invariant (spec §3).
    fn defaulted(mut self) -> Result<Self> {
        let expected = self.kind.envelope_data_type();
        match &self.data_type {
            None => self.data_type = Some(expected.to_string()),
            Some(dt) if dt == expected => {}
            Some(dt) => return Err(Error::validation_msg(format!("request data_type {dt:?} does not match kind (expected {expected:?})"))),
        }

        if self.items.is_empty() {
            return Err(Error::validation_msg("transfer task request must carry at least one item"));
        }

        let expected_item = self.kind.item_data_type();
        for item in &mut self.items {
            match &item.data_type {
                None => item.data_type = Some(expected_item.to_string()),
                Some(dt) if dt == expected_item => {}
                Some(dt) => {
                    return Err(Error::validation_msg(format!(
                        "item data_type {dt:?} does not match parent kind (expected {expected_item:?})"
                    )))
                }
            }
        }

        Ok(self)
    }
}

#[derive(Serialize)]
struct TransferItemWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    destination_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recursive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum_algorithm: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_checksum: Option<&'a str>,
}

#[derive(Serialize)]
struct DeleteItemWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'a str,
    path: &'a str,
}

#[derive(Serialize)]
struct TransferRequestWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'a str,
    submission_id: &'a str,
    source_endpoint: &'a str,
    destination_endpoint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync_level: Option<u8>,
    verify_checksum: bool,
    encrypt_data: bool,
    preserve_timestamp: bool,
    delete_destination_extra: bool,
    notify_on_succeeded: bool,
    notify_on_failed: bool,
    notify_on_inactive: bool,
    #[serde(rename = "DATA")]
    data: Vec<TransferItemWire<'a>>,
}

#[derive(Serialize)]
struct DeleteRequestWire<'a> {
    #[serde(rename = "DATA_TYPE")]
    data_type: &'a str,
    submission_id: &'a str,
    endpoint: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<&'a str>,
    #[serde(rename = "DATA")]
    data: Vec<DeleteItemWire<'a>>,
}

#[derive(Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Active,
    Inactive,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal set: `{SUCCEEDED, FAILED, CANCELLED}` (spec §4.K).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// `{id, kind, status, bytes_transferred, bytes_expected, files_transferred,
/// files_expected, nice_status?, completion_time?}` (spec §3 "Task").
#[derive(Debug, Clone, Deserialize)]
pub struct Task {
    #[serde(rename = "task_id")]
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub bytes_transferred: u64,
    #[serde(default)]
    pub bytes_expected: u64,
    #[serde(default)]
    pub files_transferred: u64,
    #[serde(default)]
    pub files_expected: u64,
    pub nice_status: Option<String>,
    pub completion_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Collapsed `cancel_task` result (spec §9 Open Question: the source has
/// both a value- and result-returning variant; this unifies them into one
/// operation-result-returning signature). A task that has already
/// terminated by the time the cancel lands is still reported as `success`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct OperationResult {
    #[serde(default = "default_true")]
    pub success: bool,
    pub code: Option<String>,
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
struct SubmissionIdResponse {
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: DirEntryType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub link_target: Option<String>,
}

impl DirEntry {
    pub fn is_symlink(&self) -> bool {
        self.link_target.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirEntryType {
    File,
    Dir,
}

#[derive(Deserialize)]
struct LsResponse {
    #[serde(rename = "DATA")]
    data: Vec<DirEntry>,
}

/// Caches server-issued submission IDs so `create_task` callers always have
/// one to hand in before POSTing (spec §4.K: "the client must call
/// `obtain_submission_id()`"). Holds a small prefetched pool so a retried
/// `create_task` doesn't need a fresh network round trip merely to get an
/// ID it's about to discard in favor of the one already bound to the
/// in-flight attempt; the pool is never consulted once a caller has a
/// submission ID bound to a specific request.
struct SubmissionIdCache {
    prefetched: SyncMutex<Vec<String>>,
}

impl SubmissionIdCache {
    fn new() -> Self {
        SubmissionIdCache { prefetched: SyncMutex::new(Vec::new()) }
    }

    fn take_prefetched(&self) -> Option<String> {
        self.prefetched.lock().pop()
    }

    fn stash(&self, id: String) {
        self.prefetched.lock().push(id);
    }
}

/// Talks to the transfer service's task-submission and task-monitoring
/// endpoints (spec §6 "Transfer service").
pub struct TransferClient {
    base: ServiceClientBase,
    submission_ids: SubmissionIdCache,
}

impl TransferClient {
    pub fn new(transport: Arc<Transport>) -> Self {
        TransferClient {
            base: ServiceClientBase::new(transport),
            submission_ids: SubmissionIdCache::new(),
        }
    }

    /// `GET /submission_id` (spec §6). Prefers a prefetched ID over a fresh
    /// round trip when one is available.
    pub async fn obtain_submission_id(&self, ctx: &CallContext) -> Result<String> {
        if let Some(id) = self.submission_ids.take_prefetched() {
            return Ok(id);
        }
        let spec = self.base.get("/submission_id");
        let resp: SubmissionIdResponse = self
            .base
            .do_request(ctx, spec)
            .await?
            .ok_or_else(|| Error::validation_msg("submission_id endpoint returned no body"))?;
        Ok(resp.value)
    }

    /// Prefetches one extra submission ID for later use without blocking a
    /// future `obtain_submission_id` call on the network.
    pub async fn prefetch_submission_id(&self, ctx: &CallContext) -> Result<()> {
        let spec = self.base.get("/submission_id");
        let resp: SubmissionIdResponse = self
            .base
            .do_request(ctx, spec)
            .await?
            .ok_or_else(|| Error::validation_msg("submission_id endpoint returned no body"))?;
        self.submission_ids.stash(resp.value);
        Ok(())
    }

    /// Fills in defaults, obtains a submission ID if the caller didn't
    /// supply one, and POSTs `/transfer`. Idempotent under retry with the
    /// same `submission_id` (spec §4.K, §8 property 9).
    pub async fn submit_transfer(&self, ctx: &CallContext, mut request: TaskRequest) -> Result<String> {
        if request.kind != TaskKind::Transfer {
            return Err(Error::validation_msg("submit_transfer called with a non-transfer request"));
        }
        if request.submission_id.is_none() {
            request.submission_id = Some(self.obtain_submission_id(ctx).await?);
        }
        let request = request.defaulted()?;

        let submission_id = request.submission_id.as_deref().expect("submission_id filled in above");
        let source_endpoint = request
            .source_endpoint
            .as_deref()
            .ok_or_else(|| Error::validation_msg("transfer request missing source_endpoint"))?;
        let destination_endpoint = request
            .destination_endpoint
            .as_deref()
            .ok_or_else(|| Error::validation_msg("transfer request missing destination_endpoint"))?;

        let items: Vec<TransferItemWire> = request
            .items
            .iter()
            .map(|item| TransferItemWire {
                data_type: item.data_type.as_deref().unwrap_or("transfer_item"),
                source_path: item.source_path.as_deref(),
                destination_path: item.destination_path.as_deref(),
                recursive: item.recursive,
                checksum_algorithm: item.checksum_algorithm.as_deref(),
                external_checksum: item.external_checksum.as_deref(),
            })
            .collect();

        let wire = TransferRequestWire {
            data_type: "transfer",
            submission_id,
            source_endpoint,
            destination_endpoint,
            label: request.label.as_deref(),
            sync_level: request.sync_level,
            verify_checksum: request.flags.verify_checksum,
            encrypt_data: request.flags.encrypt,
            preserve_timestamp: request.flags.preserve_mtime,
            delete_destination_extra: request.flags.delete_destination_extra,
            notify_on_succeeded: request.flags.notify_on_succeeded,
            notify_on_failed: request.flags.notify_on_failed,
            notify_on_inactive: request.flags.notify_on_inactive,
            data: items,
        };

        let spec = self.base.post_json("/transfer", &wire)?;
        let resp: CreateTaskResponse = self
            .base
            .do_request(ctx, spec)
            .await?
            .ok_or_else(|| Error::validation_msg("/transfer returned no body"))?;
        Ok(resp.task_id)
    }

    /// `POST /delete` (spec §6). All deletions are recursive at the
    /// service; the request carries no per-item recursion flag.
    pub async fn submit_delete(&self, ctx: &CallContext, mut request: TaskRequest) -> Result<String> {
        if request.kind != TaskKind::Delete {
            return Err(Error::validation_msg("submit_delete called with a non-delete request"));
        }
        if request.submission_id.is_none() {
            request.submission_id = Some(self.obtain_submission_id(ctx).await?);
        }
        let request = request.defaulted()?;

        let submission_id = request.submission_id.as_deref().expect("submission_id filled in above");
        let endpoint = request
            .endpoint_for_delete
            .as_deref()
            .ok_or_else(|| Error::validation_msg("delete request missing endpoint_for_delete"))?;

        let items: Vec<DeleteItemWire> = request
            .items
            .iter()
            .map(|item| {
                let path = item.path.as_deref().unwrap_or_default();
                DeleteItemWire { data_type: "delete_item", path }
            })
            .collect();

        let wire = DeleteRequestWire {
            data_type: "delete",
            submission_id,
            endpoint,
            label: request.label.as_deref(),
            data: items,
        };

        let spec = self.base.post_json("/delete", &wire)?;
        let resp: CreateTaskResponse = self
            .base
            .do_request(ctx, spec)
            .await?
            .ok_or_else(|| Error::validation_msg("/delete returned no body"))?;
        Ok(resp.task_id)
    }

    /// `GET /task/{id}`.
    pub async fn get_task(&self, ctx: &CallContext, task_id: &str) -> Result<Task> {
        let spec = self.base.get(format!("/task/{task_id}"));
        self.base
            .do_request_for_resource(ctx, spec, ResourceKind::Task, task_id)
            .await?
            .ok_or_else(|| Error::validation_msg("/task/{id} returned no body"))
    }

    /// `POST /task/{id}/cancel`. Allowed to return success even if the task
    /// has already reached a terminal state (spec §4.K "Cancellation").
    pub async fn cancel_task(&self, ctx: &CallContext, task_id: &str) -> Result<OperationResult> {
        let spec = self.base.post_empty(format!("/task/{task_id}/cancel"));
        let result: Option<OperationResult> = self.base.do_request_for_resource(ctx, spec, ResourceKind::Task, task_id).await?;
        Ok(result.unwrap_or_default())
    }

    /// Polls `get_task` until it reaches a terminal status or `deadline`
    /// elapses, sleeping `poll_interval` between attempts. Returns
    /// `CANCELLED` promptly if `ctx` is cancelled mid-sleep (spec §8
    /// property 12).
    pub async fn wait_for_task(&self, ctx: &CallContext, task_id: &str, poll_interval: Duration, deadline: Option<Duration>) -> Result<Task> {
        let start = Instant::now();
        loop {
            let task = self.get_task(ctx, task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if let Some(d) = deadline {
                if start.elapsed() >= d {
                    return Err(Error::cancelled("wait_for_task deadline elapsed"));
                }
            }
            ctx.sleep(poll_interval).await?;
        }
    }

    /// `POST /operation/endpoint/{id}/mkdir`.
    pub async fn mkdir(&self, ctx: &CallContext, endpoint_id: &str, path: &str) -> Result<()> {
        let body = serde_json::json!({"DATA_TYPE": "mkdir", "path": path});
        let spec = RequestSpec::post(format!("/operation/endpoint/{endpoint_id}/mkdir")).json_body(&body)?;
        self.base.do_request::<serde_json::Value>(ctx, spec).await?;
        Ok(())
    }

    /// `GET /operation/endpoint/{id}/ls?path=…` (spec §6). Used by the
    /// resumable engine to expand directories into leaf entries.
    pub async fn ls(&self, ctx: &CallContext, endpoint_id: &str, path: &str) -> Result<Vec<DirEntry>> {
        let spec = RequestSpec::get(format!("/operation/endpoint/{endpoint_id}/ls")).query("path", path);
        let resp: LsResponse = self
            .base
            .do_request_for_resource(ctx, spec, ResourceKind::Endpoint, endpoint_id)
            .await?
            .ok_or_else(|| Error::validation_msg("ls returned no body"))?;
        Ok(resp.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::{CannedResponse, MockTransport};
    use serde_json::json;

    #[test]
    fn defaults_data_type_tags_for_transfer() {
        let request = TaskRequest::transfer("ep1", "ep2", vec![TransferItem::transfer("/a", "/b", false)])
            .defaulted()
            .unwrap();
        assert_eq!(request.data_type.as_deref(), Some("transfer"));
        assert_eq!(request.items[0].data_type.as_deref(), Some("transfer_item"));
    }

    #[test]
    fn defaults_data_type_tags_for_delete() {
        let request = TaskRequest::delete("ep1", vec![TransferItem::delete("/a")]).defaulted().unwrap();
        assert_eq!(request.data_type.as_deref(), Some("delete"));
        assert_eq!(request.items[0].data_type.as_deref(), Some("delete_item"));
    }

    #[test]
    fn rejects_mismatched_item_tag() {
        let mut request = TaskRequest::transfer("ep1", "ep2", vec![TransferItem::transfer("/a", "/b", false)]);
        request.items[0].data_type = Some("delete_item".to_string());
        assert!(request.defaulted().is_err());
    }

    #[test]
    fn rejects_empty_items() {
        let request = TaskRequest::transfer("ep1", "ep2", vec![]);
        assert!(request.defaulted().is_err());
    }

    #[test]
    fn wire_envelope_matches_spec_shape() {
        let request = TaskRequest::delete("ep1", vec![TransferItem::delete("/globus-test/foo")]).defaulted().unwrap();
        let submission_id = "sub-1";
        let items: Vec<DeleteItemWire> = request
            .items
            .iter()
            .map(|item| DeleteItemWire { data_type: "delete_item", path: item.path.as_deref().unwrap() })
            .collect();
        let wire = DeleteRequestWire {
            data_type: "delete",
            submission_id,
            endpoint: "ep1",
            label: None,
            data: items,
        };
        let value = serde_json::to_value(&wire).unwrap();
        assert_eq!(value["DATA_TYPE"], "delete");
        assert_eq!(value["DATA"][0]["DATA_TYPE"], "delete_item");
        assert_eq!(value["DATA"][0]["path"], "/globus-test/foo");
        assert_eq!(value["submission_id"], "sub-1");
    }

    #[test]
    fn task_status_parses_uppercase_wire_values() {
        let task: Task = serde_json::from_value(json!({
            "task_id": "t-1",
            "status": "SUCCEEDED",
            "bytes_transferred": 100,
            "bytes_expected": 100,
        }))
        .unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.status.is_terminal());
    }

    #[tokio::test]
    async fn submission_id_cache_prefers_prefetched() {
        let cache = SubmissionIdCache::new();
        cache.stash("pre-1".to_string());
        assert_eq!(cache.take_prefetched(), Some("pre-1".to_string()));
        assert_eq!(cache.take_prefetched(), None);
    }

    #[tokio::test]
    async fn mock_transport_decodes_task_status() {
        let mock = MockTransport::new();
        mock.add_response(CannedResponse::json(
            200,
            &json!({"task_id": "t-1", "status": "ACTIVE", "bytes_transferred": 0, "bytes_expected": 100}),
        ));
        let ctx = CallContext::new();
        let resp = mock.send(&ctx, RequestSpec::get("/task/t-1")).await.unwrap();
        let task: Task = resp.json().unwrap();
        assert!(!task.status.is_terminal());
    }
}
