//! Resumable Transfer Engine (spec §4.L) - the hardest subsystem in the
//! crate. Submits a large logical transfer as a sequence of server-side
//! tasks, one per fixed-size batch of the manifest, surviving caller
//! crashes and partial failures.
//!
//! Grounded on `fusillade::manager::Storage`'s trait-based persistence seam
//! (swappable in-memory vs. durable implementations behind one trait) for
//! [`CheckpointStore`], and on `fusillade::batch::{File, Batch, BatchStatus}`
//! (immutable once sealed, status computed from child state) as the
//! template for the manifest/batch bookkeeping below.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;

use crate::context::CallContext;
use crate::error::{Error, ResourceKind, Result};
use crate::rate_limit::BackoffStrategy;

use super::{DirEntryType, TaskKind, TaskRequest, TaskStatus, TransferClient, TransferItem};

/// One leaf file entry in a fully-expanded manifest (spec §3 "Checkpoint",
/// `item_manifest[]`). Directories are expanded down to files during
/// manifest construction; nothing recursive is stored here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_path: String,
    pub destination_path: String,
    pub size: Option<u64>,
}

/// `{item, last_error}` for a manifest entry whose per-item retry budget
/// was exhausted (spec §3 "Checkpoint", `failed_items[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedItem {
    pub item: ManifestEntry,
    pub last_error: String,
}

/// Durable progress record for one resumable transfer (spec §3
/// "Checkpoint"). `item_manifest` is immutable once the checkpoint is
/// created; `completed_batch_indices` only grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub source_endpoint: String,
    pub destination_endpoint: String,
    pub base_source_path: String,
    pub base_destination_path: String,
    pub item_manifest: Vec<ManifestEntry>,
    pub batch_size: usize,
    pub completed_batch_indices: BTreeSet<usize>,
    /// Submission IDs issued for a batch before its create call lands -
    /// persisted ahead of the network call so a crash between the two
    /// never loses the idempotence key (spec §4.L invariants).
    pub pending_submission_ids: HashMap<usize, String>,
    pub submitted_task_ids: HashMap<usize, String>,
    pub retry_attempts: HashMap<usize, u32>,
    pub failed_items: Vec<FailedItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn batch_count(&self) -> usize {
        self.item_manifest.len().div_ceil(self.batch_size.max(1))
    }

    pub fn batch_range(&self, batch_index: usize) -> Range<usize> {
        let start = batch_index * self.batch_size;
        let end = (start + self.batch_size).min(self.item_manifest.len());
        start..end
    }

    pub fn batch_items(&self, batch_index: usize) -> &[ManifestEntry] {
        &self.item_manifest[self.batch_range(batch_index)]
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Content-addresses a manifest by `(source_endpoint, destination_endpoint,
/// base_paths, filter_tag, walk_time)` (spec §4.L "Manifest construction").
/// `filter_tag` stands in for an arbitrary item filter predicate, which
/// can't itself be hashed; callers that supply a filter should pass a
/// stable label for it.
pub fn content_address(
    source_endpoint: &str,
    destination_endpoint: &str,
    base_source_path: &str,
    base_destination_path: &str,
    filter_tag: Option<&str>,
    walk_time: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_endpoint.as_bytes());
    hasher.update(b"\0");
    hasher.update(destination_endpoint.as_bytes());
    hasher.update(b"\0");
    hasher.update(base_source_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(base_destination_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(filter_tag.unwrap_or("").as_bytes());
    hasher.update(b"\0");
    hasher.update(walk_time.to_rfc3339().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Pluggable, per-`checkpoint_id`-serialized persistence for checkpoints
/// (spec §5: "Checkpoint store: serialized per checkpoint_id; atomic
/// replace-on-write").
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>>;
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// In-memory `CheckpointStore`, for tests and single-process use without
/// crash survival.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: dashmap::DashMap<String, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        InMemoryCheckpointStore::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.entries.get(checkpoint_id).map(|e| e.value().clone()))
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.entries.insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }
}

/// File-backed `CheckpointStore`: one JSON blob per `checkpoint_id`,
/// fsynced before the rename that makes it visible (spec §6: "Writer must
/// fsync before rename").
#[cfg(feature = "file-store")]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

#[cfg(feature = "file-store")]
impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileCheckpointStore { dir: dir.into() }
    }

    fn path_for(&self, checkpoint_id: &str) -> PathBuf {
        self.dir.join(format!("{checkpoint_id}.json"))
    }
}

#[cfg(feature = "file-store")]
#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(checkpoint_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::network(format!("reading checkpoint {}: {e}", path.display()))),
        }
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::network(format!("creating checkpoint dir {}: {e}", self.dir.display())))?;
        let path = self.path_for(&checkpoint.checkpoint_id);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::network(format!("creating {}: {e}", tmp_path.display())))?;
        file.write_all(&bytes).await.map_err(|e| Error::network(format!("writing {}: {e}", tmp_path.display())))?;
        file.sync_all().await.map_err(|e| Error::network(format!("fsync {}: {e}", tmp_path.display())))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::network(format!("renaming {} to {}: {e}", tmp_path.display(), path.display())))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResumableTransferOptions {
    pub batch_size: usize,
    pub max_concurrent_tasks: usize,
    pub verify_checksum: bool,
    pub encrypt: bool,
    pub sync_level: Option<u8>,
    pub retry_policy: BackoffStrategy,
    pub max_item_retries: u32,
    pub poll_interval: Duration,
}

impl Default for ResumableTransferOptions {
    fn default() -> Self {
        ResumableTransferOptions {
            batch_size: 1000,
            max_concurrent_tasks: 4,
            verify_checksum: false,
            encrypt: false,
            sync_level: None,
            retry_policy: BackoffStrategy::default(),
            max_item_retries: 3,
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcomeStatus {
    Succeeded,
    Partial,
    Cancelled,
    Failed,
}

/// `{checkpoint_id, total_items, bytes_transferred, completed_items,
/// failed_items[], task_ids[], status}` (spec §4.L "Outcome").
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub checkpoint_id: String,
    pub total_items: usize,
    pub bytes_transferred: u64,
    pub completed_items: usize,
    pub failed_items: Vec<FailedItem>,
    pub task_ids: Vec<String>,
    pub status: TransferOutcomeStatus,
}

/// Directory lister the manifest walk depends on - implemented by
/// [`TransferClient::ls`] in production and stubbed in tests so manifest
/// construction can be exercised without a real transfer service.
#[async_trait::async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list(&self, ctx: &CallContext, endpoint: &str, path: &str) -> Result<Vec<super::DirEntry>>;
}

#[async_trait::async_trait]
impl DirectoryLister for TransferClient {
    async fn list(&self, ctx: &CallContext, endpoint: &str, path: &str) -> Result<Vec<super::DirEntry>> {
        self.ls(ctx, endpoint, path).await
    }
}

/// Walks `base_source_path` on `source_endpoint` via `lister`, expanding
/// every directory into its leaf files and mapping each source path onto
/// its destination counterpart under `base_destination_path`. Symlinks and
/// (by construction, since nothing already-visited is re-queued) cycles
/// are never recursed into (spec §4.L "Manifest construction").
pub async fn build_manifest(
    ctx: &CallContext,
    lister: &dyn DirectoryLister,
    source_endpoint: &str,
    base_source_path: &str,
    base_destination_path: &str,
) -> Result<Vec<ManifestEntry>> {
    let mut manifest = Vec::new();
    let mut pending_dirs = vec![(base_source_path.to_string(), base_destination_path.to_string())];

    while let Some((src_dir, dst_dir)) = pending_dirs.pop() {
        let entries = lister.list(ctx, source_endpoint, &src_dir).await?;
        for entry in entries {
            if entry.is_symlink() {
                continue;
            }
            let child_src = join_path(&src_dir, &entry.name);
            let child_dst = join_path(&dst_dir, &entry.name);
            match entry.entry_type {
                DirEntryType::Dir => pending_dirs.push((child_src, child_dst)),
                DirEntryType::File => manifest.push(ManifestEntry {
                    source_path: child_src,
                    destination_path: child_dst,
                    size: entry.size,
                }),
            }
        }
    }

    Ok(manifest)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Submits a large logical transfer as a sequence of checkpointed,
/// independently-tracked server-side tasks (spec §4.L).
pub struct ResumableTransfer<S: CheckpointStore> {
    client: Arc<TransferClient>,
    store: Arc<S>,
    options: ResumableTransferOptions,
}

impl<S: CheckpointStore + 'static> ResumableTransfer<S> {
    pub fn new(client: Arc<TransferClient>, store: Arc<S>, options: ResumableTransferOptions) -> Self {
        ResumableTransfer { client, store, options }
    }

    /// Walks the source tree, seals a fresh checkpoint, and runs the
    /// submission loop. A manifest is never regenerated for an existing
    /// `checkpoint_id` (spec §4.L invariants) - this always mints a new one.
    pub async fn start(
        &self,
        ctx: &CallContext,
        source_endpoint: &str,
        destination_endpoint: &str,
        base_source_path: &str,
        base_destination_path: &str,
    ) -> Result<TransferOutcome> {
        let manifest = build_manifest(ctx, self.client.as_ref(), source_endpoint, base_source_path, base_destination_path).await?;
        let now = Utc::now();
        let checkpoint_id = content_address(source_endpoint, destination_endpoint, base_source_path, base_destination_path, None, now);

        let checkpoint = Checkpoint {
            checkpoint_id,
            source_endpoint: source_endpoint.to_string(),
            destination_endpoint: destination_endpoint.to_string(),
            base_source_path: base_source_path.to_string(),
            base_destination_path: base_destination_path.to_string(),
            item_manifest: manifest,
            batch_size: self.options.batch_size,
            completed_batch_indices: BTreeSet::new(),
            pending_submission_ids: HashMap::new(),
            submitted_task_ids: HashMap::new(),
            retry_attempts: HashMap::new(),
            failed_items: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.store.save(&checkpoint).await?;

        self.run(ctx, checkpoint).await
    }

    /// Reloads a previously-persisted checkpoint and continues its
    /// submission loop: tasks already submitted are re-polled, never
    /// resubmitted, until every batch is accounted for (spec §4.L "Resume").
    pub async fn resume(&self, ctx: &CallContext, checkpoint_id: &str) -> Result<TransferOutcome> {
        let checkpoint = self
            .store
            .load(checkpoint_id)
            .await?
            .ok_or_else(|| Error::not_found_local(ResourceKind::Other, checkpoint_id))?;
        self.run(ctx, checkpoint).await
    }

    async fn run(&self, ctx: &CallContext, checkpoint: Checkpoint) -> Result<TransferOutcome> {
        let total_items = checkpoint.item_manifest.len();
        let batch_count = checkpoint.batch_count();

        // Partition the outstanding batches into "already submitted, needs
        // re-polling only" and "never submitted, needs a fresh create call".
        // Resume must finish accounting for every previously-submitted task
        // before it starts anything new (spec §4.L "Resume": "Only after
        // all previously submitted tasks are accounted for does the loop
        // start new submissions").
        let mut needs_repoll = Vec::new();
        let mut needs_submission = Vec::new();
        for batch_index in 0..batch_count {
            if checkpoint.completed_batch_indices.contains(&batch_index) {
                continue;
            }
            if checkpoint.submitted_task_ids.contains_key(&batch_index) {
                needs_repoll.push(batch_index);
            } else {
                needs_submission.push(batch_index);
            }
        }

        let checkpoint = Arc::new(AsyncMutex::new(checkpoint));
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_tasks.max(1)));
        let mut cancelled = false;
        let mut task_ids = Vec::new();

        for phase in [needs_repoll, needs_submission] {
            if cancelled {
                break;
            }

            let mut join_set: JoinSet<Result<BatchOutcome>> = JoinSet::new();
            for batch_index in phase {
                if checkpoint.lock().await.completed_batch_indices.contains(&batch_index) {
                    continue;
                }
                if ctx.is_cancelled() {
                    cancelled = true;
                    break;
                }

                let semaphore = semaphore.clone();
                let checkpoint = checkpoint.clone();
                let client = self.client.clone();
                let store = self.store.clone();
                let options = self.options.clone();
                let batch_ctx = ctx.child();

                join_set.spawn(async move {
                    let permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::cancelled("resumable transfer semaphore closed"))?;
                    let outcome = process_batch(&batch_ctx, client.as_ref(), store.as_ref(), checkpoint, batch_index, &options).await;
                    drop(permit);
                    outcome
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(outcome)) => {
                        if let Some(id) = outcome.task_id {
                            task_ids.push(id);
                        }
                        if outcome.cancelled {
                            cancelled = true;
                        }
                    }
                    Ok(Err(e)) => {
                        if e.is_cancelled() {
                            cancelled = true;
                        } else {
                            return Err(e);
                        }
                    }
                    Err(join_err) => {
                        return Err(Error::network(format!("resumable transfer batch task panicked: {join_err}")));
                    }
                }
            }
        }

        let final_checkpoint = checkpoint.lock().await.clone();
        let failed_count = final_checkpoint.failed_items.len();
        // A batch whose retry budget is exhausted is marked completed (so
        // the loop can advance past it) *and* has every one of its items
        // copied into `failed_items`. Subtract those back out so
        // `completed_items` and `failed_items` stay disjoint and sum to the
        // manifest size, per spec §4.L invariants / testable property 10.
        let completed_items: usize = final_checkpoint
            .completed_batch_indices
            .iter()
            .map(|&i| final_checkpoint.batch_items(i).len())
            .sum::<usize>()
            .saturating_sub(failed_count);

        let status = if cancelled {
            TransferOutcomeStatus::Cancelled
        } else if completed_items + failed_count < total_items {
            TransferOutcomeStatus::Failed
        } else if failed_count > 0 {
            TransferOutcomeStatus::Partial
        } else {
            TransferOutcomeStatus::Succeeded
        };

        // Collect every task id the checkpoint knows about, not just the
        // ones this invocation just submitted, so a `resume()` call
        // reports the full history too.
        let mut all_task_ids: Vec<String> = final_checkpoint.submitted_task_ids.values().cloned().collect();
        all_task_ids.sort();
        all_task_ids.dedup();
        let _ = task_ids;

        let bytes_transferred = final_checkpoint
            .item_manifest
            .iter()
            .filter(|item| {
                final_checkpoint
                    .failed_items
                    .iter()
                    .all(|f| f.item.source_path != item.source_path)
            })
            .filter_map(|item| item.size)
            .sum();

        Ok(TransferOutcome {
            checkpoint_id: final_checkpoint.checkpoint_id,
            total_items,
            bytes_transferred,
            completed_items,
            failed_items: final_checkpoint.failed_items,
            task_ids: all_task_ids,
            status,
        })
    }
}

struct BatchOutcome {
    task_id: Option<String>,
    cancelled: bool,
}

/// Submits (or rediscovers) and polls one batch to a terminal state,
/// persisting checkpoint progress at every step that §4.L calls out.
async fn process_batch<S: CheckpointStore>(
    ctx: &CallContext,
    client: &TransferClient,
    store: &S,
    checkpoint: Arc<AsyncMutex<Checkpoint>>,
    batch_index: usize,
    options: &ResumableTransferOptions,
) -> Result<BatchOutcome> {
    let items: Vec<ManifestEntry> = checkpoint.lock().await.batch_items(batch_index).to_vec();
    let (source_endpoint, destination_endpoint) = {
        let cp = checkpoint.lock().await;
        (cp.source_endpoint.clone(), cp.destination_endpoint.clone())
    };

    loop {
        // Submission ID is persisted before the create call that spends it
        // (spec §4.L invariants); on resume, a pending-but-unconfirmed ID
        // is reused so the retried create dedups server-side instead of
        // minting a second task.
        let submission_id = {
            let mut cp = checkpoint.lock().await;
            if let Some(id) = cp.pending_submission_ids.get(&batch_index) {
                id.clone()
            } else {
                drop(cp);
                let id = client.obtain_submission_id(ctx).await?;
                let mut cp = checkpoint.lock().await;
                cp.pending_submission_ids.insert(batch_index, id.clone());
                cp.touch(Utc::now());
                store.save(&cp).await?;
                id
            }
        };

        let task_id = {
            let cp = checkpoint.lock().await;
            cp.submitted_task_ids.get(&batch_index).cloned()
        };
        let task_id = match task_id {
            Some(id) => id,
            None => {
                let transfer_items: Vec<TransferItem> = items
                    .iter()
                    .map(|item| TransferItem::transfer(item.source_path.clone(), item.destination_path.clone(), false))
                    .collect();
                let mut request = TaskRequest::transfer(source_endpoint.clone(), destination_endpoint.clone(), transfer_items);
                request.submission_id = Some(submission_id.clone());
                request.sync_level = options.sync_level;
                request.flags.verify_checksum = options.verify_checksum;
                request.flags.encrypt = options.encrypt;
                debug_assert_eq!(request.kind, TaskKind::Transfer);

                let id = client.submit_transfer(ctx, request).await?;
                let mut cp = checkpoint.lock().await;
                cp.submitted_task_ids.insert(batch_index, id.clone());
                cp.touch(Utc::now());
                store.save(&cp).await?;
                id
            }
        };

        match client.wait_for_task(ctx, &task_id, options.poll_interval, None).await {
            Ok(task) if task.status == TaskStatus::Succeeded => {
                let mut cp = checkpoint.lock().await;
                cp.completed_batch_indices.insert(batch_index);
                cp.touch(Utc::now());
                store.save(&cp).await?;
                return Ok(BatchOutcome { task_id: Some(task_id), cancelled: false });
            }
            Ok(task) if task.status == TaskStatus::Cancelled => {
                let mut cp = checkpoint.lock().await;
                cp.touch(Utc::now());
                store.save(&cp).await?;
                return Ok(BatchOutcome { task_id: Some(task_id), cancelled: true });
            }
            Ok(task) => {
                // FAILED: consult the retry policy before giving up on
                // this batch's still-outstanding items (spec §4.L step 6).
                let attempt = {
                    let mut cp = checkpoint.lock().await;
                    let attempt = cp.retry_attempts.entry(batch_index).or_insert(0);
                    *attempt += 1;
                    *attempt
                };

                if attempt > options.max_item_retries {
                    let mut cp = checkpoint.lock().await;
                    for item in &items {
                        cp.failed_items.push(FailedItem {
                            item: item.clone(),
                            last_error: task.nice_status.clone().unwrap_or_else(|| "task failed".to_string()),
                        });
                    }
                    cp.completed_batch_indices.insert(batch_index);
                    cp.touch(Utc::now());
                    store.save(&cp).await?;
                    return Ok(BatchOutcome { task_id: Some(task_id), cancelled: false });
                }

                // Retries remain: clear this batch's pending submission so
                // the top of the loop mints a fresh submission ID and
                // resubmits the batch's items as a new task.
                let mut cp = checkpoint.lock().await;
                cp.pending_submission_ids.remove(&batch_index);
                cp.submitted_task_ids.remove(&batch_index);
                cp.touch(Utc::now());
                store.save(&cp).await?;
                ctx.sleep(options.retry_policy.delay(attempt)).await?;
            }
            Err(e) if e.is_cancelled() => {
                let mut cp = checkpoint.lock().await;
                cp.touch(Utc::now());
                store.save(&cp).await?;
                return Ok(BatchOutcome { task_id: Some(task_id), cancelled: true });
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::DirEntry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedLister {
        pages: HashMap<String, Vec<DirEntry>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DirectoryLister for FixedLister {
        async fn list(&self, _ctx: &CallContext, _endpoint: &str, path: &str) -> Result<Vec<DirEntry>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.pages.get(path).cloned().unwrap_or_default())
        }
    }

    fn entry(name: &str, ty: DirEntryType, size: Option<u64>) -> DirEntry {
        DirEntry { name: name.to_string(), entry_type: ty, size, link_target: None }
    }

    #[tokio::test]
    async fn manifest_expands_directories_into_leaf_entries() {
        let mut pages = HashMap::new();
        pages.insert(
            "/src".to_string(),
            vec![entry("a.txt", DirEntryType::File, Some(10)), entry("subdir", DirEntryType::Dir, None)],
        );
        pages.insert("/src/subdir".to_string(), vec![entry("b.txt", DirEntryType::File, Some(20))]);
        let lister = FixedLister { pages, calls: AtomicUsize::new(0) };

        let ctx = CallContext::new();
        let manifest = build_manifest(&ctx, &lister, "ep1", "/src", "/dst").await.unwrap();

        assert_eq!(manifest.len(), 2);
        assert!(manifest.iter().any(|m| m.source_path == "/src/a.txt" && m.destination_path == "/dst/a.txt"));
        assert!(manifest.iter().any(|m| m.source_path == "/src/subdir/b.txt" && m.destination_path == "/dst/subdir/b.txt"));
    }

    #[tokio::test]
    async fn manifest_does_not_recurse_into_symlinks() {
        let mut pages = HashMap::new();
        let mut link = entry("looksalive", DirEntryType::Dir, None);
        link.link_target = Some("/src".to_string());
        pages.insert("/src".to_string(), vec![link]);
        let lister = FixedLister { pages, calls: AtomicUsize::new(0) };

        let ctx = CallContext::new();
        let manifest = build_manifest(&ctx, &lister, "ep1", "/src", "/dst").await.unwrap();
        assert!(manifest.is_empty());
        assert_eq!(lister.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checkpoint_batches_cover_every_item_exactly_once() {
        let manifest: Vec<ManifestEntry> = (0..1000)
            .map(|i| ManifestEntry { source_path: format!("/s/{i}"), destination_path: format!("/d/{i}"), size: Some(1) })
            .collect();
        let checkpoint = Checkpoint {
            checkpoint_id: "cp-1".to_string(),
            source_endpoint: "ep1".to_string(),
            destination_endpoint: "ep2".to_string(),
            base_source_path: "/s".to_string(),
            base_destination_path: "/d".to_string(),
            item_manifest: manifest,
            batch_size: 100,
            completed_batch_indices: BTreeSet::new(),
            pending_submission_ids: HashMap::new(),
            submitted_task_ids: HashMap::new(),
            retry_attempts: HashMap::new(),
            failed_items: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(checkpoint.batch_count(), 10);
        let mut seen = std::collections::HashSet::new();
        for i in 0..checkpoint.batch_count() {
            for item in checkpoint.batch_items(i) {
                assert!(seen.insert(item.source_path.clone()), "item covered by more than one batch");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn content_address_is_stable_for_same_inputs() {
        let t = Utc::now();
        let a = content_address("ep1", "ep2", "/s", "/d", None, t);
        let b = content_address("ep1", "ep2", "/s", "/d", None, t);
        assert_eq!(a, b);
        let c = content_address("ep1", "ep2", "/s", "/d2", None, t);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn in_memory_checkpoint_store_round_trips() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = Checkpoint {
            checkpoint_id: "cp-1".to_string(),
            source_endpoint: "ep1".to_string(),
            destination_endpoint: "ep2".to_string(),
            base_source_path: "/s".to_string(),
            base_destination_path: "/d".to_string(),
            item_manifest: vec![],
            batch_size: 10,
            completed_batch_indices: BTreeSet::new(),
            pending_submission_ids: HashMap::new(),
            submitted_task_ids: HashMap::new(),
            retry_attempts: HashMap::new(),
            failed_items: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(store.load("cp-1").await.unwrap().is_none());
        store.save(&checkpoint).await.unwrap();
        assert!(store.load("cp-1").await.unwrap().is_some());
    }

    #[cfg(feature = "file-store")]
    #[tokio::test]
    async fn file_checkpoint_store_round_trips_via_fsync_then_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let checkpoint = Checkpoint {
            checkpoint_id: "cp-2".to_string(),
            source_endpoint: "ep1".to_string(),
            destination_endpoint: "ep2".to_string(),
            base_source_path: "/s".to_string(),
            base_destination_path: "/d".to_string(),
            item_manifest: vec![ManifestEntry { source_path: "/s/a".to_string(), destination_path: "/d/a".to_string(), size: Some(1) }],
            batch_size: 10,
            completed_batch_indices: BTreeSet::new(),
            pending_submission_ids: HashMap::new(),
            submitted_task_ids: HashMap::new(),
            retry_attempts: HashMap::new(),
            failed_items: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.save(&checkpoint).await.unwrap();
        let loaded = store.load("cp-2").await.unwrap().unwrap();
        assert_eq!(loaded.item_manifest.len(), 1);
        assert!(!dir.path().join("cp-2.json.tmp").exists());
    }

    /// Drives one batch all the way to `TaskStatus::Failed` with its retry
    /// budget exhausted, alongside a sibling batch that succeeds, and
    /// checks the exact property the first finding broke: `completed_items`
    /// and `failed_items` are disjoint and sum to `total_items` (spec §4.L
    /// invariants, testable property 10, scenario S5).
    #[tokio::test]
    async fn failed_batch_does_not_double_count_into_completed_items() {
        use crate::rate_limit::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
        use crate::services::ServiceName;
        use crate::transport::TransportBuilder;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/submission_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": "sub-fixed"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transfer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"task_id": "t-ok"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/transfer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"task_id": "t-bad"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task/t-ok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "task_id": "t-ok",
                "status": "SUCCEEDED",
                "bytes_transferred": 2,
                "bytes_expected": 2,
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/task/t-bad"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "task_id": "t-bad",
                "status": "FAILED",
                "bytes_transferred": 0,
                "bytes_expected": 2,
                "nice_status": "endpoint unreachable",
            })))
            .mount(&server)
            .await;

        let transport = TransportBuilder::new(ServiceName::Transfer, server.uri(), Arc::new(reqwest::Client::new()))
            .rate_limiter(Arc::new(RateLimiter::new(RateLimiterConfig {
                requests_per_second: 1000.0,
                burst: 1000.0,
                adaptive: true,
            })))
            .circuit_breaker(Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default())))
            .check_api_version(false)
            .build();
        let client = Arc::new(TransferClient::new(Arc::new(transport)));

        let checkpoint = Checkpoint {
            checkpoint_id: "cp-failed-batch".to_string(),
            source_endpoint: "ep1".to_string(),
            destination_endpoint: "ep2".to_string(),
            base_source_path: "/s".to_string(),
            base_destination_path: "/d".to_string(),
            item_manifest: (0..4)
                .map(|i| ManifestEntry { source_path: format!("/s/{i}"), destination_path: format!("/d/{i}"), size: Some(1) })
                .collect(),
            batch_size: 2,
            completed_batch_indices: BTreeSet::new(),
            pending_submission_ids: HashMap::new(),
            submitted_task_ids: HashMap::new(),
            retry_attempts: HashMap::new(),
            failed_items: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let store = Arc::new(InMemoryCheckpointStore::new());
        store.save(&checkpoint).await.unwrap();

        let options = ResumableTransferOptions {
            batch_size: 2,
            max_concurrent_tasks: 4,
            verify_checksum: false,
            encrypt: false,
            sync_level: None,
            retry_policy: BackoffStrategy::default(),
            max_item_retries: 0,
            poll_interval: Duration::from_millis(1),
        };
        let engine = ResumableTransfer::new(client, store, options);
        let ctx = CallContext::new();
        let outcome = engine.resume(&ctx, "cp-failed-batch").await.unwrap();

        assert_eq!(outcome.total_items, 4);
        assert_eq!(outcome.completed_items + outcome.failed_items.len(), outcome.total_items);
        assert!(outcome.completed_items <= 2, "completed_items must not absorb the failed batch's items");
        assert_eq!(outcome.failed_items.len(), 2);
        assert_eq!(outcome.status, TransferOutcomeStatus::Partial);
    }
}
