//! Append-only checkpoint stores.
//!
//! [`JsonlCheckpointStore`] keeps one JSON record per line. Each append is a
//! single `write_all` of the full line followed by `sync_data`, so a crash
//! can at worst leave one torn trailing line; that line is discarded (and
//! the file truncated back to the last complete record) when the log is
//! reopened. A write that fails while the store is open is cut back to the
//! last committed record before the error is returned, and any stray bytes
//! past that point are cut before the next append. If the cut itself fails
//! the store refuses further appends. Task ids are indexed in memory for
//! O(1) `has` lookups.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::record::CheckpointRecord;
use crate::error::CheckpointError;

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was persisted.
    Written,
    /// A record for the same task id already exists; nothing was written.
    AlreadyPresent,
}

/// Durable, append-only record of finished tasks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Whether a record exists for `task_id`.
    async fn has(&self, task_id: &str) -> bool;

    /// Persists `record` unless its task id is already present.
    ///
    /// Returns only after the record is durable.
    async fn append(&self, record: CheckpointRecord) -> Result<AppendOutcome, CheckpointError>;

    /// Every record, in append order.
    async fn all(&self) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    /// Number of records.
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Records recovered from a log, plus how much of it was valid.
#[derive(Debug, Default)]
struct Replay {
    records: Vec<CheckpointRecord>,
    /// Byte length of the prefix made of complete records.
    valid_len: u64,
    /// Whether bytes after `valid_len` were discarded.
    torn_tail: bool,
}

/// Parses a JSONL checkpoint log.
///
/// A final line that is unterminated or unparsable is treated as a torn
/// write. An unparsable line anywhere else is corruption.
fn replay_log(contents: &[u8]) -> Result<Replay, CheckpointError> {
    let mut replay = Replay::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < contents.len() {
        line_no += 1;
        let rest = &contents[offset..];

        let Some(end) = rest.iter().position(|b| *b == b'\n') else {
            replay.torn_tail = true;
            break;
        };

        let line = &rest[..end];
        let next = offset + end + 1;

        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<CheckpointRecord>(line) {
                Ok(record) => replay.records.push(record),
                Err(_) if next >= contents.len() => {
                    replay.torn_tail = true;
                    break;
                }
                Err(e) => {
                    return Err(CheckpointError::Corrupt {
                        line: line_no,
                        message: e.to_string(),
                    })
                }
            }
        }

        offset = next;
    }

    replay.valid_len = offset as u64;
    Ok(replay)
}

async fn read_log(path: &Path) -> Result<Vec<u8>, CheckpointError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

struct Inner {
    file: File,
    ids: HashSet<String>,
    /// Byte length of the log up to the end of the last durable record.
    committed: u64,
    /// Set when a failed write could not be rolled back.
    poisoned: bool,
}

impl Inner {
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line).await?;
        self.file.flush().await?;
        self.file.sync_data().await
    }

    /// Cuts the log back to the last committed record.
    async fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.committed).await?;
        self.file.sync_data().await
    }
}

/// JSON Lines checkpoint log on the local filesystem.
pub struct JsonlCheckpointStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonlCheckpointStore {
    /// Opens (or creates) the log at `path`, replaying existing records.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
            }
        }

        let contents = read_log(&path).await?;
        let replay = replay_log(&contents)?;

        if replay.torn_tail {
            warn!(
                path = %path.display(),
                discarded_bytes = contents.len() as u64 - replay.valid_len,
                "Discarding torn trailing checkpoint record"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(replay.valid_len).await?;
            file.sync_all().await?;
        }

        let mut ids = HashSet::with_capacity(replay.records.len());
        for record in replay.records {
            if !ids.insert(record.task_id.clone()) {
                warn!(task_id = %record.task_id, "Duplicate checkpoint record ignored");
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        let committed = file.metadata().await?.len();

        info!(path = %path.display(), records = ids.len(), "Opened checkpoint log");

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                ids,
                committed,
                poisoned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all records from the log at `path` without opening it for
    /// writing. A missing file yields no records; a torn tail is skipped.
    pub async fn read_records(path: impl AsRef<Path>) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let contents = read_log(path.as_ref()).await?;
        Ok(replay_log(&contents)?.records)
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn has(&self, task_id: &str) -> bool {
        self.inner.lock().await.ids.contains(task_id)
    }

    async fn append(&self, record: CheckpointRecord) -> Result<AppendOutcome, CheckpointError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut inner = self.inner.lock().await;
        if inner.poisoned {
            return Err(CheckpointError::Unwritable(self.path.display().to_string()));
        }
        if inner.ids.contains(&record.task_id) {
            debug!(task_id = %record.task_id, "Checkpoint already present, skipping");
            return Ok(AppendOutcome::AlreadyPresent);
        }

        let on_disk = inner.file.metadata().await?.len();
        if on_disk > inner.committed {
            warn!(
                path = %self.path.display(),
                discarded_bytes = on_disk - inner.committed,
                "Discarding uncommitted bytes at end of checkpoint log"
            );
            if let Err(e) = inner.rollback().await {
                inner.poisoned = true;
                return Err(e.into());
            }
        }

        if let Err(e) = inner.write_line(&line).await {
            match inner.rollback().await {
                Ok(()) => warn!(
                    task_id = %record.task_id,
                    error = %e,
                    "Checkpoint write failed; log cut back to last record"
                ),
                Err(rollback) => {
                    error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "Could not roll back failed checkpoint write"
                    );
                    inner.poisoned = true;
                }
            }
            return Err(e.into());
        }
        inner.committed += line.len() as u64;
        inner.ids.insert(record.task_id);

        Ok(AppendOutcome::Written)
    }

    async fn all(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        // Hold the lock so no append interleaves with the read.
        let _guard = self.inner.lock().await;
        let contents = read_log(&self.path).await?;
        Ok(replay_log(&contents)?.records)
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.ids.len()
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    records: Mutex<(Vec<CheckpointRecord>, BTreeMap<String, usize>)>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn has(&self, task_id: &str) -> bool {
        self.records.lock().await.1.contains_key(task_id)
    }

    async fn append(&self, record: CheckpointRecord) -> Result<AppendOutcome, CheckpointError> {
        let mut guard = self.records.lock().await;
        let (records, index) = &mut *guard;
        if index.contains_key(&record.task_id) {
            return Ok(AppendOutcome::AlreadyPresent);
        }
        index.insert(record.task_id.clone(), records.len());
        records.push(record);
        Ok(AppendOutcome::Written)
    }

    async fn all(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        Ok(self.records.lock().await.0.clone())
    }

    async fn len(&self) -> usize {
        self.records.lock().await.0.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Task;
    use crate::trajectory::{Trajectory, TrajectoryStatus};
    use std::io::Write;
    use tempfile::TempDir;

    fn record(position: usize, status: TrajectoryStatus) -> CheckpointRecord {
        let task = Task::new(position, format!("prompt {}", position));
        let mut trajectory = Trajectory::new(&task.id, "unweighted", "m");
        trajectory.status = status;
        CheckpointRecord::from_trajectory(&task, trajectory).expect("terminal")
    }

    #[tokio::test]
    async fn test_append_and_has() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonlCheckpointStore::open(dir.path().join("run.jsonl"))
            .await
            .expect("open");

        let r = record(0, TrajectoryStatus::Completed);
        assert!(!store.has(&r.task_id).await);
        assert_eq!(store.append(r.clone()).await.expect("append"), AppendOutcome::Written);
        assert!(store.has(&r.task_id).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonlCheckpointStore::open(dir.path().join("run.jsonl"))
            .await
            .expect("open");

        let r = record(0, TrajectoryStatus::Failed);
        store.append(r.clone()).await.expect("append");
        assert_eq!(
            store.append(r.clone()).await.expect("append"),
            AppendOutcome::AlreadyPresent
        );

        let all = store.all().await.expect("all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_replays_records() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("run.jsonl");

        {
            let store = JsonlCheckpointStore::open(&path).await.expect("open");
            store.append(record(0, TrajectoryStatus::Completed)).await.expect("append");
            store.append(record(1, TrajectoryStatus::Truncated)).await.expect("append");
        }

        let store = JsonlCheckpointStore::open(&path).await.expect("reopen");
        assert_eq!(store.len().await, 2);
        assert!(store.has(&record(1, TrajectoryStatus::Truncated).task_id).await);

        let all = store.all().await.expect("all");
        assert_eq!(all[0].status, TrajectoryStatus::Completed);
        assert_eq!(all[1].status, TrajectoryStatus::Truncated);
    }

    #[tokio::test]
    async fn test_torn_tail_is_discarded() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run.jsonl");

        {
            let store = JsonlCheckpointStore::open(&path).await.expect("open");
            store.append(record(0, TrajectoryStatus::Completed)).await.expect("append");
        }
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for append");
            file.write_all(b"{\"task_id\":\"task-torn\",\"sta").expect("write");
        }

        let store = JsonlCheckpointStore::open(&path).await.expect("reopen");
        assert_eq!(store.len().await, 1);

        store.append(record(1, TrajectoryStatus::Completed)).await.expect("append");
        let records = JsonlCheckpointStore::read_records(&path).await.expect("read");
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let store = JsonlCheckpointStore::open(&path).await.expect("open");
        store.append(record(0, TrajectoryStatus::Completed)).await.expect("append");

        // A write that dies partway leaves part of a line behind.
        {
            let mut inner = store.inner.lock().await;
            inner.file.write_all(b"{\"task_id\":\"x\",\"sta").await.expect("write");
            inner.file.flush().await.expect("flush");
            inner.rollback().await.expect("rollback");
        }
        let len = std::fs::metadata(&path).expect("metadata").len();
        assert_eq!(len, store.inner.lock().await.committed);

        let r1 = record(1, TrajectoryStatus::Completed);
        assert_eq!(store.append(r1.clone()).await.expect("append"), AppendOutcome::Written);
        drop(store);

        let reopened = JsonlCheckpointStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.len().await, 2);
        assert!(reopened.has(&r1.task_id).await);
    }

    #[tokio::test]
    async fn test_stray_bytes_do_not_swallow_next_record() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let store = JsonlCheckpointStore::open(&path).await.expect("open");
        store.append(record(0, TrajectoryStatus::Completed)).await.expect("append");

        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .expect("open for append");
            file.write_all(b"{\"task_id\":\"x\",\"sta").expect("write");
        }

        let r1 = record(1, TrajectoryStatus::Completed);
        let r2 = record(2, TrajectoryStatus::Failed);
        assert_eq!(store.append(r1.clone()).await.expect("append"), AppendOutcome::Written);
        assert_eq!(store.append(r2.clone()).await.expect("append"), AppendOutcome::Written);
        drop(store);

        let reopened = JsonlCheckpointStore::open(&path).await.expect("reopen");
        assert_eq!(reopened.len().await, 3);
        assert!(reopened.has(&r1.task_id).await);
        assert!(reopened.has(&r2.task_id).await);
    }

    #[tokio::test]
    async fn test_poisoned_store_refuses_appends() {
        let dir = TempDir::new().expect("tempdir");
        let store = JsonlCheckpointStore::open(dir.path().join("run.jsonl"))
            .await
            .expect("open");
        store.inner.lock().await.poisoned = true;

        let err = store
            .append(record(0, TrajectoryStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Unwritable(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("run.jsonl");

        let good = serde_json::to_string(&record(0, TrajectoryStatus::Completed)).expect("json");
        std::fs::write(&path, format!("not json\n{}\n", good)).expect("write");

        let err = JsonlCheckpointStore::open(&path).await.err().expect("should fail");
        assert!(matches!(err, CheckpointError::Corrupt { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_read_records_missing_file() {
        let records = JsonlCheckpointStore::read_records("/nonexistent/run.jsonl")
            .await
            .expect("missing file is empty");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCheckpointStore::new();
        let r = record(5, TrajectoryStatus::Completed);
        assert!(store.is_empty().await);
        assert_eq!(store.append(r.clone()).await.expect("append"), AppendOutcome::Written);
        assert_eq!(store.append(r.clone()).await.expect("append"), AppendOutcome::AlreadyPresent);
        assert!(store.has(&r.task_id).await);
        assert_eq!(store.all().await.expect("all").len(), 1);
    }
}
