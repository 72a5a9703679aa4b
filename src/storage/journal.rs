use super::memory::{StorageIndex, take_fault};
use super::{AppendError, EventLog, EventSink, Record, RecordStore, ViewBatch, ViewStore};
use crate::core::{Offset, PartitionId, ProcessorError, QName, RecordId, Result, WorkspaceId};
use crate::event::{CommittedEvent, RawEvent};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{Level, event};

const JOURNAL_FILE_PREFIX: &str = "plog-";
const JOURNAL_FILE_SUFFIX: &str = ".jsonl";

/// When appended journal lines reach the disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JournalDurability {
    /// Every append is synced before it is acknowledged.
    Strict,
    /// Appends are flushed immediately and synced at most every `sync_interval_ms`.
    Eventual { sync_interval_ms: u64 },
}

impl Default for JournalDurability {
    fn default() -> Self {
        Self::Strict
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalOptions {
    #[serde(default)]
    pub durability: JournalDurability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEntry {
    Event(RawEvent),
    Views(ViewBatch),
}

/// One line of a partition journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    seq: u64,
    ts_unix_ms: i64,
    entry: JournalEntry,
}

struct JournalWriter {
    seq_next: u64,
    last_sync_unix_ms: HashMap<PartitionId, i64>,
    /// Set when a failed write could not be truncated away.
    poisoned: Option<String>,
    sync_faults: usize,
}

/// File-backed storage keeping one JSON-lines journal per partition.
///
/// The journal holds both events and view batches; reopening replays every
/// journal to rebuild the logs, records, views and projector offsets.
pub struct JournalStorage {
    root_dir: PathBuf,
    options: JournalOptions,
    index: RwLock<StorageIndex>,
    writer: Mutex<JournalWriter>,
}

impl JournalStorage {
    pub async fn open(root_dir: impl AsRef<Path>, options: JournalOptions) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        let mut partitions = Vec::new();
        let mut entries = fs::read_dir(&root_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(partition) = name.to_str().and_then(partition_of_file) {
                partitions.push(partition);
            }
        }
        partitions.sort_unstable();

        let mut index = StorageIndex::default();
        let mut max_seq = 0u64;
        for partition in partitions {
            let path = journal_path_in(&root_dir, partition);
            for record in read_journal_records(&path).await? {
                max_seq = max_seq.max(record.seq);
                match record.entry {
                    JournalEntry::Event(event) => {
                        index.check_append(&event).map_err(|err| {
                            ProcessorError::Storage(format!(
                                "replay {} at seq {}: {}",
                                path.display(),
                                record.seq,
                                err
                            ))
                        })?;
                        index.apply_event(CommittedEvent::new(event));
                    }
                    JournalEntry::Views(batch) => index.apply_views(batch),
                }
            }
            event!(
                Level::DEBUG,
                partition,
                path = %path.display(),
                "partition journal loaded"
            );
        }

        Ok(Self {
            root_dir,
            options,
            index: RwLock::new(index),
            writer: Mutex::new(JournalWriter {
                seq_next: max_seq.saturating_add(1),
                last_sync_unix_ms: HashMap::new(),
                poisoned: None,
                sync_faults: 0,
            }),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn journal_path(&self, partition: PartitionId) -> PathBuf {
        journal_path_in(&self.root_dir, partition)
    }

    /// Partitions that have at least one event.
    pub fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(self.index.read()?.partitions())
    }

    /// The next `count` journal syncs fail after the line was written.
    pub async fn fail_next_syncs(&self, count: usize) {
        self.writer.lock().await.sync_faults = count;
    }

    async fn append_record(
        &self,
        writer: &mut JournalWriter,
        partition: PartitionId,
        entry: JournalEntry,
    ) -> Result<()> {
        if let Some(reason) = &writer.poisoned {
            return Err(ProcessorError::Storage(format!(
                "journal is unusable after a failed rollback: {}",
                reason
            )));
        }

        let now_ms = Utc::now().timestamp_millis();
        let record = JournalRecord {
            seq: writer.seq_next,
            ts_unix_ms: now_ms,
            entry,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|err| ProcessorError::Storage(format!("serialize journal record: {}", err)))?;
        line.push('\n');

        let path = self.journal_path(partition);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let len_before = file.metadata().await?.len();

        if let Err(err) = self
            .write_line(writer, &mut file, partition, line.as_bytes(), now_ms)
            .await
        {
            if let Err(rollback) = file.set_len(len_before).await {
                event!(
                    Level::ERROR,
                    partition,
                    path = %path.display(),
                    error = %rollback,
                    "journal rollback failed, refusing further appends"
                );
                writer.poisoned = Some(format!("{}: {}", path.display(), rollback));
            }
            return Err(err);
        }

        writer.seq_next = writer.seq_next.saturating_add(1);
        Ok(())
    }

    async fn write_line(
        &self,
        writer: &mut JournalWriter,
        file: &mut File,
        partition: PartitionId,
        line: &[u8],
        now_ms: i64,
    ) -> Result<()> {
        file.write_all(line).await?;
        file.flush().await?;

        let last_sync = writer.last_sync_unix_ms.get(&partition).copied().unwrap_or(0);
        let due = match self.options.durability {
            JournalDurability::Strict => true,
            JournalDurability::Eventual { sync_interval_ms } => {
                now_ms - last_sync >= sync_interval_ms as i64
            }
        };
        if due {
            if take_fault(&mut writer.sync_faults) {
                return Err(ProcessorError::Io("injected journal sync failure".to_string()));
            }
            file.sync_data().await?;
            writer.last_sync_unix_ms.insert(partition, now_ms);
        }
        Ok(())
    }
}

fn journal_path_in(root_dir: &Path, partition: PartitionId) -> PathBuf {
    root_dir.join(format!(
        "{}{}{}",
        JOURNAL_FILE_PREFIX, partition, JOURNAL_FILE_SUFFIX
    ))
}

fn partition_of_file(name: &str) -> Option<PartitionId> {
    name.strip_prefix(JOURNAL_FILE_PREFIX)?
        .strip_suffix(JOURNAL_FILE_SUFFIX)?
        .parse()
        .ok()
}

async fn read_journal_records(path: &Path) -> Result<Vec<JournalRecord>> {
    let file = OpenOptions::new().read(true).open(path).await?;

    let mut records = Vec::new();
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<JournalRecord>(&line).map_err(|err| {
            ProcessorError::Storage(format!(
                "parse journal record in {}: {}",
                path.display(),
                err
            ))
        })?;
        records.push(record);
    }

    records.sort_by(|a, b| a.seq.cmp(&b.seq));
    Ok(records)
}

#[async_trait]
impl EventLog for JournalStorage {
    async fn append(&self, event: RawEvent) -> std::result::Result<CommittedEvent, AppendError> {
        let mut writer = self.writer.lock().await;
        self.index
            .read()
            .map_err(|err| AppendError::Fatal(err.to_string()))?
            .check_append(&event)?;

        let partition = event.partition;
        self.append_record(&mut writer, partition, JournalEntry::Event(event.clone()))
            .await
            .map_err(|err| AppendError::Fatal(err.to_string()))?;

        let committed = CommittedEvent::new(event);
        self.index
            .write()
            .map_err(|err| AppendError::Fatal(err.to_string()))?
            .apply_event(committed.clone());
        Ok(committed)
    }

    async fn read_plog(
        &self,
        partition: PartitionId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()> {
        let events = self.index.read()?.plog_range(partition, from, to);
        for event in events {
            sink(event)?;
        }
        Ok(())
    }

    async fn read_wlog(
        &self,
        workspace: WorkspaceId,
        from: Offset,
        to: Option<Offset>,
        sink: &mut EventSink<'_>,
    ) -> Result<()> {
        let events = self.index.read()?.wlog_range(workspace, from, to);
        for event in events {
            sink(event)?;
        }
        Ok(())
    }
}

impl RecordStore for JournalStorage {
    fn get_record(&self, workspace: WorkspaceId, id: RecordId) -> Result<Option<Record>> {
        Ok(self.index.read()?.record(workspace, id))
    }
}

#[async_trait]
impl ViewStore for JournalStorage {
    fn get_view(
        &self,
        workspace: WorkspaceId,
        view: &QName,
        key: &str,
    ) -> Result<Option<JsonValue>> {
        Ok(self.index.read()?.view(workspace, view, key))
    }

    fn projector_offset(&self, partition: PartitionId, projector: &QName) -> Result<Offset> {
        Ok(self.index.read()?.projector_offset(partition, projector))
    }

    async fn apply_view_batch(&self, batch: ViewBatch) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let partition = batch.partition;
        self.append_record(&mut writer, partition, JournalEntry::Views(batch.clone()))
            .await?;
        self.index.write()?.apply_views(batch);
        Ok(())
    }
}
