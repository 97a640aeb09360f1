//! Audit sinks
//!
//! The audit trail is append-only. Each record carries the hash of the one
//! before it, so a truncated or edited log is detected by [`verify_chain`].

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use council_types::AuditEvent;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const HASH_DOMAIN: &[u8] = b"council-audit-v1:";

/// One sealed line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: AuditEvent,
    #[serde(default)]
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl AuditRecord {
    /// Seal `event` onto a chain whose head is `previous_hash`
    pub fn seal(event: AuditEvent, previous_hash: Option<String>) -> StoreResult<Self> {
        let entry_hash = compute_hash(&event, previous_hash.as_deref())?;
        Ok(Self {
            event,
            previous_hash,
            entry_hash,
        })
    }
}

fn compute_hash(event: &AuditEvent, previous_hash: Option<&str>) -> StoreResult<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(HASH_DOMAIN);
    hasher.update(previous_hash.unwrap_or("").as_bytes());
    hasher.update(b":");
    hasher.update(&serde_json::to_vec(event)?);
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Head of the hash chain
#[derive(Debug, Default)]
struct ChainHead {
    last_hash: Option<String>,
    entry_count: u64,
}

impl ChainHead {
    fn advance(&mut self, record: &AuditRecord) {
        self.last_hash = Some(record.entry_hash.clone());
        self.entry_count += 1;
    }
}

/// Result of checking a sequence of records
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub total_entries: usize,
    pub verified_entries: usize,
    pub first_invalid_index: Option<usize>,
    pub error_message: Option<String>,
}

/// Recompute every hash and check every link
pub fn verify_chain(records: &[AuditRecord]) -> StoreResult<ChainVerification> {
    let mut result = ChainVerification {
        valid: true,
        total_entries: records.len(),
        verified_entries: 0,
        first_invalid_index: None,
        error_message: None,
    };

    let mut expected_prev: Option<&str> = None;
    for (i, record) in records.iter().enumerate() {
        let broken = if record.previous_hash.as_deref() != expected_prev {
            Some(format!(
                "record {} links to {:?}, expected {:?}",
                i, record.previous_hash, expected_prev
            ))
        } else if compute_hash(&record.event, expected_prev)? != record.entry_hash {
            Some(format!(
                "record {} ({} #{}) has an invalid hash",
                i,
                record.event.kind.name(),
                record.event.sequence
            ))
        } else {
            None
        };

        if let Some(message) = broken {
            result.valid = false;
            result.first_invalid_index = Some(i);
            result.error_message = Some(message);
            return Ok(result);
        }
        expected_prev = Some(record.entry_hash.as_str());
        result.verified_entries = i + 1;
    }
    Ok(result)
}

/// Append-only destination for audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Seal and store one event
    async fn append(&self, event: &AuditEvent) -> StoreResult<AuditRecord>;

    async fn flush(&self) -> StoreResult<()>;

    async fn entry_count(&self) -> StoreResult<u64>;

    /// Every record, oldest first
    async fn read_all(&self) -> StoreResult<Vec<AuditRecord>>;
}

/// In-memory audit sink for tests and single-run use
#[derive(Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
    head: RwLock<ChainHead>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    /// Events only, oldest first
    pub fn events(&self) -> Vec<AuditEvent> {
        self.records.read().iter().map(|r| r.event.clone()).collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> StoreResult<AuditRecord> {
        let mut head = self.head.write();
        let record = AuditRecord::seal(event.clone(), head.last_hash.clone())?;
        head.advance(&record);
        self.records.write().push(record.clone());
        tracing::trace!(
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "Audit event appended"
        );
        Ok(record)
    }

    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn entry_count(&self) -> StoreResult<u64> {
        Ok(self.head.read().entry_count)
    }

    async fn read_all(&self) -> StoreResult<Vec<AuditRecord>> {
        Ok(self.records())
    }
}

/// JSON-lines audit file; reopening continues the existing chain
pub struct FileAuditSink {
    path: PathBuf,
    head: RwLock<ChainHead>,
}

impl FileAuditSink {
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let head = if tokio::fs::try_exists(&path).await? {
            let records = read_records(&path).await?;
            ChainHead {
                last_hash: records.last().map(|r| r.entry_hash.clone()),
                entry_count: records.len() as u64,
            }
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            ChainHead::default()
        };
        tracing::debug!(path = %path.display(), entries = head.entry_count, "Audit file opened");
        Ok(Self {
            path,
            head: RwLock::new(head),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every record of an audit file
pub async fn read_records(path: &Path) -> StoreResult<Vec<AuditRecord>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn append(&self, event: &AuditEvent) -> StoreResult<AuditRecord> {
        // Seal under the lock, write after releasing it
        let (record, line) = {
            let mut head = self.head.write();
            let record = AuditRecord::seal(event.clone(), head.last_hash.clone())?;
            let line = serde_json::to_string(&record)?;
            head.advance(&record);
            (record, line)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        tracing::trace!(
            workflow_id = %event.workflow_id,
            sequence = event.sequence,
            kind = event.kind.name(),
            "Audit event appended"
        );
        Ok(record)
    }

    async fn flush(&self) -> StoreResult<()> {
        // Every append is flushed
        Ok(())
    }

    async fn entry_count(&self) -> StoreResult<u64> {
        Ok(self.head.read().entry_count)
    }

    async fn read_all(&self) -> StoreResult<Vec<AuditRecord>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }
        read_records(&self.path).await
    }
}

/// Fail with [`StoreError::Integrity`] unless the chain verifies
pub fn ensure_intact(records: &[AuditRecord]) -> StoreResult<()> {
    let check = verify_chain(records)?;
    if check.valid {
        Ok(())
    } else {
        Err(StoreError::Integrity(
            check.error_message.unwrap_or_else(|| "unknown".into()),
        ))
    }
}
