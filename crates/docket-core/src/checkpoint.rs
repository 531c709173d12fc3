//! Append-only checkpoint log for resumable runs.
//!
//! Every finished unit appends one CSV line
//! (`unit_id,status,error_message,metadata,recorded_at`). Loading folds the
//! log so the latest line for a unit wins. The log stays readable after an
//! abrupt stop: a trailing line without its newline is ignored, and lines
//! that fail to parse are skipped with a warning.
//!
//! One process may write a given log at a time. Within a process, appends
//! are serialized by the store's mutex.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::unit::Metadata;

/// Column layout of the persisted log.
pub const HEADER: [&str; 5] = [
    "unit_id",
    "status",
    "error_message",
    "metadata",
    "recorded_at",
];

/// Outcome recorded for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Written only by an explicit reset; makes the unit eligible again.
    Pending,
    Success,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Success => "success",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Success | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(UnitStatus::Pending),
            "success" => Ok(UnitStatus::Success),
            "failed" => Ok(UnitStatus::Failed),
            _ => Err(format!("Unknown unit status: {}", s)),
        }
    }
}

/// The authoritative state of one unit after folding the log.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub unit_id: String,
    pub status: UnitStatus,
    pub error_message: Option<String>,
    pub metadata: Metadata,
    pub recorded_at: DateTime<Utc>,
}

/// Per-status totals over the folded log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a CheckpointRecord>) -> Self {
        let mut counts = Self::default();
        for record in records {
            match record.status {
                UnitStatus::Pending => counts.pending += 1,
                UnitStatus::Success => counts.success += 1,
                UnitStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// One line of the log as written to disk.
#[derive(Debug, Serialize, Deserialize)]
struct LogRow {
    unit_id: String,
    status: UnitStatus,
    error_message: String,
    metadata: String,
    recorded_at: String,
}

impl LogRow {
    fn from_record(record: &CheckpointRecord) -> Result<Self, IngestError> {
        let metadata = if record.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&record.metadata)?
        };
        Ok(Self {
            unit_id: record.unit_id.clone(),
            status: record.status,
            error_message: record.error_message.clone().unwrap_or_default(),
            metadata,
            recorded_at: record.recorded_at.to_rfc3339(),
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, String> {
        if self.unit_id.is_empty() {
            return Err("empty unit_id".into());
        }
        let metadata = if self.metadata.is_empty() {
            Metadata::new()
        } else {
            serde_json::from_str(&self.metadata).map_err(|e| format!("bad metadata: {e}"))?
        };
        let recorded_at = DateTime::parse_from_rfc3339(&self.recorded_at)
            .map_err(|e| format!("bad recorded_at: {e}"))?
            .with_timezone(&Utc);
        Ok(CheckpointRecord {
            unit_id: self.unit_id,
            status: self.status,
            error_message: (!self.error_message.is_empty()).then_some(self.error_message),
            metadata,
            recorded_at,
        })
    }
}

/// What [`parse_log`] had to discard.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ParseReport {
    skipped_lines: usize,
    /// Byte length of the newline-terminated prefix of the log.
    complete_len: usize,
    torn_tail: bool,
}

/// Fold raw log bytes into `unit_id → record`, latest line winning.
fn parse_log(
    data: &[u8],
    origin: &Path,
) -> Result<(HashMap<String, CheckpointRecord>, ParseReport), IngestError> {
    let complete_len = data
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |i| i + 1);
    let mut report = ParseReport {
        skipped_lines: 0,
        complete_len,
        torn_tail: complete_len < data.len(),
    };
    if report.torn_tail {
        tracing::warn!(
            path = %origin.display(),
            bytes = data.len() - complete_len,
            "Ignoring partial trailing checkpoint line"
        );
    }

    let mut records = HashMap::new();
    if complete_len == 0 {
        return Ok((records, report));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(&data[..complete_len]);

    let headers = reader
        .headers()
        .map_err(|e| {
            IngestError::StoreCorrupt(format!("{}: unreadable header: {e}", origin.display()))
        })?
        .clone();
    if !headers.iter().eq(HEADER.iter().copied()) {
        return Err(IngestError::StoreCorrupt(format!(
            "{}: unexpected header {:?}",
            origin.display(),
            headers.iter().collect::<Vec<_>>()
        )));
    }

    for result in reader.records() {
        let parsed = result
            .map_err(|e| e.to_string())
            .and_then(|row| {
                row.deserialize::<LogRow>(Some(&headers))
                    .map_err(|e| e.to_string())
                    .map(|r| (row.position().map(|p| p.line()), r))
            })
            .and_then(|(line, row)| row.into_record().map(|r| (line, r)));

        match parsed {
            Ok((_, record)) => {
                records.insert(record.unit_id.clone(), record);
            }
            Err(error) => {
                report.skipped_lines += 1;
                tracing::warn!(
                    path = %origin.display(),
                    %error,
                    "Skipping unreadable checkpoint line"
                );
            }
        }
    }

    Ok((records, report))
}

/// Collapse a message onto one line so every record stays one log line.
fn single_line(message: &str) -> String {
    message
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

struct StoreInner {
    file: File,
    records: HashMap<String, CheckpointRecord>,
}

/// Durable, process-wide record of unit outcomes.
///
/// Cloning is cheap and every clone appends to the same file.
#[derive(Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    inner: Arc<Mutex<StoreInner>>,
}

impl CheckpointStore {
    /// Read a checkpoint log without opening it for writing.
    ///
    /// A missing file is an empty store.
    pub fn load(path: &Path) -> Result<HashMap<String, CheckpointRecord>, IngestError> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(IngestError::StoreCorrupt(format!(
                    "cannot read {}: {e}",
                    path.display()
                )));
            }
        };
        parse_log(&data, path).map(|(records, _)| records)
    }

    /// Open (creating if needed) the log at `path` and load it into memory.
    ///
    /// A torn trailing line left by a crash is cut off so later appends start
    /// on a fresh line.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let corrupt = |what: &str, e: std::io::Error| {
            IngestError::StoreCorrupt(format!("{what} {}: {e}", path.display()))
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| corrupt("cannot create directory for", e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| corrupt("cannot open", e))?;
        let data = fs::read(&path).map_err(|e| corrupt("cannot read", e))?;
        let (records, report) = parse_log(&data, &path)?;

        if report.torn_tail {
            file.set_len(report.complete_len as u64)
                .map_err(|e| corrupt("cannot truncate torn line in", e))?;
        }
        if report.complete_len == 0 {
            let mut header = HEADER.join(",");
            header.push('\n');
            file.write_all(header.as_bytes())
                .and_then(|()| file.sync_data())
                .map_err(|e| corrupt("cannot write header to", e))?;
        }

        tracing::info!(
            path = %path.display(),
            units = records.len(),
            skipped_lines = report.skipped_lines,
            "Checkpoint store opened"
        );

        Ok(Self {
            path,
            inner: Arc::new(Mutex::new(StoreInner { file, records })),
        })
    }

    /// Move the log at `path` aside so the next [`open`](Self::open) starts
    /// empty. Returns the backup path, or `None` if there was no log.
    pub fn reset_all(path: &Path) -> Result<Option<PathBuf>, IngestError> {
        if !path.exists() {
            return Ok(None);
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "checkpoint.csv".to_string());
        let backup = path.with_file_name(format!(
            "{file_name}.{}.bak",
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        fs::rename(path, &backup).map_err(|e| {
            IngestError::StoreCorrupt(format!("cannot move {} aside: {e}", path.display()))
        })?;
        tracing::info!(
            path = %path.display(),
            backup = %backup.display(),
            "Checkpoint store reset"
        );
        Ok(Some(backup))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(path = %self.path.display(), "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// True iff the latest status for `unit_id` is `success` or `failed`.
    pub fn is_done(&self, unit_id: &str) -> bool {
        self.status_of(unit_id).is_some_and(|s| s.is_terminal())
    }

    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.lock_inner().records.get(unit_id).map(|r| r.status)
    }

    pub fn get(&self, unit_id: &str) -> Option<CheckpointRecord> {
        self.lock_inner().records.get(unit_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_inner().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::tally(self.lock_inner().records.values())
    }

    /// Units whose latest status is `failed`, ordered by id.
    pub fn failed_records(&self) -> Vec<CheckpointRecord> {
        let inner = self.lock_inner();
        let mut failed: Vec<_> = inner
            .records
            .values()
            .filter(|r| r.status == UnitStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));
        failed
    }

    /// Append an outcome and sync it to disk before returning.
    ///
    /// Blocks on file I/O; async callers should run it on the blocking pool.
    pub fn record(
        &self,
        unit_id: &str,
        status: UnitStatus,
        error_message: Option<&str>,
        metadata: Metadata,
    ) -> Result<CheckpointRecord, IngestError> {
        let record = CheckpointRecord {
            unit_id: unit_id.to_string(),
            status,
            error_message: error_message.map(single_line).filter(|m| !m.is_empty()),
            metadata,
            recorded_at: Utc::now(),
        };

        let mut line = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        line.serialize(LogRow::from_record(&record)?)
            .map_err(|e| IngestError::StoreCorrupt(format!("cannot encode record: {e}")))?;
        let line = line
            .into_inner()
            .map_err(|e| IngestError::StoreCorrupt(format!("cannot encode record: {e}")))?;

        let mut inner = self.lock_inner();
        inner
            .file
            .write_all(&line)
            .and_then(|()| inner.file.sync_data())
            .map_err(|e| {
                IngestError::StoreCorrupt(format!("cannot append to {}: {e}", self.path.display()))
            })?;
        inner.records.insert(record.unit_id.clone(), record.clone());

        tracing::debug!(unit_id = %record.unit_id, status = %record.status, "Checkpoint recorded");
        Ok(record)
    }

    /// Make a terminal unit eligible again by appending a `pending` line.
    ///
    /// The pending line keeps the previous metadata, so a `local_path` left
    /// by a failed upload is still known to the next run. Returns false if
    /// the unit was unknown or already pending.
    pub fn reset_unit(&self, unit_id: &str) -> Result<bool, IngestError> {
        let Some(previous) = self.get(unit_id).filter(|r| r.status.is_terminal()) else {
            return Ok(false);
        };
        self.record(unit_id, UnitStatus::Pending, None, previous.metadata)?;
        Ok(true)
    }

    /// Reset every unit whose latest status is `failed`.
    pub fn reset_failed(&self) -> Result<usize, IngestError> {
        let failed = self.failed_records();
        let count = failed.len();
        for record in failed {
            self.record(&record.unit_id, UnitStatus::Pending, None, record.metadata)?;
        }
        Ok(count)
    }
}
