//! Append-only, sequence-numbered, hash-chained audit log.
//!
//! Every control-plane component writes through one [`AuditLog`]. Entries are
//! JSON Lines records (schema version [`RECORD_VERSION`]) that stay readable
//! with `cat`, and [`AuditEntry::render`] produces the classic one-line form:
//!
//! ```text
//! [2026-01-01T00:00:00.000Z] [SECURITY] [KillSwitch] [kill_switch_triggered] - cause=resource_anomaly
//! ```
//!
//! Sequence numbers are assigned under a single writer lock, so they are
//! strictly increasing and gapless within a process. A sidecar high-water mark
//! (`<log>.hwm`) keeps them from being reused after a restart even if the log
//! itself was truncated. Each entry carries the hash of its predecessor;
//! [`verify_chain`] detects edits, deletions, and reordering.

pub mod index;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::error::{Classified, ErrorClass};
use crate::storage;

/// Current on-disk record schema version.
pub const RECORD_VERSION: u32 = 1;

/// Hash that the first entry of a log chains from.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Source component names used in audit entries.
pub mod source {
    /// The audit log itself (truncation notices).
    pub const AUDIT_LOG: &str = "AuditLog";
    /// Key generation and destruction.
    pub const KEY_STORE: &str = "KeyStore";
    /// Skill signing, verification, loading.
    pub const SKILL_REGISTRY: &str = "SkillRegistry";
    /// Action evaluation decisions.
    pub const SAFETY_GATE: &str = "SafetyGate";
    /// Kill-switch transitions.
    pub const KILL_SWITCH: &str = "KillSwitch";
    /// Heartbeat task outcomes.
    pub const HEARTBEAT: &str = "Heartbeat";
    /// Configuration reloads.
    pub const CONFIG: &str = "Config";
    /// Skill runtime invocations.
    pub const SKILL_RUNTIME: &str = "SkillRuntime";
}

/// Audit entry severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    /// Routine information.
    Info,
    /// Unexpected but tolerated condition.
    Warn,
    /// Failure that needs attention.
    Error,
    /// Trust violation or kill-switch event.
    Security,
    /// Record of a deliberate, authorised state change.
    Audit,
}

impl AuditLevel {
    /// Upper-case label as written to the log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Security => "SECURITY",
            Self::Audit => "AUDIT",
        }
    }

    /// Parse a label (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            "SECURITY" => Some(Self::Security),
            "AUDIT" => Some(Self::Audit),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the audit log and its query index.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Reading or writing the log failed (after one retry for writes).
    #[error("audit log I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialized or parsed.
    #[error("audit record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A log line is not a valid record.
    #[error("malformed audit record at line {line}: {reason}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parse failure.
        reason: String,
    },

    /// The writer lock was poisoned by a panicking writer.
    #[error("audit writer lock poisoned")]
    LockPoisoned,

    /// Sequence counter exhausted.
    #[error("audit sequence space exhausted")]
    SequenceExhausted,

    /// Query index failure.
    #[error("audit index error: {0}")]
    Index(#[from] sqlx::Error),
}

impl Classified for AuditError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Malformed { .. } => ErrorClass::TrustViolation,
            _ => ErrorClass::ResourceFault,
        }
    }

    fn reason_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "audit_io",
            Self::Serialization(_) => "audit_serialization",
            Self::Malformed { .. } => "audit_malformed",
            Self::LockPoisoned => "audit_lock_poisoned",
            Self::SequenceExhausted => "audit_sequence_exhausted",
            Self::Index(_) => "audit_index",
        }
    }
}

/// One persisted audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Record schema version.
    pub v: u32,
    /// Monotonic, gapless sequence number (starts at 1).
    pub seq: u64,
    /// RFC 3339 timestamp with millisecond precision, UTC.
    pub timestamp: String,
    /// Severity.
    pub level: AuditLevel,
    /// Component that wrote the entry.
    pub source: String,
    /// Short snake_case action name.
    pub action: String,
    /// Human-readable detail.
    pub detail: String,
    /// Optional outcome (e.g. `allow`, `deny:forbidden_tier`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Hash of the previous entry.
    pub prev_hash: String,
    /// Hash of this entry's fields chained with `prev_hash`.
    pub hash: String,
}

/// Fields covered by the chain hash, in a fixed order.
#[derive(Serialize)]
struct HashedFields<'a> {
    v: u32,
    seq: u64,
    timestamp: &'a str,
    level: AuditLevel,
    source: &'a str,
    action: &'a str,
    detail: &'a str,
    outcome: Option<&'a str>,
    prev_hash: &'a str,
}

impl AuditEntry {
    /// Recompute the chain hash from this entry's fields.
    pub fn expected_hash(&self) -> String {
        let fields = HashedFields {
            v: self.v,
            seq: self.seq,
            timestamp: &self.timestamp,
            level: self.level,
            source: &self.source,
            action: &self.action,
            detail: &self.detail,
            outcome: self.outcome.as_deref(),
            prev_hash: &self.prev_hash,
        };
        // Serializing a plain struct of strings and integers cannot fail.
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Render the human-readable one-line form.
    pub fn render(&self) -> String {
        let mut line = format!(
            "[{}] [{}] [{}] [{}] - {}",
            self.timestamp, self.level, self.source, self.action, self.detail
        );
        if let Some(outcome) = &self.outcome {
            line.push_str(" => ");
            line.push_str(outcome);
        }
        line
    }
}

/// An event to append. Sequence, timestamp, and hashes are assigned by the log.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    level: AuditLevel,
    source: String,
    action: String,
    detail: String,
    outcome: Option<String>,
}

impl AuditRecord {
    /// Start a record for `source` performing `action`.
    pub fn new(level: AuditLevel, source: &str, action: &str) -> Self {
        Self {
            level,
            source: source.to_owned(),
            action: action.to_owned(),
            detail: String::new(),
            outcome: None,
        }
    }

    /// Set the detail text.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Set the outcome.
    #[must_use]
    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

struct Writer {
    sink: Box<dyn Write + Send>,
    next_seq: u64,
    last_hash: String,
}

/// The shared, single-writer audit log.
pub struct AuditLog {
    writer: Mutex<Writer>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Path of the high-water-mark sidecar for a log file.
pub fn high_water_path(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".hwm");
    log_path.with_file_name(name)
}

impl AuditLog {
    /// Open (or create) the log at `path`, resuming the sequence and chain.
    ///
    /// If the persisted high-water mark is ahead of the last entry in the
    /// file, the log was truncated: numbering resumes after the high-water
    /// mark and a SECURITY `audit_log_truncated` entry is appended.
    ///
    /// An unterminated final line left by an interrupted append is repaired
    /// first: a complete record gets its newline, anything else is moved to
    /// `<log>.torn` and a SECURITY `audit_log_torn_tail` entry is appended.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] when the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let torn = repair_torn_tail(&path)?;
        let tail = last_valid_entry(&path)?;
        let high_water = read_high_water(&path);
        let last_seq = tail.as_ref().map_or(0, |e| e.seq);
        let last_hash = tail
            .as_ref()
            .map_or_else(|| GENESIS_HASH.to_owned(), |e| e.hash.clone());
        let resume_from = last_seq.max(high_water);
        let next_seq = resume_from
            .checked_add(1)
            .ok_or(AuditError::SequenceExhausted)?;

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::Io {
                path: path.clone(),
                source,
            })?;

        let log = Self {
            writer: Mutex::new(Writer {
                sink: Box::new(file),
                next_seq,
                last_hash,
            }),
            path: Some(path),
        };

        if high_water > last_seq {
            log.append(
                AuditRecord::new(AuditLevel::Security, source::AUDIT_LOG, "audit_log_truncated")
                    .detail(format!(
                        "high-water mark {high_water} is ahead of last entry {last_seq}; \
                         numbering resumes after the high-water mark"
                    )),
            )?;
        }

        if let Some(torn) = torn {
            log.append(
                AuditRecord::new(AuditLevel::Security, source::AUDIT_LOG, "audit_log_torn_tail")
                    .detail(format!(
                        "discarded {} bytes of an incomplete record after seq {last_seq}; \
                         saved to {}",
                        torn.bytes,
                        torn.saved_to.display()
                    )),
            )?;
        }

        Ok(log)
    }

    /// Create a log over an arbitrary writer, starting at sequence 1 (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(Writer {
                sink: writer,
                next_seq: 1,
                last_hash: GENESIS_HASH.to_owned(),
            }),
            path: None,
        }
    }

    /// File backing this log, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Sequence number the next append will receive.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::LockPoisoned`] if a writer panicked.
    pub fn next_seq(&self) -> Result<u64, AuditError> {
        let writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;
        Ok(writer.next_seq)
    }

    /// Append one record and return its sequence number.
    ///
    /// Assignment of the sequence number and the write happen under one lock,
    /// so concurrent appends never interleave or leave gaps. A failed write is
    /// retried once; the sequence number is only consumed on success.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] when both write attempts fail.
    pub fn append(&self, record: AuditRecord) -> Result<u64, AuditError> {
        let mut writer = self.writer.lock().map_err(|_| AuditError::LockPoisoned)?;

        let mut entry = AuditEntry {
            v: RECORD_VERSION,
            seq: writer.next_seq,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level: record.level,
            source: record.source,
            action: record.action,
            detail: record.detail,
            outcome: record.outcome,
            prev_hash: writer.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.expected_hash();

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        if let Err(first) = write_line(writer.sink.as_mut(), line.as_bytes()) {
            warn!(error = %first, seq = entry.seq, "audit write failed, retrying once");
            write_line(writer.sink.as_mut(), line.as_bytes()).map_err(|source| AuditError::Io {
                path: self.path.clone().unwrap_or_default(),
                source,
            })?;
        }

        writer.next_seq = entry
            .seq
            .checked_add(1)
            .ok_or(AuditError::SequenceExhausted)?;
        writer.last_hash.clone_from(&entry.hash);

        if let Some(path) = &self.path {
            let hwm = high_water_path(path);
            if let Err(e) = storage::write_atomic(&hwm, entry.seq.to_string().as_bytes()) {
                warn!(error = %e, path = %hwm.display(), "failed to persist audit high-water mark");
            }
        }
        drop(writer);

        emit_trace(&entry);
        Ok(entry.seq)
    }
}

fn write_line(sink: &mut (dyn Write + Send), bytes: &[u8]) -> std::io::Result<()> {
    sink.write_all(bytes)?;
    sink.flush()
}

/// Mirror an audit entry into the diagnostic log.
fn emit_trace(entry: &AuditEntry) {
    let outcome = entry.outcome.as_deref().unwrap_or("");
    match entry.level {
        AuditLevel::Info | AuditLevel::Audit => info!(
            seq = entry.seq,
            level = %entry.level,
            source = %entry.source,
            action = %entry.action,
            outcome,
            "{}",
            entry.detail
        ),
        AuditLevel::Warn | AuditLevel::Security => warn!(
            seq = entry.seq,
            level = %entry.level,
            source = %entry.source,
            action = %entry.action,
            outcome,
            "{}",
            entry.detail
        ),
        AuditLevel::Error => error!(
            seq = entry.seq,
            source = %entry.source,
            action = %entry.action,
            outcome,
            "{}",
            entry.detail
        ),
    }
}

fn read_high_water(log_path: &Path) -> u64 {
    fs::read_to_string(high_water_path(log_path))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Path of the sidecar that keeps fragments cut from a torn log tail.
pub fn torn_tail_path(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".torn");
    log_path.with_file_name(name)
}

struct TornTail {
    bytes: usize,
    saved_to: PathBuf,
}

/// Terminate or cut an unterminated final line. Returns what was cut.
fn repair_torn_tail(path: &Path) -> Result<Option<TornTail>, AuditError> {
    let io_err = |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_err(source)),
    };
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(None);
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos.saturating_add(1));
    let fragment = bytes.get(keep..).unwrap_or_default();

    if serde_json::from_slice::<AuditEntry>(fragment).is_ok() {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(io_err)?;
        write_line(&mut file, b"\n").map_err(io_err)?;
        return Ok(None);
    }

    let saved_to = torn_tail_path(path);
    let mut sidecar = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&saved_to)
        .map_err(|source| AuditError::Io {
            path: saved_to.clone(),
            source,
        })?;
    let mut saved = fragment.to_vec();
    saved.push(b'\n');
    write_line(&mut sidecar, &saved).map_err(|source| AuditError::Io {
        path: saved_to.clone(),
        source,
    })?;

    let len = u64::try_from(keep).map_err(|_| io_err(std::io::Error::other("log too large")))?;
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(io_err)?;
    file.set_len(len).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;

    warn!(
        path = %path.display(),
        bytes = fragment.len(),
        "cut torn audit log tail"
    );
    Ok(Some(TornTail {
        bytes: fragment.len(),
        saved_to,
    }))
}

/// Non-blank lines of a log file with 1-based line numbers. An unterminated
/// final line that does not parse is an append still in flight (or cut short
/// by a crash) and is left out.
fn log_lines(path: &Path) -> Result<Vec<(usize, String)>, AuditError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let contents = String::from_utf8_lossy(&bytes);
    let unterminated = !contents.is_empty() && !contents.ends_with('\n');

    let mut lines: Vec<(usize, String)> = contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| (idx.saturating_add(1), line.to_owned()))
        .collect();

    if unterminated {
        let torn = lines
            .last()
            .is_some_and(|(_, last)| serde_json::from_str::<AuditEntry>(last).is_err());
        if torn {
            lines.pop();
        }
    }
    Ok(lines)
}

/// Last parseable entry of a log file.
fn last_valid_entry(path: &Path) -> Result<Option<AuditEntry>, AuditError> {
    Ok(log_lines(path)?
        .iter()
        .rev()
        .find_map(|(_, line)| serde_json::from_str::<AuditEntry>(line).ok()))
}

/// Read every entry of a log file in file order.
///
/// # Errors
///
/// Returns [`AuditError::Malformed`] on the first unparseable line, or
/// [`AuditError::Io`] if the file cannot be read. A missing file is empty.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    log_lines(path)?
        .into_iter()
        .map(|(line, text)| {
            serde_json::from_str::<AuditEntry>(&text).map_err(|e| AuditError::Malformed {
                line,
                reason: e.to_string(),
            })
        })
        .collect()
}

/// The last `count` entries of a log file.
///
/// # Errors
///
/// Propagates [`read_entries`] failures.
pub fn recent(path: &Path, count: usize) -> Result<Vec<AuditEntry>, AuditError> {
    let mut entries = read_entries(path)?;
    let skip = entries.len().saturating_sub(count);
    Ok(entries.split_off(skip))
}

/// Where and how a hash chain is broken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    /// A line is not a valid record.
    Malformed {
        /// 1-based line number.
        line: usize,
    },
    /// Sequence numbers skip or repeat.
    SequenceGap {
        /// 1-based line number.
        line: usize,
        /// Sequence number that should have appeared.
        expected: u64,
        /// Sequence number found.
        found: u64,
    },
    /// `prev_hash` does not match the previous entry's hash.
    BrokenLink {
        /// 1-based line number.
        line: usize,
        /// Sequence number of the entry.
        seq: u64,
    },
    /// Entry fields were edited after writing.
    HashMismatch {
        /// 1-based line number.
        line: usize,
        /// Sequence number of the entry.
        seq: u64,
    },
}

impl std::fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed { line } => write!(f, "line {line}: malformed record"),
            Self::SequenceGap {
                line,
                expected,
                found,
            } => write!(f, "line {line}: expected seq {expected}, found {found}"),
            Self::BrokenLink { line, seq } => {
                write!(f, "line {line}: seq {seq} does not link to its predecessor")
            }
            Self::HashMismatch { line, seq } => {
                write!(f, "line {line}: seq {seq} was modified after it was written")
            }
        }
    }
}

/// Result of walking a log's hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    /// Entries checked before the first break (or all of them).
    pub entries: u64,
    /// Sequence number of the last intact entry.
    pub last_seq: Option<u64>,
    /// First break found, if any.
    pub first_break: Option<ChainBreak>,
}

impl ChainReport {
    /// Whether the whole chain verified.
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Walk the hash chain of the log at `path` and report the first break.
///
/// # Errors
///
/// Returns [`AuditError::Io`] if the file cannot be read.
pub fn verify_chain(path: &Path) -> Result<ChainReport, AuditError> {
    let mut report = ChainReport {
        entries: 0,
        last_seq: None,
        first_break: None,
    };
    let mut prev_hash = GENESIS_HASH.to_owned();

    for (line_no, line) in log_lines(path)? {
        let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) else {
            report.first_break = Some(ChainBreak::Malformed { line: line_no });
            return Ok(report);
        };

        if let Some(last) = report.last_seq {
            let expected = last.saturating_add(1);
            if entry.seq != expected {
                report.first_break = Some(ChainBreak::SequenceGap {
                    line: line_no,
                    expected,
                    found: entry.seq,
                });
                return Ok(report);
            }
        }

        if entry.prev_hash != prev_hash {
            report.first_break = Some(ChainBreak::BrokenLink {
                line: line_no,
                seq: entry.seq,
            });
            return Ok(report);
        }

        if entry.expected_hash() != entry.hash {
            report.first_break = Some(ChainBreak::HashMismatch {
                line: line_no,
                seq: entry.seq,
            });
            return Ok(report);
        }

        prev_hash = entry.hash;
        report.last_seq = Some(entry.seq);
        report.entries = report.entries.saturating_add(1);
    }

    Ok(report)
}
