//! Append-only audit log of monitor events.
//!
//! One JSON record per line, each carrying the hash of its predecessor, so truncation in the
//! middle or rewriting of an earlier line is detectable with [`verify_chain`]. Reopening an
//! existing log verifies it and resumes the chain.
//!
//! A write that fails part-way is rolled back to the end of the last complete record; any torn
//! tail still on disk is cut off before the next append.

use crate::events::MonitorEvent;
use crate::hash::{sha256, sha256_domain, EVENT_LOG_RECORD_DOMAIN_V1};
use crate::{Clock, Hash32, MonitorError, NotificationSink, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const EVENT_LOG_RECORD_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogRecordV1 {
    pub record_version: u32,
    pub sequence: u64,
    pub logged_at_ms: i64,
    pub prev_record_hash: Hash32,
    pub record_hash: Hash32,
    pub event: MonitorEvent,
}

pub fn record_hash_v1(
    prev_record_hash: &Hash32,
    sequence: u64,
    logged_at_ms: i64,
    event: &MonitorEvent,
) -> Result<Hash32> {
    let event_bytes = serde_json::to_vec(event)
        .map_err(|e| MonitorError::EventLog(format!("failed to encode event: {e}")))?;

    let mut bytes = Vec::with_capacity(4 + 8 + 8 + 32 + 32);
    bytes.extend_from_slice(&EVENT_LOG_RECORD_VERSION.to_le_bytes());
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(&logged_at_ms.to_le_bytes());
    bytes.extend_from_slice(&prev_record_hash.0);
    bytes.extend_from_slice(&sha256(&event_bytes).0);
    Ok(sha256_domain(EVENT_LOG_RECORD_DOMAIN_V1, &bytes))
}

struct ChainHead {
    last_hash: Hash32,
    next_sequence: u64,
    /// File length up to the end of the last complete record.
    committed_len: u64,
}

/// File-backed, hash-chained [`NotificationSink`].
pub struct JsonlEventLog {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    /// Serializes appends within this process.
    head: Mutex<ChainHead>,
}

impl JsonlEventLog {
    /// Open or create the log at `path`. An existing file must verify.
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        let head = if path.exists() {
            let (count, last_hash) = scan(&path)?;
            let committed_len = fs::metadata(&path)
                .map_err(|e| MonitorError::EventLog(format!("failed to stat event log: {e}")))?
                .len();
            debug!(path = %path.display(), records = count, "resuming event log");
            ChainHead {
                last_hash,
                next_sequence: count as u64,
                committed_len,
            }
        } else {
            ChainHead {
                last_hash: Hash32([0u8; 32]),
                next_sequence: 0,
                committed_len: 0,
            }
        };
        Ok(Self {
            path,
            clock,
            head: Mutex::new(head),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the last appended record; zero for an empty log.
    pub fn last_record_hash(&self) -> Result<Hash32> {
        Ok(self.lock_head()?.last_hash)
    }

    pub fn append(&self, event: &MonitorEvent) -> Result<EventLogRecordV1> {
        let mut head = self.lock_head()?;
        let logged_at_ms = self.clock.now_ms();
        let sequence = head.next_sequence;
        let record_hash = record_hash_v1(&head.last_hash, sequence, logged_at_ms, event)?;
        let record = EventLogRecordV1 {
            record_version: EVENT_LOG_RECORD_VERSION,
            sequence,
            logged_at_ms,
            prev_record_hash: head.last_hash,
            record_hash,
            event: event.clone(),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| MonitorError::EventLog(format!("failed to open event log: {e}")))?;
        self.cut_torn_tail(&file, head.committed_len)?;

        let mut line = serde_json::to_vec(&record)
            .map_err(|e| MonitorError::EventLog(format!("failed to serialize record: {e}")))?;
        line.push(b'\n');
        if let Err(err) = write_line(&mut file, &line) {
            if let Err(rollback) = file.set_len(head.committed_len) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "could not roll back partial event log write"
                );
            }
            return Err(err);
        }

        head.last_hash = record_hash;
        head.next_sequence = sequence + 1;
        head.committed_len += line.len() as u64;
        Ok(record)
    }

    /// Drop bytes past the last complete record left behind by an earlier failed write.
    fn cut_torn_tail(&self, file: &File, committed_len: u64) -> Result<()> {
        let on_disk = file
            .metadata()
            .map_err(|e| MonitorError::EventLog(format!("failed to stat event log: {e}")))?
            .len();
        if on_disk < committed_len {
            return Err(MonitorError::EventLog(format!(
                "event log shrank from {committed_len} to {on_disk} bytes"
            )));
        }
        if on_disk > committed_len {
            warn!(
                path = %self.path.display(),
                torn_bytes = on_disk - committed_len,
                "discarding torn event log tail"
            );
            file.set_len(committed_len)
                .map_err(|e| MonitorError::EventLog(format!("failed to truncate event log: {e}")))?;
        }
        Ok(())
    }

    fn lock_head(&self) -> Result<std::sync::MutexGuard<'_, ChainHead>> {
        self.head
            .lock()
            .map_err(|_| MonitorError::EventLog("event log lock poisoned".into()))
    }
}

fn write_line(file: &mut File, line: &[u8]) -> Result<()> {
    file.write_all(line)
        .map_err(|e| MonitorError::EventLog(format!("failed to write record: {e}")))?;
    file.sync_all()
        .map_err(|e| MonitorError::EventLog(format!("failed to sync event log: {e}")))
}

impl NotificationSink for JsonlEventLog {
    fn notify(&self, event: &MonitorEvent) -> Result<()> {
        self.append(event).map(|_| ())
    }
}

/// Check every record's hash and linkage. Returns the number of records.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize> {
    scan(path.as_ref()).map(|(count, _)| count)
}

fn scan(path: &Path) -> Result<(usize, Hash32)> {
    let file = File::open(path)
        .map_err(|e| MonitorError::EventLog(format!("failed to open event log: {e}")))?;
    let mut prev = Hash32([0u8; 32]);
    let mut count = 0usize;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line =
            line.map_err(|e| MonitorError::EventLog(format!("failed to read line {idx}: {e}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventLogRecordV1 = serde_json::from_str(&line)
            .map_err(|e| MonitorError::EventLog(format!("line {idx} is not a record: {e}")))?;

        if record.record_version != EVENT_LOG_RECORD_VERSION {
            return Err(MonitorError::EventLog(format!(
                "line {idx}: unsupported record version {}",
                record.record_version
            )));
        }
        if record.sequence != count as u64 {
            return Err(MonitorError::EventLog(format!(
                "line {idx}: expected sequence {count}, found {}",
                record.sequence
            )));
        }
        if record.prev_record_hash != prev {
            return Err(MonitorError::EventLog(format!(
                "line {idx}: chain broken"
            )));
        }
        let expected = record_hash_v1(&prev, record.sequence, record.logged_at_ms, &record.event)?;
        if record.record_hash != expected {
            return Err(MonitorError::EventLog(format!(
                "line {idx}: record hash mismatch"
            )));
        }

        prev = record.record_hash;
        count += 1;
    }
    Ok((count, prev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::{ModelId, RecordId, RequestId};
    use std::fs;

    fn events() -> Vec<MonitorEvent> {
        let model_id = ModelId::new("fraud").unwrap();
        vec![
            MonitorEvent::RecordRecorded {
                model_id,
                record_id: RecordId(1),
                timestamp_ms: 5,
            },
            MonitorEvent::AnalysisRequested {
                record_id: RecordId(1),
                request_id: RequestId(Hash32([3; 32])),
            },
            MonitorEvent::RequestCancelled {
                request_id: RequestId(Hash32([3; 32])),
            },
        ]
    }

    #[test]
    fn appends_hash_chained_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlEventLog::open(&path, Arc::new(ManualClock::new(100))).unwrap();

        let mut prev = Hash32([0; 32]);
        for (i, e) in events().iter().enumerate() {
            let record = log.append(e).unwrap();
            assert_eq!(record.sequence, i as u64);
            assert_eq!(record.prev_record_hash, prev);
            prev = record.record_hash;
        }
        assert_eq!(log.last_record_hash().unwrap(), prev);
        assert_eq!(verify_chain(&path).unwrap(), 3);
    }

    #[test]
    fn reopening_resumes_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let clock = Arc::new(ManualClock::new(0));
        let evs = events();

        let first = JsonlEventLog::open(&path, clock.clone()).unwrap();
        first.notify(&evs[0]).unwrap();
        let head = first.last_record_hash().unwrap();
        drop(first);

        let second = JsonlEventLog::open(&path, clock).unwrap();
        assert_eq!(second.last_record_hash().unwrap(), head);
        let record = second.append(&evs[1]).unwrap();
        assert_eq!(record.sequence, 1);
        assert_eq!(record.prev_record_hash, head);
        assert_eq!(verify_chain(&path).unwrap(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).unwrap();
        for e in events() {
            log.append(&e).unwrap();
        }

        let original = fs::read_to_string(&path).unwrap();
        let tampered = original.replacen("\"timestamp_ms\":5", "\"timestamp_ms\":6", 1);
        assert_ne!(original, tampered);
        fs::write(&path, tampered).unwrap();
        assert!(matches!(verify_chain(&path), Err(MonitorError::EventLog(_))));
        assert!(JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).is_err());
    }

    #[test]
    fn dropped_line_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).unwrap();
        for e in events() {
            log.append(&e).unwrap();
        }

        let kept: Vec<_> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| format!("{l}\n"))
            .collect();
        fs::write(&path, kept.concat()).unwrap();
        assert!(verify_chain(&path).is_err());
    }

    #[test]
    fn torn_tail_is_cut_before_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).unwrap();
        let evs = events();
        log.append(&evs[0]).unwrap();

        // What an interrupted write leaves behind: half a record, no newline.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"record_version\":1,\"seq").unwrap();
        drop(file);
        assert!(verify_chain(&path).is_err());

        let record = log.append(&evs[1]).unwrap();
        assert_eq!(record.sequence, 1);
        log.append(&evs[2]).unwrap();
        assert_eq!(verify_chain(&path).unwrap(), 3);
        assert!(JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).is_ok());
    }

    #[test]
    fn externally_truncated_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = JsonlEventLog::open(&path, Arc::new(ManualClock::new(0))).unwrap();
        let evs = events();
        log.append(&evs[0]).unwrap();
        log.append(&evs[1]).unwrap();

        OpenOptions::new().write(true).open(&path).unwrap().set_len(10).unwrap();
        assert!(matches!(log.append(&evs[2]), Err(MonitorError::EventLog(_))));
    }
}
