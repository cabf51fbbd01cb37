use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::warn;

use crate::{CycleRecord, JournalResult};

/// Append-only store of cycle records.
pub trait DecisionJournal: Send + Sync {
    fn append(&self, record: &CycleRecord) -> JournalResult<()>;

    /// The last `limit` records, oldest first.
    fn recent(&self, limit: usize) -> JournalResult<Vec<CycleRecord>>;
}

/// Records kept in memory for [`DecisionJournal::recent`] by default.
const DEFAULT_RETAINED: usize = 500;

/// JSON-lines journal at `{dir}/{trader_id}.jsonl`.
///
/// The newest records are also kept in memory, so `recent` never touches the
/// file. Requests beyond the retained window return only what is retained.
pub struct JsonlJournal {
    path: PathBuf,
    retained: usize,
    tail: Mutex<VecDeque<CycleRecord>>,
}

impl JsonlJournal {
    /// Open (or create) the journal file for `trader_id` inside `dir`.
    pub fn open(dir: impl AsRef<Path>, trader_id: &str) -> JournalResult<Self> {
        Self::open_with_retention(dir, trader_id, DEFAULT_RETAINED)
    }

    /// Like [`open`](Self::open), keeping the last `retained` records in memory.
    pub fn open_with_retention(
        dir: impl AsRef<Path>,
        trader_id: &str,
        retained: usize,
    ) -> JournalResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{trader_id}.jsonl"));
        OpenOptions::new().create(true).append(true).open(&path)?;
        let mut records = read_records(&path)?;
        let skip = records.len().saturating_sub(retained);
        let tail: VecDeque<CycleRecord> = records.split_off(skip).into();
        Ok(Self {
            path,
            retained,
            tail: Mutex::new(tail),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionJournal for JsonlJournal {
    fn append(&self, record: &CycleRecord) -> JournalResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        if self.retained > 0 {
            if tail.len() == self.retained {
                tail.pop_front();
            }
            tail.push_back(record.clone());
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> JournalResult<Vec<CycleRecord>> {
        let tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = tail.len().saturating_sub(limit);
        Ok(tail.iter().skip(skip).cloned().collect())
    }
}

/// Read every record in a JSON-lines journal file. Malformed lines are
/// logged and skipped.
pub fn read_records(path: impl AsRef<Path>) -> JournalResult<Vec<CycleRecord>> {
    let path = path.as_ref();
    let file = fs::File::open(path)?;
    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CycleRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => {
                warn!(path = %path.display(), line = idx + 1, error = %err, "skipping malformed journal line");
            }
        }
    }
    Ok(records)
}

/// In-process journal used by tests and dry runs.
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<CycleRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CycleRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DecisionJournal for MemoryJournal {
    fn append(&self, record: &CycleRecord) -> JournalResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }

    fn recent(&self, limit: usize) -> JournalResult<Vec<CycleRecord>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = records.len().saturating_sub(limit);
        Ok(records[skip..].to_vec())
    }
}
