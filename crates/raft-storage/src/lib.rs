//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-engine before it answers any rpc, read back on restart
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use raft_core::{Address, LogEntry, LogWrite};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// trait for durable storage of raft state
///
/// this abstraction allows the same engine to work with:
/// - real filesystem (FileStorage)
/// - in-memory (testing)
///
/// log positions are 1-based, matching raft log indexes.
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(u64, Option<Address>)>;

    /// persist the highest index known to be committed
    fn save_commit_index(&mut self, index: u64) -> io::Result<()>;

    /// load the persisted commit index (0 for a new node)
    fn load_commit_index(&self) -> io::Result<u64>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// drop the entry at `from_index` and everything after it (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;

    /// mirror a batch of in-memory log changes: truncation first, then appends
    fn apply_log_write(&mut self, write: &LogWrite<'_>) -> io::Result<()> {
        if let Some(from) = write.truncate_from {
            self.truncate_log_from(from)?;
        }
        if write.entries.is_empty() {
            return Ok(());
        }
        // anything stored past the write's first index is stale
        self.truncate_log_from(write.first_index)?;
        self.append_entries(write.entries)
    }
}

fn invalid_data(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// keep the first `from_index - 1` entries
fn truncate_positional(log: &mut Vec<LogEntry>, from_index: u64) {
    let keep = from_index.saturating_sub(1) as usize;
    log.truncate(keep);
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term, voted_for and commit index
/// - log.json: array of log entries
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the metadata file
    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    /// get the path to the log file
    fn log_path(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// atomic write: write to temp file, fsync, then rename over the target
    fn write_atomic<T: Serialize>(&self, target: &Path, temp_name: &str, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(invalid_data)?;

        let temp_path = self.dir.join(temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;

        Ok(())
    }

    /// read a json file, or the default when it was never written
    fn read_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> io::Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }

        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents).map_err(invalid_data)
    }

    fn load_meta(&self) -> io::Result<MetaData> {
        self.read_or_default(&self.meta_path())
    }

    fn save_meta(&self, meta: &MetaData) -> io::Result<()> {
        self.write_atomic(&self.meta_path(), "meta.tmp", meta)
    }

    fn save_log(&self, log: &[LogEntry]) -> io::Result<()> {
        self.write_atomic(&self.log_path(), "log.tmp", &log)
    }
}

/// metadata structure for term, vote and commit index
#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
struct MetaData {
    term: u64,
    voted_for: Option<Address>,
    commit_index: u64,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()> {
        let mut meta = self.load_meta()?;
        meta.term = term;
        meta.voted_for = voted_for.map(str::to_string);
        self.save_meta(&meta)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<Address>)> {
        let meta = self.load_meta()?;
        Ok((meta.term, meta.voted_for))
    }

    fn save_commit_index(&mut self, index: u64) -> io::Result<()> {
        let mut meta = self.load_meta()?;
        meta.commit_index = index;
        self.save_meta(&meta)
    }

    fn load_commit_index(&self) -> io::Result<u64> {
        Ok(self.load_meta()?.commit_index)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut log = self.load_log()?;
        log.extend(entries.iter().cloned());

        // write entire log (simple approach - could optimize with append-only file)
        self.save_log(&log)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        self.read_or_default(&self.log_path())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let mut log = self.load_log()?;
        if from_index > log.len() as u64 {
            return Ok(());
        }
        truncate_positional(&mut log, from_index);
        self.save_log(&log)
    }

    fn clear(&mut self) -> io::Result<()> {
        let _ = fs::remove_file(self.meta_path());
        let _ = fs::remove_file(self.log_path());
        Ok(())
    }

    /// one read and at most one rewrite of log.json per batch
    fn apply_log_write(&mut self, write: &LogWrite<'_>) -> io::Result<()> {
        if write.is_empty() {
            return Ok(());
        }

        let mut log = self.load_log()?;
        let stored = log.len();
        if let Some(from) = write.truncate_from {
            truncate_positional(&mut log, from);
        }
        if write.entries.is_empty() && log.len() == stored {
            return Ok(());
        }
        truncate_positional(&mut log, write.first_index);
        log.extend(write.entries.iter().cloned());
        self.save_log(&log)
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    term: u64,
    voted_for: Option<Address>,
    commit_index: u64,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for.map(str::to_string);
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<Address>)> {
        Ok((self.term, self.voted_for.clone()))
    }

    fn save_commit_index(&mut self, index: u64) -> io::Result<()> {
        self.commit_index = index;
        Ok(())
    }

    fn load_commit_index(&self) -> io::Result<u64> {
        Ok(self.commit_index)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        truncate_positional(&mut self.log, from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.term = 0;
        self.voted_for = None;
        self.commit_index = 0;
        self.log.clear();
        Ok(())
    }
}
