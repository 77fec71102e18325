//! # log
//!
//! why: manage the append-only log of entries that raft replicates
//! relations: owned by node.rs, mirrored into raft-storage by the engine
//! what: LogEntry variants, Log with append/read/suffix-truncate, durability tracking

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::Address;

/// A single entry in the replicated log
///
/// Entries carry no index of their own: an entry's index is its 1-based
/// position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    /// Opaque application command
    Command { term: u64, payload: Vec<u8> },
    /// A new cluster membership, effective once committed
    Configuration { term: u64, members: BTreeSet<Address> },
    /// Written by a new leader so entries from earlier terms can commit
    NoOp { term: u64 },
}

impl LogEntry {
    pub fn command(term: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::Command {
            term,
            payload: payload.into(),
        }
    }

    pub fn configuration<I, A>(term: u64, members: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self::Configuration {
            term,
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn noop(term: u64) -> Self {
        Self::NoOp { term }
    }

    /// The term in which the entry was created
    pub fn term(&self) -> u64 {
        match self {
            Self::Command { term, .. } | Self::Configuration { term, .. } | Self::NoOp { term } => {
                *term
            }
        }
    }

    /// The command payload, if this is a command entry
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::Command { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// The member set, if this is a configuration entry
    pub fn members(&self) -> Option<&BTreeSet<Address>> {
        match self {
            Self::Configuration { members, .. } => Some(members),
            _ => None,
        }
    }
}

/// Changes made to the log since it was last marked stable.
///
/// The engine applies a `LogWrite` to durable storage before it answers any
/// rpc, so a follower never acknowledges an entry it could lose on restart.
#[derive(Debug, PartialEq, Eq)]
pub struct LogWrite<'a> {
    /// Storage must drop everything from this index onward first
    pub truncate_from: Option<u64>,
    /// Entries to append after the truncation, starting at `first_index`
    pub entries: &'a [LogEntry],
    pub first_index: u64,
}

impl LogWrite<'_> {
    pub fn is_empty(&self) -> bool {
        self.truncate_from.is_none() && self.entries.is_empty()
    }
}

/// The replicated log
///
/// Mutated only by appending at the tail or truncating a suffix. Reads past
/// the end report absence rather than failing.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
    /// number of leading entries known to be durable
    stable: u64,
    /// lowest truncation point since the last `mark_stable`
    truncated_from: Option<u64>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from entries loaded out of durable storage
    pub fn from_stable(entries: Vec<LogEntry>) -> Self {
        let stable = entries.len() as u64;
        Self {
            entries,
            stable,
            truncated_from: None,
        }
    }

    /// Append entries at the tail, returning the new last index
    pub fn append(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> u64 {
        self.entries.extend(entries);
        self.last_index()
    }

    /// Entry at a 1-based index; `None` for 0 or anything past the tail
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`, 0 when there is no such entry
    pub fn term_at(&self, index: u64) -> u64 {
        self.entry_at(index).map(LogEntry::term).unwrap_or(0)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(LogEntry::term).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove the entry at `index` and everything after it
    pub fn truncate_from(&mut self, index: u64) {
        let index = index.max(1);
        if index > self.last_index() {
            return;
        }
        self.entries.truncate((index - 1) as usize);
        if index <= self.stable {
            self.stable = index - 1;
            self.truncated_from = Some(self.truncated_from.map_or(index, |t| t.min(index)));
        }
    }

    /// All entries from `index` (inclusive) to the tail
    pub fn entries_from(&self, index: u64) -> &[LogEntry] {
        self.slice(index, usize::MAX)
    }

    /// At most `max` entries starting at `index`
    pub fn slice(&self, index: u64, max: usize) -> &[LogEntry] {
        let start = (index.max(1) - 1) as usize;
        if start >= self.entries.len() {
            return &[];
        }
        let end = start.saturating_add(max).min(self.entries.len());
        &self.entries[start..end]
    }

    /// Iterate over `(index, entry)` pairs in the inclusive range
    pub fn range(&self, from: u64, to: u64) -> impl Iterator<Item = (u64, &LogEntry)> + '_ {
        let to = to.min(self.last_index());
        (from.max(1)..=to).filter_map(move |i| self.entry_at(i).map(|e| (i, e)))
    }

    /// First index holding an entry of `term`, scanning back from `from`
    pub fn first_index_of_term(&self, term: u64, from: u64) -> u64 {
        let mut index = from.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == term {
            index -= 1;
        }
        index
    }

    /// Changes not yet mirrored into durable storage
    pub fn unstable(&self) -> LogWrite<'_> {
        LogWrite {
            truncate_from: self.truncated_from,
            entries: &self.entries[self.stable as usize..],
            first_index: self.stable + 1,
        }
    }

    /// Record that everything returned by `unstable` is now durable
    pub fn mark_stable(&mut self) {
        self.stable = self.last_index();
        self.truncated_from = None;
    }
}
