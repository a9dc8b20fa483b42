use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::StoreError;
use crate::models::CycleStats;
use crate::storage::write_json_atomic;

/// Rolling history of cycle stats, newest last
#[derive(Debug)]
pub struct StatsHistory {
    path: PathBuf,
    capacity: usize,
    entries: Vec<CycleStats>,
}

impl StatsHistory {
    /// Load the history file. A missing or unreadable file starts a fresh history.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str::<Vec<CycleStats>>(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Stats history unreadable, starting a new one");
                Vec::new()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read stats history, starting a new one");
                Vec::new()
            }
        };

        let mut history = Self {
            path,
            capacity: capacity.max(1),
            entries,
        };
        history.truncate();
        history
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[CycleStats] {
        &self.entries
    }

    pub fn last(&self) -> Option<&CycleStats> {
        self.entries.last()
    }

    /// Append `stats`, drop the oldest entries beyond capacity, and rewrite the file
    pub fn append(&mut self, stats: CycleStats) -> Result<(), StoreError> {
        self.entries.push(stats);
        self.truncate();
        write_json_atomic(&self.path, &self.entries)
    }

    fn truncate(&mut self) {
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }
}
