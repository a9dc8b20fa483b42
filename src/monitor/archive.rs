use std::path::{Path, PathBuf};

use crate::error::StoreError;
use crate::models::ListingRecord;
use crate::storage::write_json_atomic;

/// Local copies of every extracted record, one file per listing
#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, listing_id: &str) -> PathBuf {
        // ids come from the page; keep only characters safe in a file name
        let safe: String = listing_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("property_{}.json", safe))
    }

    /// Write (or overwrite) the archived copy of `record`
    pub fn save(&self, record: &ListingRecord) -> Result<PathBuf, StoreError> {
        let path = self.path_for(&record.listing_id);
        write_json_atomic(&path, record)?;
        Ok(path)
    }
}
