//! Durable record of which listings have already been handled.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::ListingId;
use crate::storage::write_json_atomic;

/// Default number of backups kept next to the seen-set file
pub const DEFAULT_BACKUP_KEEP: usize = 10;

/// One handled listing
#[derive(Debug, Clone, PartialEq)]
pub struct SeenEntry {
    pub listing_id: ListingId,
    /// ISO-8601 text as persisted; empty for entries coerced from the legacy array format
    pub first_seen_at: String,
}

impl SeenEntry {
    pub fn first_seen(&self) -> Option<DateTime<FixedOffset>> {
        parse_timestamp(&self.first_seen_at)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts);
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.fixed_offset())
}

/// Shapes the seen-set file has been observed in
#[derive(Debug)]
enum StoredShape {
    Canonical(Map<String, Value>),
    LegacyArray(Vec<Value>),
    Unrecognized(&'static str),
}

impl StoredShape {
    fn classify(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Canonical(map),
            Value::Array(items) => Self::LegacyArray(items),
            Value::Null => Self::Unrecognized("null"),
            Value::Bool(_) => Self::Unrecognized("boolean"),
            Value::Number(_) => Self::Unrecognized("number"),
            Value::String(_) => Self::Unrecognized("string"),
        }
    }

    fn into_entries(self, path: &Path) -> HashMap<ListingId, SeenEntry> {
        match self {
            Self::Canonical(map) => map
                .into_iter()
                .map(|(id, ts)| {
                    let first_seen_at = match ts {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    let listing_id = ListingId::new(id);
                    (listing_id.clone(), SeenEntry { listing_id, first_seen_at })
                })
                .collect(),
            Self::LegacyArray(items) => {
                warn!(
                    path = %path.display(),
                    count = items.len(),
                    "Seen-set file uses the legacy array format, converting"
                );
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(s) if !s.is_empty() => Some(s),
                        Value::Number(n) => Some(n.to_string()),
                        other => {
                            warn!(entry = %other, "Ignoring unrecognized legacy seen-set entry");
                            None
                        }
                    })
                    .map(|id| {
                        let listing_id = ListingId::new(id);
                        let entry = SeenEntry {
                            listing_id: listing_id.clone(),
                            first_seen_at: String::new(),
                        };
                        (listing_id, entry)
                    })
                    .collect()
            }
            Self::Unrecognized(kind) => {
                warn!(
                    path = %path.display(),
                    kind,
                    "Seen-set file has an unexpected shape, starting from an empty set"
                );
                HashMap::new()
            }
        }
    }
}

/// JSON-file backed seen-set
#[derive(Debug)]
pub struct SeenStore {
    path: PathBuf,
    entries: HashMap<ListingId, SeenEntry>,
}

impl SeenStore {
    /// Load the seen-set from `path`. Never fails: a missing or unusable file
    /// yields an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => StoredShape::classify(value).into_entries(&path),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Seen-set file is not valid JSON, starting from an empty set");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No seen-set file yet, it will be created");
                HashMap::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read seen-set file, starting from an empty set");
                HashMap::new()
            }
        };

        if !entries.is_empty() {
            info!("{} already handled listings loaded from {}", entries.len(), path.display());
        }

        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &ListingId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &ListingId) -> Option<&SeenEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SeenEntry> {
        self.entries.values()
    }

    /// Insert or overwrite the entry for `id`. Callers must `persist` before moving on.
    pub fn mark(&mut self, id: ListingId, timestamp: DateTime<Local>) {
        let entry = SeenEntry {
            listing_id: id.clone(),
            first_seen_at: timestamp.to_rfc3339(),
        };
        self.entries.insert(id, entry);
    }

    /// Atomically overwrite the backing file with the full set
    pub fn persist(&self) -> Result<(), StoreError> {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(id, entry)| (id.to_string(), Value::String(entry.first_seen_at.clone())))
            .collect();
        write_json_atomic(&self.path, &map)?;
        debug!("{} ids saved to {}", self.entries.len(), self.path.display());
        Ok(())
    }

    /// Mark `id` as handled now and persist immediately. A failed write is
    /// logged; the next successful persist carries this entry too.
    pub fn record(&mut self, id: &ListingId) {
        self.mark(id.clone(), Local::now());
        if let Err(e) = self.persist() {
            warn!(listing_id = %id, error = %e, "Could not persist seen-set, will retry on next change");
        }
    }

    /// Forget every entry. Only called on explicit operator request.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Copy the current file to a timestamped backup next to it and keep only
    /// the `keep` most recent backups. Returns `None` when there is no file yet.
    pub fn backup(&self, keep: usize) -> Result<Option<PathBuf>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!("{}_backup_", self.file_stem());
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let mut backup = dir.join(format!("{}{}.json", prefix, stamp));
        // same-second backups get a counter suffix, which still sorts after the plain name
        let mut counter = 1;
        while backup.exists() {
            backup = dir.join(format!("{}{}_{:02}.json", prefix, stamp, counter));
            counter += 1;
        }

        fs::copy(&self.path, &backup).map_err(|e| StoreError::io(&backup, e))?;
        info!(backup = %backup.display(), "Seen-set backup created");

        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| StoreError::io(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        // timestamped names sort chronologically
        backups.sort();

        if backups.len() > keep {
            for old in &backups[..backups.len() - keep] {
                match fs::remove_file(old) {
                    Ok(()) => debug!(backup = %old.display(), "Old seen-set backup removed"),
                    Err(e) => warn!(backup = %old.display(), error = %e, "Could not remove old backup"),
                }
            }
        }

        Ok(Some(backup))
    }

    fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("seen")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeenStore::load(dir.path().join("scraped_properties.json"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_canonical_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        fs::write(&path, r#"{ "21609160": "2025-12-22T10:15:00.123456", "1234": null }"#).unwrap();

        let store = SeenStore::load(&path);
        assert_eq!(store.len(), 2);
        let entry = store.get(&ListingId::from("21609160")).unwrap();
        assert!(entry.first_seen().is_some());
        assert_eq!(store.get(&ListingId::from("1234")).unwrap().first_seen_at, "");
    }

    #[test]
    fn test_legacy_array_is_coerced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        fs::write(&path, r#"["111", "222", 333]"#).unwrap();

        let store = SeenStore::load(&path);
        for id in ["111", "222", "333"] {
            assert!(store.contains(&ListingId::from(id)), "missing {id}");
        }
        assert_eq!(store.get(&ListingId::from("111")).unwrap().first_seen_at, "");
        assert!(store.get(&ListingId::from("111")).unwrap().first_seen().is_none());

        // rewritten in canonical form on the next persist
        store.persist().unwrap();
        assert_eq!(read_json(&path), json!({ "111": "", "222": "", "333": "" }));
    }

    #[test]
    fn test_unrecognized_or_corrupt_file_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");

        fs::write(&path, "42").unwrap();
        assert!(SeenStore::load(&path).is_empty());

        fs::write(&path, "{ not json").unwrap();
        assert!(SeenStore::load(&path).is_empty());
    }

    #[test]
    fn test_mark_persist_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");

        let mut store = SeenStore::load(&path);
        store.record(&ListingId::from("A"));
        store.record(&ListingId::from("B"));
        // simulated crash: the in-memory store is dropped without any final save
        drop(store);

        let reloaded = SeenStore::load(&path);
        assert!(reloaded.contains(&ListingId::from("A")));
        assert!(reloaded.contains(&ListingId::from("B")));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_mark_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SeenStore::load(dir.path().join("seen.json"));
        let id = ListingId::from("A");
        let earlier = Local.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();

        store.mark(id.clone(), earlier);
        store.mark(id.clone(), Local::now());

        assert_eq!(store.len(), 1);
        assert!(store.get(&id).unwrap().first_seen().unwrap() > earlier.fixed_offset());
    }

    #[test]
    fn test_reset_then_persist_writes_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seen.json");
        let mut store = SeenStore::load(&path);
        store.record(&ListingId::from("A"));

        store.reset();
        store.persist().unwrap();

        assert!(store.is_empty());
        assert_eq!(read_json(&path), json!({}));
    }

    #[test]
    fn test_backup_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraped_properties.json");
        let mut store = SeenStore::load(&path);
        assert!(store.backup(2).unwrap().is_none());

        store.record(&ListingId::from("A"));
        for stamp in ["20240101_000000", "20240102_000000", "20240103_000000"] {
            fs::write(dir.path().join(format!("scraped_properties_backup_{stamp}.json")), "{}").unwrap();
        }

        let backup = store.backup(2).unwrap().unwrap();
        assert_eq!(read_json(&backup), json!({ "A": store.get(&ListingId::from("A")).unwrap().first_seen_at }));

        let remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("scraped_properties_backup_"))
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().any(|n| n.contains("20240103")));
        assert!(!remaining.iter().any(|n| n.contains("20240101")));
    }

    #[test]
    fn test_backups_in_the_same_second_do_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scraped_properties.json");
        let mut store = SeenStore::load(&path);
        store.record(&ListingId::from("A"));

        let first = store.backup(10).unwrap().unwrap();
        store.record(&ListingId::from("B"));
        let second = store.backup(10).unwrap().unwrap();
        store.record(&ListingId::from("C"));
        let third = store.backup(10).unwrap().unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(read_json(&first).as_object().unwrap().len(), 1);
        assert_eq!(read_json(&second).as_object().unwrap().len(), 2);
        assert_eq!(read_json(&third).as_object().unwrap().len(), 3);
    }
}
