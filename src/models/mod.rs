use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Identifier of one listing on the portal ("No Centris")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListingId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ListingId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// List-level metadata, read without opening the detail panel
#[derive(Debug, Clone)]
pub struct LightListing {
    pub listing_id: ListingId,
    pub submitted_date: Option<NaiveDate>,
    pub fields: Map<String, Value>,
}

/// Flat record produced by a full extraction.
///
/// The downstream API expects the portal's own field names, so the two fields
/// this crate reasons about are renamed on the wire and everything else rides
/// along untouched in `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    #[serde(rename = "numero_centris")]
    pub listing_id: String,
    #[serde(rename = "date_envoi", default)]
    pub submitted_date: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Key holding the list-level copy of the fields merged into a record
pub const LIST_DATA_KEY: &str = "_donnees_liste";

impl LightListing {
    pub fn new(listing_id: ListingId, submitted_date: Option<NaiveDate>) -> Self {
        Self {
            listing_id,
            submitted_date,
            fields: Map::new(),
        }
    }
}

impl ListingRecord {
    pub fn new(listing_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            submitted_date: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Whether the detail panel actually yielded something worth delivering
    pub fn has_detail(&self, skip_photos: bool) -> bool {
        let financial = self
            .get("donnees_financieres")
            .map(has_meaningful_leaf)
            .unwrap_or(false);
        let source = self
            .get("source")
            .and_then(Value::as_str)
            .map(|s| !s.trim().is_empty())
            .unwrap_or(false);
        let photos = !skip_photos
            && self
                .get("photo_urls")
                .and_then(Value::as_array)
                .map(|urls| !urls.is_empty())
                .unwrap_or(false);

        financial || source || photos
    }

    /// Replace nulls (and non-string scalars) with strings for the given keys,
    /// both at the top level and inside the list-level copy.
    pub fn normalize_for_api(&mut self, keys: &[String]) {
        normalize_keys(&mut self.fields, keys);
        if let Some(Value::Object(list_data)) = self.fields.get_mut(LIST_DATA_KEY) {
            normalize_keys(list_data, keys);
        }
    }
}

fn normalize_keys(map: &mut Map<String, Value>, keys: &[String]) {
    for key in keys {
        if let Some(value) = map.get_mut(key) {
            match value {
                Value::Null => *value = Value::String(String::new()),
                Value::Bool(b) => *value = Value::String(b.to_string()),
                Value::Number(n) => *value = Value::String(n.to_string()),
                Value::String(_) | Value::Array(_) | Value::Object(_) => {}
            }
        }
    }
}

fn has_meaningful_leaf(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => items.iter().any(has_meaningful_leaf),
        Value::Object(map) => map.values().any(has_meaningful_leaf),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Per-cycle counters, appended to the stats history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleStats {
    pub timestamp: DateTime<Local>,
    pub total_listings: usize,
    pub new_listings: usize,
    pub scraped_successfully: usize,
    pub sent_to_api: usize,
    pub errors: usize,
    #[serde(default)]
    pub delivery_failures: usize,
    #[serde(default)]
    pub filtered_out: usize,
    #[serde(default)]
    pub partial: usize,
}

impl CycleStats {
    pub fn new() -> Self {
        Self {
            timestamp: Local::now(),
            total_listings: 0,
            new_listings: 0,
            scraped_successfully: 0,
            sent_to_api: 0,
            errors: 0,
            delivery_failures: 0,
            filtered_out: 0,
            partial: 0,
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_wire_names() {
        let record = ListingRecord::new("21609160")
            .with_field("prix", json!("549000"))
            .with_field("ville", json!("Québec"));
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["numero_centris"], "21609160");
        assert_eq!(value["prix"], "549000");
        assert!(value.get("listing_id").is_none());

        let back: ListingRecord = serde_json::from_value(json!({
            "numero_centris": "1",
            "date_envoi": "2025-12-22",
            "adresse": "12 Rue Principale"
        }))
        .unwrap();
        assert_eq!(back.submitted_date.as_deref(), Some("2025-12-22"));
        assert_eq!(back.get("adresse"), Some(&json!("12 Rue Principale")));
    }

    #[test]
    fn test_has_detail_sources() {
        let empty_financials = ListingRecord::new("1").with_field(
            "donnees_financieres",
            json!({ "revenus_bruts_potentiels": { "total": null }, "revenus_nets_exploitation": null }),
        );
        assert!(!empty_financials.has_detail(false));

        let financials = ListingRecord::new("1").with_field(
            "donnees_financieres",
            json!({ "revenus_nets_exploitation": "42000" }),
        );
        assert!(financials.has_detail(false));

        let source = ListingRecord::new("1").with_field("source", json!("RAY HARVEY & ASSOCIÉS Agence immobilière"));
        assert!(source.has_detail(false));

        let blank_source = ListingRecord::new("1").with_field("source", json!("  "));
        assert!(!blank_source.has_detail(false));
    }

    #[test]
    fn test_has_detail_photos_can_be_skipped() {
        let photos = ListingRecord::new("1").with_field("photo_urls", json!(["https://x/1.jpg"]));
        assert!(photos.has_detail(false));
        assert!(!photos.has_detail(true));

        let no_photos = ListingRecord::new("1").with_field("photo_urls", json!([]));
        assert!(!no_photos.has_detail(false));
    }

    #[test]
    fn test_normalize_for_api() {
        let keys: Vec<String> = ["quartier", "annee_construction", "statut"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut record = ListingRecord::new("1")
            .with_field("quartier", Value::Null)
            .with_field("annee_construction", json!(1978))
            .with_field("prix", Value::Null)
            .with_field(LIST_DATA_KEY, json!({ "statut": null, "quartier": "Limoilou" }));

        record.normalize_for_api(&keys);

        assert_eq!(record.get("quartier"), Some(&json!("")));
        assert_eq!(record.get("annee_construction"), Some(&json!("1978")));
        // only configured keys are touched
        assert_eq!(record.get("prix"), Some(&Value::Null));
        assert!(record.get("statut").is_none());
        assert_eq!(record.get(LIST_DATA_KEY).unwrap()["statut"], json!(""));
        assert_eq!(record.get(LIST_DATA_KEY).unwrap()["quartier"], json!("Limoilou"));
    }
}
