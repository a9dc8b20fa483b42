//! Text-level field extraction for the Centris Matrix portal.
//!
//! Best effort by nature: every field is optional and a missing match leaves
//! the field `null`. Nothing here decides what gets delivered.

use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};

use crate::models::{ListingId, ListingRecord, LIST_DATA_KEY};

/// Property types as they appear on listing cards, most specific first
const PROPERTY_TYPES: [&str; 7] = [
    "Quintuplex",
    "Quadruplex",
    "Triplex",
    "Duplex",
    "Maison",
    "Condominium",
    "Autre",
];

/// List-level fields that win over the detail panel when both are present
const LIST_PRIORITY_FIELDS: [&str; 9] = [
    "adresse",
    "ville",
    "arrondissement",
    "quartier",
    "type_propriete",
    "annee_construction",
    "numero_centris",
    "date_envoi",
    "statut",
];

const MAX_SOURCE_LEN: usize = 150;

struct Patterns {
    listing_id: Regex,
    price: Regex,
    address: Regex,
    city: Regex,
    neighborhood: Regex,
    year_built: Regex,
    submitted: Regex,
    photo_count: Regex,
    email: Regex,
    phone: Regex,
    lot_area: Regex,
    gross_potential: Regex,
    gross_effective: Regex,
    net_operating: Regex,
    total_expenses: Regex,
    source_agency: Regex,
    source_line: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |p: &str| Regex::new(p).expect("static field pattern");
        Patterns {
            listing_id: re(r"(?i)No\s*Centris\s*[:\-]?\s*(\d+)"),
            price: re(r"(\d[\d\s]*)\s*\$"),
            address: re(
                r"(?im)(\d+[A-Z]*(?:-\d+[A-Z]*)*\s+(?:Boul\.|Boulevard|Av\.|Avenue|Rue|Ch\.|Chemin|Route)\s+[^\n]+?)\s*(?:Québec|$)",
            ),
            city: re(r"Québec\s*\(([^)]+)\)"),
            neighborhood: re(r"(?i)quartier\s+([\p{L}\s\-/]+?)\s+construit"),
            year_built: re(r"(?i)construit\s+en\s+(\d{4})"),
            submitted: re(r"(?i)Date\s*d['’]envoi\s*[:\-]?\s*(\d{4}-\d{2}-\d{2})"),
            photo_count: re(r"(?i)photos?\s*\((\d+)\)"),
            email: re(r"([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})"),
            phone: re(r"(\d{3}[-.\s]?\d{3}[-.\s]?\d{4})"),
            lot_area: re(r"([\d\s,]+)\s*pi²"),
            gross_potential: re(r"(?i)Revenus?\s+bruts?\s+potentiels?\s*([\d\s,]+)\s*\$"),
            gross_effective: re(r"(?i)Revenus?\s+bruts?\s+effectifs?\s*([\d\s,]+)\s*\$"),
            net_operating: re(r"(?i)Revenus?\s+nets?\s+d['’]exploitation\s*([\d\s,]+)\s*\$"),
            total_expenses: re(r"(?i)Total\s+(?:des\s+)?dépenses[^\d\n]{0,20}([\d\s,]+)\s*\$"),
            source_agency: re(r"Source[^\p{Lu}]*(\p{Lu}[\p{L}0-9\s&\-',/\.]+?Agence immobilière)"),
            source_line: re(r"Source\s*:?\s*\n?\s*([^\n]{3,})"),
        }
    })
}

fn capture<'t>(re: &Regex, text: &'t str) -> Option<&'t str> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

fn clean_number(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

/// All listing ids mentioned in a page, first occurrence order, no duplicates
pub fn find_listing_ids(text: &str) -> Vec<ListingId> {
    let mut seen = std::collections::HashSet::new();
    patterns()
        .listing_id
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| seen.insert(id.clone()))
        .map(ListingId::new)
        .collect()
}

/// Fields visible on a listing card in the result list
pub fn parse_card(text: &str) -> Map<String, Value> {
    let p = patterns();
    let mut fields = Map::new();

    let price = capture(&p.price, text).map(clean_number).filter(|s| !s.is_empty());
    fields.insert("prix".into(), opt_string(price));

    let address = p
        .address
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| collapse_whitespace(m.as_str())))
        .find(|a| a.len() > 5 && a.chars().any(|c| c.is_ascii_digit()));
    fields.insert("adresse".into(), opt_string(address));

    match capture(&p.city, text) {
        Some(borough) => {
            fields.insert("ville".into(), json!("Québec"));
            fields.insert("arrondissement".into(), json!(borough));
        }
        None => {
            fields.insert("ville".into(), Value::Null);
            fields.insert("arrondissement".into(), Value::Null);
        }
    }

    let neighborhood = capture(&p.neighborhood, text).map(collapse_whitespace);
    fields.insert("quartier".into(), opt_string(neighborhood));

    let kind = PROPERTY_TYPES.iter().find(|t| text.contains(*t)).map(|t| t.to_string());
    fields.insert("type_propriete".into(), opt_string(kind));

    let year = capture(&p.year_built, text).map(str::to_string);
    fields.insert("annee_construction".into(), opt_string(year));

    let id = capture(&p.listing_id, text).map(str::to_string);
    fields.insert("numero_centris".into(), opt_string(id));

    let submitted = capture(&p.submitted, text).map(str::to_string);
    fields.insert("date_envoi".into(), opt_string(submitted));

    let status = if text.contains("Nouvelle annonce") {
        Some("Nouvelle annonce".to_string())
    } else if text.contains("Nouveau prix") {
        Some("Nouveau prix".to_string())
    } else {
        None
    };
    fields.insert("statut".into(), opt_string(status));

    fields
}

/// Fields from the opened detail panel
pub fn parse_detail(text: &str, photo_urls: Vec<String>) -> Map<String, Value> {
    let p = patterns();
    let mut fields = Map::new();

    let price = capture(&p.price, text).map(clean_number).filter(|s| !s.is_empty());
    fields.insert("prix".into(), opt_string(price));

    let id = capture(&p.listing_id, text).map(str::to_string);
    fields.insert("numero_centris".into(), opt_string(id));

    let submitted = capture(&p.submitted, text).map(str::to_string);
    fields.insert("date_envoi".into(), opt_string(submitted));

    let lot = capture(&p.lot_area, text).map(clean_number).filter(|s| !s.is_empty());
    fields.insert("superficie_terrain".into(), opt_string(lot));

    let photo_count = capture(&p.photo_count, text)
        .and_then(|n| n.parse::<u32>().ok())
        .unwrap_or(photo_urls.len() as u32);
    fields.insert("nb_photos".into(), json!(photo_count));
    fields.insert("photo_urls".into(), json!(photo_urls));

    let email = capture(&p.email, text).map(str::to_string);
    fields.insert("courtier_email".into(), opt_string(email));
    let phone = capture(&p.phone, text).map(str::to_string);
    fields.insert("courtier_telephone".into(), opt_string(phone));

    let money = |re: &Regex| opt_string(capture(re, text).map(clean_number).filter(|s| !s.is_empty()));
    fields.insert(
        "donnees_financieres".into(),
        json!({
            "revenus_bruts_potentiels": { "total": money(&p.gross_potential) },
            "revenus_bruts_effectifs": money(&p.gross_effective),
            "depenses_exploitation": { "total": money(&p.total_expenses) },
            "revenus_nets_exploitation": money(&p.net_operating),
        }),
    );

    fields.insert("source".into(), opt_string(parse_source(text)));

    fields
}

fn parse_source(text: &str) -> Option<String> {
    let p = patterns();
    let raw = capture(&p.source_agency, text).or_else(|| capture(&p.source_line, text))?;
    let mut source = collapse_whitespace(raw);
    source = source
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':') || c.is_whitespace())
        .to_string();
    if source.chars().count() > MAX_SOURCE_LEN {
        source = source.chars().take(MAX_SOURCE_LEN).collect::<String>().trim().to_string();
    }
    (!source.is_empty()).then_some(source)
}

/// Photo URLs from the detail panel HTML
pub fn photo_urls_from_html(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let img_selector = Selector::parse("img[src]").unwrap();

    let mut urls: Vec<String> = Vec::new();
    for img in document.select(&img_selector) {
        let Some(src) = img.value().attr("src") else {
            continue;
        };
        let lower = src.to_lowercase();
        let is_photo = src.starts_with("http")
            && (lower.contains("photo") || lower.contains("media") || lower.contains("image"))
            && !lower.contains("logo")
            && !lower.contains("icon");
        if is_photo && !urls.iter().any(|u| u == src) {
            urls.push(src.to_string());
        }
    }
    urls
}

/// Combine list-level and detail-level fields into one record for `id`.
///
/// The record's `listing_id` comes from what the detail panel says, not from
/// `id`, so a panel showing another listing is caught by the identity check.
pub fn merge(id: &ListingId, list: Map<String, Value>, detail: Map<String, Value>) -> ListingRecord {
    let mut combined = detail;

    for key in LIST_PRIORITY_FIELDS {
        let list_value = list.get(key).filter(|v| !is_empty(v));
        if let Some(value) = list_value {
            if key == "numero_centris" && !combined.get(key).map(is_empty).unwrap_or(true) {
                // keep the panel's own id so mismatches stay visible
                continue;
            }
            combined.insert(key.to_string(), value.clone());
        }
    }
    combined.insert(LIST_DATA_KEY.to_string(), Value::Object(list));

    let listing_id = match combined.remove("numero_centris") {
        Some(Value::String(found)) => found,
        _ => {
            tracing::debug!(listing_id = %id, "Detail panel shows no listing number");
            String::new()
        }
    };
    let submitted_date = match combined.remove("date_envoi") {
        Some(Value::String(date)) => Some(date),
        _ => None,
    };

    ListingRecord {
        listing_id,
        submitted_date,
        fields: combined,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
