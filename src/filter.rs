use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::debug;

/// Rejects listings submitted before a cutoff date
#[derive(Debug, Clone, Copy, Default)]
pub struct DateFilter {
    cutoff: Option<NaiveDate>,
}

impl DateFilter {
    pub fn new(cutoff: Option<NaiveDate>) -> Self {
        Self { cutoff }
    }

    pub fn cutoff(&self) -> Option<NaiveDate> {
        self.cutoff
    }

    /// A listing with no known submission date is accepted.
    pub fn accept(&self, submitted: Option<NaiveDate>) -> bool {
        match (self.cutoff, submitted) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(cutoff), Some(date)) => date >= cutoff,
        }
    }
}

/// Parse a submission date as shown by the portal (or by hand-edited records).
pub fn parse_submitted_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    for format in ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.date_naive());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.date());
    }

    debug!(raw, "Unrecognized submission date");
    None
}
