//! The monitoring cycle: discover, filter, extract, deliver, record.

pub mod archive;
pub mod runner;
pub mod stats;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{MonitorError, SinkError, SourceError};
use crate::filter::DateFilter;
use crate::models::{CycleStats, ListingId, ListingRecord};
use crate::scrapers::ListingSource;
use crate::seen::SeenStore;
use crate::sink::{Delivery, Sink};

pub use archive::Archive;
pub use runner::{supervise, RunSummary, Runner};
pub use stats::StatsHistory;

/// What a forced reprocess of one listing produced
#[derive(Debug)]
pub enum ForceOutcome {
    /// Nothing usable came back; the listing is left as it was
    Unavailable,
    /// The panel showed another listing; discarded
    IdentityMismatch { found: String },
    /// Recorded, but too little detail to deliver
    Partial,
    /// Recorded; delivery was not requested
    Extracted(ListingRecord),
    Delivered(Delivery),
    DeliveryFailed(SinkError),
}

/// Outcome of one listing within a cycle
enum Step {
    Filtered,
    Failed,
    Partial,
    Delivered,
    DeliveryFailed,
}

/// Runs cycles against one source session.
///
/// The monitor owns everything with state (source session, seen-set, stats
/// history) and borrows the configuration for its whole life.
pub struct Monitor<'a, S, K> {
    source: S,
    sink: K,
    seen: SeenStore,
    history: StatsHistory,
    archive: Option<Archive>,
    config: &'a Config,
    filter: DateFilter,
}

impl<'a, S: ListingSource, K: Sink> Monitor<'a, S, K> {
    pub fn new(config: &'a Config, source: S, sink: K, seen: SeenStore) -> Self {
        let history = StatsHistory::load(&config.monitor.stats_file, config.monitor.stats_history_len);
        let archive = config.monitor.archive_dir.as_ref().map(|dir| Archive::new(dir.clone()));

        Self {
            source,
            sink,
            seen,
            history,
            archive,
            config,
            filter: DateFilter::new(config.monitor.min_submitted_date),
        }
    }

    pub fn seen(&self) -> &SeenStore {
        &self.seen
    }

    pub fn history(&self) -> &StatsHistory {
        &self.history
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Run one full pass over the listings currently shown.
    ///
    /// Only a lost browser session escapes as an error; everything else is
    /// counted in the returned stats.
    pub async fn run_cycle(&mut self) -> Result<CycleStats, MonitorError> {
        let mut stats = CycleStats::new();
        info!(source = self.source.source_name(), "Starting monitoring cycle");

        let current = match self.source.list_ids().await {
            Ok(ids) => ids,
            Err(SourceError::Session(reason)) => {
                return Err(MonitorError::Session(SourceError::Session(reason)))
            }
            Err(e) => {
                error!(error = %e, "Could not list current listings, retrying next cycle");
                stats.errors = 1;
                self.finish(&stats);
                return Ok(stats);
            }
        };

        let mut discovered: Vec<ListingId> = Vec::with_capacity(current.len());
        for id in current {
            if !discovered.contains(&id) {
                discovered.push(id);
            }
        }
        stats.total_listings = discovered.len();

        let mut new_ids: Vec<ListingId> = discovered
            .into_iter()
            .filter(|id| !self.seen.contains(id))
            .collect();
        stats.new_listings = new_ids.len();
        info!(
            "{} listings on the portal, {} new",
            stats.total_listings, stats.new_listings
        );

        // 0 means no cap, as in older config files
        if let Some(cap) = self.config.monitor.max_listings_per_cycle.filter(|&cap| cap > 0) {
            if new_ids.len() > cap {
                info!("Processing the first {} new listings this cycle", cap);
                new_ids.truncate(cap);
            }
        }

        let mut extracted_any = false;
        for (index, id) in new_ids.iter().enumerate() {
            info!(listing_id = %id, "Listing {}/{}", index + 1, new_ids.len());

            match self.process(id, &mut extracted_any).await? {
                Step::Filtered => stats.filtered_out += 1,
                Step::Failed => stats.errors += 1,
                Step::Partial => {
                    stats.scraped_successfully += 1;
                    stats.partial += 1;
                }
                Step::Delivered => {
                    stats.scraped_successfully += 1;
                    stats.sent_to_api += 1;
                }
                Step::DeliveryFailed => {
                    stats.scraped_successfully += 1;
                    stats.delivery_failures += 1;
                }
            }
        }

        self.finish(&stats);
        Ok(stats)
    }

    async fn process(&mut self, id: &ListingId, extracted_any: &mut bool) -> Result<Step, MonitorError> {
        let light = match self.source.extract_light(id).await {
            Ok(light) => light,
            Err(e) => return failed(id, e),
        };

        if !self.filter.accept(light.submitted_date) {
            info!(
                listing_id = %id,
                submitted = ?light.submitted_date,
                cutoff = ?self.filter.cutoff(),
                "Submitted before the cutoff, skipping"
            );
            self.seen.record(id);
            return Ok(Step::Filtered);
        }

        if *extracted_any {
            sleep(self.config.monitor.listing_delay()).await;
        }
        *extracted_any = true;

        let skip_photos = self.config.monitor.skip_photos;
        let mut record = match self.source.extract_full(id, skip_photos).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(listing_id = %id, "No data extracted, will retry next cycle");
                return Ok(Step::Failed);
            }
            Err(e) => return failed(id, e),
        };

        if record.listing_id != id.as_str() {
            error!(
                listing_id = %id,
                found = %record.listing_id,
                "Extracted record belongs to another listing, discarding"
            );
            return Ok(Step::Failed);
        }

        self.archive(&record);

        if !record.has_detail(skip_photos) {
            warn!(listing_id = %id, "No detail extracted, recorded without sending");
            self.seen.record(id);
            return Ok(Step::Partial);
        }

        let step = match self.deliver(&mut record).await {
            Ok(_) => Step::Delivered,
            Err(_) => Step::DeliveryFailed,
        };
        self.seen.record(id);
        Ok(step)
    }

    async fn deliver(&self, record: &mut ListingRecord) -> Result<Delivery, SinkError> {
        record.normalize_for_api(&self.config.api.normalize_fields);

        match self.sink.send(record).await {
            Ok(delivery) => {
                info!(
                    listing_id = %record.listing_id,
                    status = ?delivery.status_code,
                    "Record delivered"
                );
                Ok(delivery)
            }
            Err(e) => {
                error!(
                    listing_id = %record.listing_id,
                    kind = e.kind(),
                    error = %e,
                    "Delivery failed"
                );
                Err(e)
            }
        }
    }

    fn archive(&self, record: &ListingRecord) {
        if let Some(archive) = &self.archive {
            match archive.save(record) {
                Ok(path) => debug!(listing_id = %record.listing_id, path = %path.display(), "Record archived"),
                Err(e) => warn!(listing_id = %record.listing_id, error = %e, "Could not archive record"),
            }
        }
    }

    fn finish(&mut self, stats: &CycleStats) {
        info!(
            total = stats.total_listings,
            new = stats.new_listings,
            scraped = stats.scraped_successfully,
            sent = stats.sent_to_api,
            errors = stats.errors,
            delivery_failures = stats.delivery_failures,
            filtered = stats.filtered_out,
            partial = stats.partial,
            "Cycle summary"
        );
        if let Err(e) = self.history.append(stats.clone()) {
            warn!(path = %self.history.path().display(), error = %e, "Could not save cycle stats");
        }
    }

    /// Reprocess one listing regardless of the seen-set and the date filter.
    pub async fn force(&mut self, id: &ListingId, deliver: bool) -> Result<ForceOutcome, MonitorError> {
        let skip_photos = self.config.monitor.skip_photos;
        info!(listing_id = %id, deliver, "Forced reprocess");

        let mut record = match self.source.extract_full(id, skip_photos).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(listing_id = %id, "No data extracted");
                return Ok(ForceOutcome::Unavailable);
            }
            Err(SourceError::Session(reason)) => {
                return Err(MonitorError::Session(SourceError::Session(reason)))
            }
            Err(e) => {
                error!(listing_id = %id, error = %e, "Extraction failed");
                return Ok(ForceOutcome::Unavailable);
            }
        };

        if record.listing_id != id.as_str() {
            error!(listing_id = %id, found = %record.listing_id, "Extracted record belongs to another listing");
            return Ok(ForceOutcome::IdentityMismatch {
                found: record.listing_id,
            });
        }

        self.archive(&record);
        let has_detail = record.has_detail(skip_photos);

        let outcome = if !has_detail {
            warn!(listing_id = %id, "No detail extracted, not sending");
            ForceOutcome::Partial
        } else if !deliver {
            ForceOutcome::Extracted(record)
        } else {
            match self.deliver(&mut record).await {
                Ok(delivery) => ForceOutcome::Delivered(delivery),
                Err(e) => ForceOutcome::DeliveryFailed(e),
            }
        };

        self.seen.record(id);
        Ok(outcome)
    }
}

/// Per-listing failure: counted and retried next cycle, unless the session itself is gone
fn failed(id: &ListingId, e: SourceError) -> Result<Step, MonitorError> {
    match e {
        SourceError::Session(_) => Err(MonitorError::Session(e)),
        other => {
            error!(listing_id = %id, error = %other, "Extraction failed, will retry next cycle");
            Ok(Step::Failed)
        }
    }
}
