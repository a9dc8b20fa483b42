use crate::error::SourceError;
use crate::models::{LightListing, ListingId, ListingRecord};
use async_trait::async_trait;

/// Capability the monitor needs from a listing portal.
///
/// Implementations usually hold a single browser session with navigation
/// state, hence `&mut self`.
#[async_trait]
pub trait ListingSource: Send {
    /// Every listing id currently shown, in the portal's own order
    async fn list_ids(&mut self) -> Result<Vec<ListingId>, SourceError>;

    /// Cheap list-level metadata for one listing
    async fn extract_light(&mut self, id: &ListingId) -> Result<LightListing, SourceError>;

    /// Expensive detail extraction. `Ok(None)` means nothing usable came back.
    async fn extract_full(
        &mut self,
        id: &ListingId,
        skip_photos: bool,
    ) -> Result<Option<ListingRecord>, SourceError>;

    /// Get the name of the source
    fn source_name(&self) -> &'static str;
}
