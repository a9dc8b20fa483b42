pub mod browser;
pub mod fields;
pub mod traits;

pub use browser::CentrisBrowserSource;
pub use traits::ListingSource;
