pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod monitor;
pub mod scrapers;
pub mod seen;
pub mod sink;
pub mod storage;
