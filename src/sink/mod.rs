//! Delivery of completed listing records to the downstream API.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, info};

use crate::config::ApiConfig;
use crate::error::SinkError;
use crate::models::ListingRecord;

/// Length of response bodies kept in errors and logs
const BODY_PREVIEW_LEN: usize = 200;

/// Outcome of an accepted delivery
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// None when nothing was actually sent
    pub status_code: Option<u16>,
    pub body: String,
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, record: &ListingRecord) -> Result<Delivery, SinkError>;
}

/// POSTs records as JSON to the configured endpoint
pub struct HttpSink {
    client: Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: &str, config: &ApiConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_str(name)
                .with_context(|| format!("Invalid header name: {}", name))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, record: &ListingRecord) -> Result<Delivery, SinkError> {
        debug!(listing_id = %record.listing_id, endpoint = %self.endpoint, "Posting record");

        let response = self
            .client
            .post(&self.endpoint)
            .json(record)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => preview(&body),
            Err(e) => {
                debug!(listing_id = %record.listing_id, error = %e, "Could not read response body");
                String::new()
            }
        };

        if status.is_success() {
            Ok(Delivery {
                status_code: Some(status.as_u16()),
                body,
            })
        } else {
            Err(SinkError::Status {
                code: status.as_u16(),
                body,
            })
        }
    }
}

fn classify(error: reqwest::Error) -> SinkError {
    if error.is_timeout() {
        SinkError::Timeout
    } else if error.is_connect() {
        SinkError::Connection(error.to_string())
    } else {
        SinkError::Request(error.to_string())
    }
}

fn preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_LEN).collect()
}

/// Used when no endpoint is configured: records stay local
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn send(&self, record: &ListingRecord) -> Result<Delivery, SinkError> {
        info!(listing_id = %record.listing_id, "No API endpoint configured, record not sent");
        Ok(Delivery {
            status_code: None,
            body: String::new(),
        })
    }
}

/// Build the sink for this configuration
pub fn from_config(config: &ApiConfig) -> Result<Box<dyn Sink>> {
    match &config.endpoint {
        Some(endpoint) => Ok(Box::new(HttpSink::new(endpoint, config)?)),
        None => Ok(Box::new(NullSink)),
    }
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Box<T> {
    async fn send(&self, record: &ListingRecord) -> Result<Delivery, SinkError> {
        (**self).send(record).await
    }
}
