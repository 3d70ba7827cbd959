//! IP geolocation lookup client.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Location attributes returned by a lookup service.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct GeoRecord {
    #[serde(default)]
    pub city: Option<String>,

    #[serde(default, alias = "region")]
    pub state: Option<String>,

    #[serde(default)]
    pub country: Option<String>,

    #[serde(default)]
    pub continent: Option<String>,

    #[serde(default, alias = "lon")]
    pub longitude: Option<f64>,

    #[serde(default, alias = "lat")]
    pub latitude: Option<f64>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    /// The service has no record for the address.
    #[error("no geolocation for {0}")]
    NotFound(IpAddr),

    #[error("geolocation lookup failed: {0}")]
    Transient(String),
}

#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoRecord, LookupError>;
}

/// Lookup over HTTP: `GET {base_url}/{ip}` answering with a JSON [`GeoRecord`].
pub struct HttpGeoLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGeoLookup {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLookup for HttpGeoLookup {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoRecord, LookupError> {
        let url = format!("{}/{}", self.base_url, ip);
        debug!(url = %url, "Looking up geolocation");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| LookupError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json::<GeoRecord>()
                .await
                .map_err(|e| LookupError::Transient(format!("invalid response body: {e}"))),
            StatusCode::NOT_FOUND => Err(LookupError::NotFound(ip)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LookupError::Transient(format!("{status} - {body}")))
            }
        }
    }
}
