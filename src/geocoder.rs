use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::errors::{AppError, AppResult};

const STATUS_OK: &str = "OK";
const STATUS_ZERO_RESULTS: &str = "ZERO_RESULTS";

/// Latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    PostalComponents,
    FreeTextAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeocodeQuery {
    /// Structured filter on postal code and country.
    PostalComponents {
        postal_code: String,
        country_code: String,
    },
    /// Free-text address biased toward a region.
    FreeTextAddress { address: String, region: String },
}

impl GeocodeQuery {
    pub fn strategy(&self) -> QueryStrategy {
        match self {
            GeocodeQuery::PostalComponents { .. } => QueryStrategy::PostalComponents,
            GeocodeQuery::FreeTextAddress { .. } => QueryStrategy::FreeTextAddress,
        }
    }

    fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            GeocodeQuery::PostalComponents {
                postal_code,
                country_code,
            } => vec![(
                "components",
                format!("country:{country_code}|postal_code:{postal_code}"),
            )],
            GeocodeQuery::FreeTextAddress { address, region } => {
                vec![("address", address.clone()), ("region", region.clone())]
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeResult {
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    pub location: Coordinate,
}

impl GeocodeResponse {
    pub fn ok(locations: impl IntoIterator<Item = Coordinate>) -> Self {
        Self {
            status: STATUS_OK.into(),
            results: locations
                .into_iter()
                .map(|location| GeocodeResult {
                    geometry: Geometry { location },
                })
                .collect(),
            error_message: None,
        }
    }

    pub fn with_status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            results: Vec::new(),
            error_message: None,
        }
    }

    /// First result's location, only for a successful status.
    pub fn first_location(&self) -> Option<Coordinate> {
        if self.status != STATUS_OK {
            return None;
        }
        self.results.first().map(|result| result.geometry.location)
    }

    fn is_service_error(&self) -> bool {
        self.status != STATUS_OK && self.status != STATUS_ZERO_RESULTS
    }
}

/// Executes a single geocoding query against the external service.
#[async_trait]
pub trait GeocodeTransport: Send + Sync {
    async fn execute(&self, query: &GeocodeQuery) -> AppResult<GeocodeResponse>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    Resolved {
        coordinate: Coordinate,
        strategy: QueryStrategy,
    },
    /// The service answered, but no query produced a usable result.
    NoResult,
    /// Every attempted query failed at the transport or service level.
    Failed { reason: String },
}

impl ResolveOutcome {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            ResolveOutcome::Resolved { coordinate, .. } => Some(*coordinate),
            _ => None,
        }
    }
}

pub struct GeocodeResolver {
    transport: Arc<dyn GeocodeTransport>,
    country_code: String,
    country_name: String,
    query_timeout: Option<Duration>,
}

impl GeocodeResolver {
    pub fn new(
        transport: Arc<dyn GeocodeTransport>,
        country_code: impl Into<String>,
        country_name: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            country_code: country_code.into(),
            country_name: country_name.into(),
            query_timeout: None,
        }
    }

    /// Bounds every single query, so a stalled structured query still leaves time
    /// for the free-text fallback.
    pub fn with_query_timeout(mut self, limit: Duration) -> Self {
        self.query_timeout = Some(limit);
        self
    }

    async fn execute(&self, query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
        match self.query_timeout {
            Some(limit) => timeout(limit, self.transport.execute(query))
                .await
                .unwrap_or_else(|_| Err(AppError::Timeout(limit))),
            None => self.transport.execute(query).await,
        }
    }

    /// Ordered fallback queries for a postal code and locality.
    pub fn queries(&self, postal_code: &str, locality: &str) -> Vec<GeocodeQuery> {
        let mut queries = Vec::with_capacity(2);
        if !postal_code.is_empty() {
            queries.push(GeocodeQuery::PostalComponents {
                postal_code: postal_code.to_string(),
                country_code: self.country_code.clone(),
            });
        }
        if !postal_code.is_empty() || !locality.is_empty() {
            let address = [postal_code, locality, self.country_name.as_str()]
                .iter()
                .filter(|part| !part.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            queries.push(GeocodeQuery::FreeTextAddress {
                address,
                region: self.country_code.to_ascii_lowercase(),
            });
        }
        queries
    }

    /// Tries each query in order and takes the first result of the first successful one.
    /// The location is returned whether or not it lies in any particular region.
    pub async fn resolve(&self, postal_code: &str, locality: &str) -> ResolveOutcome {
        let mut answered = false;
        let mut last_error = None;

        for query in self.queries(postal_code, locality) {
            let strategy = query.strategy();
            match self.execute(&query).await {
                Ok(response) => {
                    if let Some(coordinate) = response.first_location() {
                        trace!(postal_code, locality, ?strategy, ?coordinate, "geocode hit");
                        return ResolveOutcome::Resolved {
                            coordinate,
                            strategy,
                        };
                    }
                    if response.is_service_error() {
                        if response.status == "OVER_QUERY_LIMIT" {
                            warn!(postal_code, ?strategy, "geocoding service reports rate limit");
                        }
                        last_error = Some(match &response.error_message {
                            Some(message) => format!("status {}: {message}", response.status),
                            None => format!("status {}", response.status),
                        });
                    } else {
                        answered = true;
                    }
                    debug!(
                        postal_code,
                        locality,
                        ?strategy,
                        status = %response.status,
                        "geocode query produced no usable result"
                    );
                }
                Err(err) => {
                    debug!(
                        postal_code,
                        locality,
                        ?strategy,
                        error = %err,
                        "geocode query failed; trying next strategy"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        match last_error {
            Some(reason) if !answered => ResolveOutcome::Failed { reason },
            _ => ResolveOutcome::NoResult,
        }
    }
}

/// Google Geocoding API over HTTP.
pub struct GoogleGeocodingClient {
    http: Client,
    api_key: SecretString,
    endpoint: String,
}

impl GoogleGeocodingClient {
    pub fn new(api_key: SecretString, api_base: &str, timeout: Duration) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("roster-geocoder/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/json", api_base.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl GeocodeTransport for GoogleGeocodingClient {
    async fn execute(&self, query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
        let mut params = query.params();
        params.push(("key", self.api_key.expose_secret().to_string()));

        let response = self
            .http
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Stand-in used when no API key is configured: every query fails, so only cached
/// coordinates can resolve.
#[derive(Default)]
pub struct UnconfiguredTransport;

#[async_trait]
impl GeocodeTransport for UnconfiguredTransport {
    async fn execute(&self, _query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
        Err(AppError::Config(
            "no geocoding API key configured (GOOGLE_GEOCODING_API_KEY)".into(),
        ))
    }
}
