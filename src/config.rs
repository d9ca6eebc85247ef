use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::region::BoundingRegion;

const DEFAULT_GEOCODING_API_BASE: &str = "https://maps.googleapis.com/maps/api/geocode";
const DEFAULT_CONCURRENCY: usize = 5;
const MAX_CONCURRENCY: usize = 20;
const DEFAULT_PACING_MS: u64 = 200;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;
/// Queries one lookup may issue: structured, then free text.
const QUERIES_PER_LOOKUP: u64 = 2;
const LOOKUP_TIMEOUT_MARGIN_MS: u64 = 5_000;
const DEFAULT_LOOKUP_TIMEOUT_MS: u64 =
    QUERIES_PER_LOOKUP * DEFAULT_HTTP_TIMEOUT_MS + LOOKUP_TIMEOUT_MARGIN_MS;
const DEFAULT_JSON_CACHE_FILE: &str = "geocode-cache.json";
const DEFAULT_SQLITE_CACHE_FILE: &str = "geocode-cache.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    File,
    Sqlite,
    Memory,
}

impl CacheBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" | "json" => Some(CacheBackend::File),
            "sqlite" | "db" => Some(CacheBackend::Sqlite),
            "memory" | "none" => Some(CacheBackend::Memory),
            _ => None,
        }
    }

    fn default_path(&self) -> &'static str {
        match self {
            CacheBackend::Sqlite => DEFAULT_SQLITE_CACHE_FILE,
            CacheBackend::File | CacheBackend::Memory => DEFAULT_JSON_CACHE_FILE,
        }
    }
}

#[derive(Debug)]
pub struct AppConfig {
    pub geocoding_api_key: Option<SecretString>,
    pub geocoding_api_base: String,
    pub country_code: String,
    pub country_name: String,
    pub geocode_concurrency: usize,
    pub geocode_pacing_ms: u64,
    pub lookup_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub cache_backend: CacheBackend,
    pub cache_path: PathBuf,
    pub region: BoundingRegion,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoding_api_base: String,
    pub country_code: String,
    pub country_name: String,
    pub geocode_concurrency: usize,
    pub geocode_pacing_ms: u64,
    pub lookup_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub cache_backend: CacheBackend,
    pub cache_path: String,
    pub region: BoundingRegion,
    pub has_geocoding_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let cache_backend = env::var("CACHE_BACKEND")
            .ok()
            .and_then(|value| {
                let parsed = CacheBackend::parse(&value);
                if parsed.is_none() {
                    warn!(value = %value, "unknown CACHE_BACKEND; using file");
                }
                parsed
            })
            .unwrap_or(CacheBackend::File);
        let defaults = BoundingRegion::FRIESLAND;
        let http_timeout_ms =
            parse_u64("GEOCODE_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS).max(1);

        Self {
            geocoding_api_key: env::var("GOOGLE_GEOCODING_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            geocoding_api_base: env::var("GEOCODING_API_BASE")
                .unwrap_or_else(|_| DEFAULT_GEOCODING_API_BASE.to_string()),
            country_code: env::var("GEOCODE_COUNTRY_CODE").unwrap_or_else(|_| "NL".to_string()),
            country_name: env::var("GEOCODE_COUNTRY_NAME")
                .unwrap_or_else(|_| "Netherlands".to_string()),
            geocode_concurrency: parse_usize("GEOCODE_CONCURRENCY", DEFAULT_CONCURRENCY)
                .clamp(1, MAX_CONCURRENCY),
            geocode_pacing_ms: parse_u64("GEOCODE_PACING_MS", DEFAULT_PACING_MS),
            lookup_timeout_ms: lookup_budget_ms(
                parse_u64("GEOCODE_LOOKUP_TIMEOUT_MS", DEFAULT_LOOKUP_TIMEOUT_MS),
                http_timeout_ms,
            ),
            http_timeout_ms,
            cache_backend,
            cache_path: env::var("CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(cache_backend.default_path())),
            region: region_or_default(BoundingRegion::new(
                parse_f64("REGION_MIN_LAT", defaults.min_lat),
                parse_f64("REGION_MAX_LAT", defaults.max_lat),
                parse_f64("REGION_MIN_LNG", defaults.min_lng),
                parse_f64("REGION_MAX_LNG", defaults.max_lng),
            )),
        }
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.geocode_pacing_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoding_api_base: self.geocoding_api_base.clone(),
            country_code: self.country_code.clone(),
            country_name: self.country_name.clone(),
            geocode_concurrency: self.geocode_concurrency,
            geocode_pacing_ms: self.geocode_pacing_ms,
            lookup_timeout_ms: self.lookup_timeout_ms,
            http_timeout_ms: self.http_timeout_ms,
            cache_backend: self.cache_backend,
            cache_path: self.cache_path.to_string_lossy().to_string(),
            region: self.region,
            has_geocoding_key: self.geocoding_api_key.is_some(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoding_api_key: None,
            geocoding_api_base: DEFAULT_GEOCODING_API_BASE.to_string(),
            country_code: "NL".to_string(),
            country_name: "Netherlands".to_string(),
            geocode_concurrency: DEFAULT_CONCURRENCY,
            geocode_pacing_ms: DEFAULT_PACING_MS,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            cache_backend: CacheBackend::File,
            cache_path: PathBuf::from(DEFAULT_JSON_CACHE_FILE),
            region: BoundingRegion::FRIESLAND,
        }
    }
}

/// A lookup must outlast every query it may issue, each bounded by the HTTP timeout.
fn lookup_budget_ms(requested_ms: u64, http_timeout_ms: u64) -> u64 {
    let floor = QUERIES_PER_LOOKUP
        .saturating_mul(http_timeout_ms)
        .saturating_add(LOOKUP_TIMEOUT_MARGIN_MS);
    if requested_ms < floor {
        warn!(
            requested_ms,
            floor_ms = floor,
            "GEOCODE_LOOKUP_TIMEOUT_MS cannot cover the fallback query; raising it"
        );
    }
    requested_ms.max(floor)
}

fn region_or_default(region: BoundingRegion) -> BoundingRegion {
    if region.is_valid() {
        return region;
    }
    warn!(?region, "REGION_* bounds are inverted; using Friesland");
    BoundingRegion::FRIESLAND
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
