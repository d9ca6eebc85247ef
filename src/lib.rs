pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod geocoder;
pub mod ingestion;
pub mod markers;
pub mod postcode;
pub mod region;
pub mod report;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use batch::{BatchOrchestrator, BatchProgress, BatchSummary, LookupOutcome, ProgressObserver};
pub use cache::{CacheStore, FlushOutcome, GeocodeCache, JsonFileStore, MemoryStore};
pub use config::{AppConfig, CacheBackend, PublicAppConfig};
pub use db::SqliteStore;
pub use dispatcher::{DispatchReport, RateLimitedDispatcher};
pub use errors::{AppError, AppResult};
pub use geocoder::{
    Coordinate, GeocodeResolver, GeocodeTransport, GoogleGeocodingClient, ResolveOutcome,
    UnconfiguredTransport,
};
pub use ingestion::Row;
pub use markers::{build_markers, facets, filter_rows, Facets, Marker, MarkerFilter};
pub use postcode::normalize_postcode;
pub use region::BoundingRegion;
pub use report::{build_report, write_filtered_csv, write_report, Counts, Report};

/// Fully wired pipeline: cache store, transport, dispatcher and orchestrator built
/// from one `AppConfig`.
pub struct GeocodingApp {
    orchestrator: BatchOrchestrator,
    region: BoundingRegion,
    profile: PublicAppConfig,
}

impl GeocodingApp {
    /// `no_cache` swaps the configured store for a process-local one.
    pub fn from_config(config: &AppConfig, no_cache: bool) -> AppResult<Self> {
        let store = open_store(config, no_cache)?;
        let cache = Arc::new(GeocodeCache::load(store));

        let transport: Arc<dyn GeocodeTransport> = match &config.geocoding_api_key {
            Some(key) => Arc::new(GoogleGeocodingClient::new(
                key.clone(),
                &config.geocoding_api_base,
                config.http_timeout(),
            )?),
            None => {
                warn!("GOOGLE_GEOCODING_API_KEY is not set; only cached rows will resolve");
                Arc::new(UnconfiguredTransport)
            }
        };

        Ok(Self::with_parts(cache, transport, config))
    }

    /// Builds the pipeline around caller-provided cache and transport.
    pub fn with_parts(
        cache: Arc<GeocodeCache>,
        transport: Arc<dyn GeocodeTransport>,
        config: &AppConfig,
    ) -> Self {
        let resolver = Arc::new(
            GeocodeResolver::new(
                transport,
                config.country_code.clone(),
                config.country_name.clone(),
            )
            .with_query_timeout(config.http_timeout()),
        );
        let dispatcher = RateLimitedDispatcher::new(config.geocode_concurrency, config.pacing());
        info!(
            width = dispatcher.width(),
            pacing = ?dispatcher.pacing(),
            lookup_timeout = ?config.lookup_timeout(),
            cached = cache.len(),
            "geocoding pipeline ready"
        );

        Self {
            orchestrator: BatchOrchestrator::new(cache, resolver, dispatcher, config.lookup_timeout()),
            region: config.region,
            profile: config.public_profile(),
        }
    }

    pub async fn resolve(&self, rows: &mut [Row], observer: Option<ProgressObserver>) -> BatchSummary {
        self.orchestrator.resolve_all(rows, observer).await
    }

    pub fn markers(&self, rows: &[Row], filter: &MarkerFilter) -> Vec<Marker> {
        build_markers(rows, filter, &self.region)
    }

    pub fn region(&self) -> BoundingRegion {
        self.region
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        self.orchestrator.cache()
    }

    pub fn profile(&self) -> &PublicAppConfig {
        &self.profile
    }
}

fn open_store(config: &AppConfig, no_cache: bool) -> AppResult<Arc<dyn CacheStore>> {
    if no_cache {
        return Ok(Arc::new(MemoryStore::default()));
    }
    let store: Arc<dyn CacheStore> = match config.cache_backend {
        CacheBackend::File => Arc::new(JsonFileStore::new(config.cache_path.clone())),
        CacheBackend::Sqlite => {
            let store = SqliteStore::open(&config.cache_path)?;
            if store.recovered() {
                warn!(path = %config.cache_path.display(), "geocode cache database was recreated");
            }
            Arc::new(store)
        }
        CacheBackend::Memory => Arc::new(MemoryStore::default()),
    };
    info!(store = %store.describe(), "geocode cache store opened");
    Ok(store)
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,roster_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::geocoder::{GeocodeQuery, GeocodeResponse};

    /// Structured query stalls until the HTTP timeout and errors; free text answers late.
    struct SlowFallbackTransport {
        http_timeout: Duration,
    }

    #[async_trait]
    impl GeocodeTransport for SlowFallbackTransport {
        async fn execute(&self, query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
            match query {
                GeocodeQuery::PostalComponents { .. } => {
                    tokio::time::sleep(self.http_timeout).await;
                    Err(AppError::Timeout(self.http_timeout))
                }
                GeocodeQuery::FreeTextAddress { .. } => {
                    tokio::time::sleep(Duration::from_secs(6)).await;
                    Ok(GeocodeResponse::ok([Coordinate::new(53.2, 5.8)]))
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn default_budget_leaves_room_for_the_fallback_query() {
        let config = AppConfig::default();
        let transport = Arc::new(SlowFallbackTransport {
            http_timeout: config.http_timeout(),
        });
        let cache = Arc::new(GeocodeCache::load(Arc::new(MemoryStore::default())));
        let app = GeocodingApp::with_parts(cache, transport, &config);
        assert_eq!(app.region(), BoundingRegion::FRIESLAND);
        assert_eq!(app.profile().lookup_timeout_ms, config.lookup_timeout_ms);

        let mut rows = vec![Row {
            id: 1,
            organization: "VV Cambuur".into(),
            sport: "Voetbal".into(),
            federation: "KNVB".into(),
            address: "Sportlaan 1".into(),
            postal_code: "8911 AB".into(),
            locality: "Leeuwarden".into(),
            municipality: "Leeuwarden".into(),
            coordinate: None,
        }];
        let summary = app.resolve(&mut rows, None).await;

        assert_eq!(summary.timed_out, 0);
        assert_eq!(rows[0].coordinate, Some(Coordinate::new(53.2, 5.8)));
    }
}
