use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{FlushOutcome, GeocodeCache};
use crate::dispatcher::RateLimitedDispatcher;
use crate::geocoder::{Coordinate, GeocodeResolver, ResolveOutcome};
use crate::ingestion::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub done: usize,
    pub total: usize,
}

pub type ProgressObserver = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Terminal state of one external lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Resolved(Coordinate),
    NoResult,
    Failed(String),
    TimedOut,
}

impl LookupOutcome {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match self {
            LookupOutcome::Resolved(coordinate) => Some(*coordinate),
            _ => None,
        }
    }
}

impl From<ResolveOutcome> for LookupOutcome {
    fn from(outcome: ResolveOutcome) -> Self {
        match outcome {
            ResolveOutcome::Resolved { coordinate, .. } => LookupOutcome::Resolved(coordinate),
            ResolveOutcome::NoResult => LookupOutcome::NoResult,
            ResolveOutcome::Failed { reason } => LookupOutcome::Failed(reason),
        }
    }
}

/// Row counters, except `lookups`, `timed_out` and `failed`, which count lookup jobs.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total_rows: usize,
    pub pending_rows: usize,
    pub cache_hits: usize,
    pub lookups: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub cache_flush_failures: usize,
    pub peak_in_flight: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchSummary {
    fn new(total_rows: usize, pending_rows: usize) -> Self {
        let now = Utc::now();
        Self {
            total_rows,
            pending_rows,
            cache_hits: 0,
            lookups: 0,
            resolved: 0,
            unresolved: 0,
            timed_out: 0,
            failed: 0,
            cache_flush_failures: 0,
            peak_in_flight: 0,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Rows waiting on the same cache key share one lookup.
struct LookupGroup {
    key: String,
    postal_code: String,
    locality: String,
    rows: Vec<usize>,
}

pub struct BatchOrchestrator {
    cache: Arc<GeocodeCache>,
    resolver: Arc<GeocodeResolver>,
    dispatcher: RateLimitedDispatcher,
    lookup_timeout: Duration,
}

impl BatchOrchestrator {
    pub fn new(
        cache: Arc<GeocodeCache>,
        resolver: Arc<GeocodeResolver>,
        dispatcher: RateLimitedDispatcher,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            resolver,
            dispatcher,
            lookup_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.cache
    }

    /// Attempts every row that has no coordinate yet. Cache hits are applied
    /// immediately; misses are looked up once per distinct cache key through the
    /// dispatcher. Progress is reported after each row reaches a terminal state.
    pub async fn resolve_all(
        &self,
        rows: &mut [Row],
        observer: Option<ProgressObserver>,
    ) -> BatchSummary {
        let pending: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.is_resolved())
            .map(|(idx, _)| idx)
            .collect();
        let total = pending.len();
        let mut summary = BatchSummary::new(rows.len(), total);
        if total == 0 {
            return summary;
        }

        let mut done = 0;
        let mut groups: Vec<LookupGroup> = Vec::new();
        let mut group_by_key: HashMap<String, usize> = HashMap::new();

        for idx in pending {
            let key = rows[idx].cache_key();
            if let Some(coordinate) = self.cache.get(&key) {
                rows[idx].coordinate = Some(coordinate);
                summary.cache_hits += 1;
                summary.resolved += 1;
                done += 1;
                notify(&observer, done, total);
                continue;
            }

            let row = &rows[idx];
            if self.resolver.queries(&row.postal_code, &row.locality).is_empty() {
                debug!(row = row.id, "row has neither postal code nor locality");
                summary.unresolved += 1;
                done += 1;
                notify(&observer, done, total);
                continue;
            }

            match group_by_key.get(&key) {
                Some(&group) => groups[group].rows.push(idx),
                None => {
                    group_by_key.insert(key.clone(), groups.len());
                    groups.push(LookupGroup {
                        key,
                        postal_code: row.postal_code.clone(),
                        locality: row.locality.clone(),
                        rows: vec![idx],
                    });
                }
            }
        }

        summary.lookups = groups.len();
        debug!(
            pending = total,
            cache_hits = summary.cache_hits,
            lookups = groups.len(),
            "dispatching geocode lookups"
        );

        let resolver: &GeocodeResolver = &self.resolver;
        let cache = &self.cache;
        let limit = self.lookup_timeout;
        let jobs = groups.iter().map(|group| {
            let key = group.key.as_str();
            let postal_code = group.postal_code.as_str();
            let locality = group.locality.as_str();
            move || async move {
                let outcome = lookup(resolver, postal_code, locality, limit).await;
                let flush = match outcome.coordinate() {
                    Some(coordinate) => Some(cache.put_offloaded(key.to_string(), coordinate).await),
                    None => None,
                };
                (outcome, flush)
            }
        });

        let report = self
            .dispatcher
            .dispatch(jobs, |index, (outcome, flush): (LookupOutcome, Option<FlushOutcome>)| {
                let group = &groups[index];
                match &outcome {
                    LookupOutcome::Resolved(coordinate) => {
                        debug!(key = %group.key, ?coordinate, rows = group.rows.len(), "geocoded");
                    }
                    LookupOutcome::NoResult => {
                        debug!(key = %group.key, "geocoding found no result");
                    }
                    LookupOutcome::Failed(reason) => {
                        summary.failed += 1;
                        warn!(key = %group.key, reason = %reason, "geocoding failed");
                    }
                    LookupOutcome::TimedOut => {
                        summary.timed_out += 1;
                        warn!(key = %group.key, timeout = ?limit, "geocoding timed out");
                    }
                }
                if let Some(FlushOutcome::Failed(reason)) = &flush {
                    summary.cache_flush_failures += 1;
                    warn!(key = %group.key, reason = %reason, "failed to persist geocode cache");
                }

                match outcome.coordinate() {
                    Some(coordinate) => {
                        for &idx in &group.rows {
                            rows[idx].coordinate = Some(coordinate);
                        }
                        summary.resolved += group.rows.len();
                    }
                    None => summary.unresolved += group.rows.len(),
                }

                for _ in &group.rows {
                    done += 1;
                    notify(&observer, done, total);
                }
            })
            .await;

        summary.peak_in_flight = report.peak_in_flight;
        summary.finished_at = Utc::now();
        info!(
            total = summary.pending_rows,
            resolved = summary.resolved,
            unresolved = summary.unresolved,
            cache_hits = summary.cache_hits,
            lookups = summary.lookups,
            "geocoding batch complete"
        );
        summary
    }
}

async fn lookup(
    resolver: &GeocodeResolver,
    postal_code: &str,
    locality: &str,
    limit: Duration,
) -> LookupOutcome {
    match timeout(limit, resolver.resolve(postal_code, locality)).await {
        Ok(outcome) => outcome.into(),
        Err(_) => LookupOutcome::TimedOut,
    }
}

fn notify(observer: &Option<ProgressObserver>, done: usize, total: usize) {
    if let Some(callback) = observer {
        callback(BatchProgress { done, total });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::cache::{CacheStore, MemoryStore};
    use crate::errors::{AppError, AppResult};
    use crate::geocoder::{GeocodeQuery, GeocodeResponse, GeocodeTransport};
    use crate::postcode::normalize_postcode;
    use crate::region::BoundingRegion;

    type Responder = Box<dyn Fn(&GeocodeQuery) -> AppResult<GeocodeResponse> + Send + Sync>;

    struct FakeTransport {
        respond: Responder,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeTransport {
        fn new(
            respond: impl Fn(&GeocodeQuery) -> AppResult<GeocodeResponse> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GeocodeTransport for FakeTransport {
        async fn execute(&self, query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.respond)(query)
        }
    }

    struct HangingTransport;

    #[async_trait]
    impl GeocodeTransport for HangingTransport {
        async fn execute(&self, _query: &GeocodeQuery) -> AppResult<GeocodeResponse> {
            std::future::pending::<()>().await;
            Ok(GeocodeResponse::with_status("OK"))
        }
    }

    struct ReadOnlyStore;

    impl CacheStore for ReadOnlyStore {
        fn load(&self) -> AppResult<Option<String>> {
            Ok(None)
        }

        fn save(&self, _payload: &str) -> AppResult<()> {
            Err(AppError::Config("read-only store".into()))
        }

        fn describe(&self) -> String {
            "read-only".into()
        }
    }

    fn row(id: usize, postcode: &str, locality: &str) -> Row {
        Row {
            id,
            organization: format!("Club {id}"),
            sport: "Voetbal".into(),
            federation: "KNVB".into(),
            address: "Sportlaan 1".into(),
            postal_code: normalize_postcode(postcode),
            locality: locality.into(),
            municipality: locality.into(),
            coordinate: None,
        }
    }

    fn orchestrator(
        transport: Arc<dyn GeocodeTransport>,
        store: Arc<dyn CacheStore>,
        width: usize,
    ) -> BatchOrchestrator {
        BatchOrchestrator::new(
            Arc::new(GeocodeCache::load(store)),
            Arc::new(GeocodeResolver::new(transport, "NL", "Netherlands")),
            RateLimitedDispatcher::new(width, Duration::from_millis(200)),
            Duration::from_secs(15),
        )
    }

    fn recording_observer() -> (ProgressObserver, Arc<Mutex<Vec<BatchProgress>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: ProgressObserver = Arc::new(move |progress: BatchProgress| sink.lock().push(progress));
        (observer, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_and_classifies_a_leeuwarden_club() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.2, 5.8)]))
        }));
        let store = MemoryStore::default();
        let orchestrator = orchestrator(transport.clone(), Arc::new(store.clone()), 5);

        let mut rows = vec![row(1, "1234ab", "Leeuwarden")];
        assert_eq!(rows[0].postal_code, "1234 AB");

        let summary = orchestrator.resolve_all(&mut rows, None).await;
        let coordinate = rows[0].coordinate.unwrap();
        assert_eq!(coordinate, Coordinate::new(53.2, 5.8));
        assert!(BoundingRegion::FRIESLAND.contains(coordinate.lat, coordinate.lng));
        assert_eq!(summary.resolved, 1);
        assert_eq!(transport.calls(), 1);
        assert!(store.snapshot().unwrap().contains("1234 AB|Leeuwarden"));
    }

    #[tokio::test(start_paused = true)]
    async fn cached_keys_skip_the_resolver() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.0, 6.0)]))
        }));
        let store = MemoryStore::with_payload(
            r#"{"8911 AB|Leeuwarden":{"lat":53.2,"lng":5.8},"8601|Sneek":{"lat":53.03,"lng":5.66}}"#,
        );
        let orchestrator = orchestrator(transport.clone(), Arc::new(store), 3);

        let mut rows = vec![
            row(1, "8911AB", "Leeuwarden"),
            row(2, "8601", "Sneek"),
            row(3, "8441 AB", "Heerenveen"),
            row(4, "9251", "Burgum"),
            row(5, "8861", "Harlingen"),
        ];
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(summary.cache_hits, 2);
        assert_eq!(summary.lookups, 3);
        assert!(transport.calls() <= rows.len() - 2);
        assert_eq!(rows[0].coordinate, Some(Coordinate::new(53.2, 5.8)));
        assert!(rows.iter().all(Row::is_resolved));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_queries_leave_the_row_uncoordinated() {
        let transport = Arc::new(FakeTransport::new(|query| match query {
            GeocodeQuery::PostalComponents { .. } => {
                Err(AppError::Config("operation timed out".into()))
            }
            GeocodeQuery::FreeTextAddress { .. } => {
                Ok(GeocodeResponse::with_status("ZERO_RESULTS"))
            }
        }));
        let orchestrator = orchestrator(transport.clone(), Arc::new(MemoryStore::default()), 5);
        let (observer, seen) = recording_observer();

        let mut rows = vec![row(1, "9999 ZZ", "Nergenshuizen")];
        let summary = orchestrator.resolve_all(&mut rows, Some(observer)).await;

        assert_eq!(rows[0].coordinate, None);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(transport.calls(), 2);
        assert_eq!(*seen.lock(), vec![BatchProgress { done: 1, total: 1 }]);
        assert!(orchestrator.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_keys_issue_one_lookup() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.2, 5.8)]))
        }));
        let orchestrator = orchestrator(transport.clone(), Arc::new(MemoryStore::default()), 5);

        let mut rows = vec![
            row(1, "8911 AB", "Leeuwarden"),
            row(2, "8911ab", "Leeuwarden"),
        ];
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(rows[0].cache_key(), "8911 AB|Leeuwarden");
        assert_eq!(transport.calls(), 1);
        assert_eq!(summary.lookups, 1);
        assert_eq!(summary.resolved, 2);
        assert_eq!(rows[0].coordinate, rows[1].coordinate);
        assert!(rows[0].coordinate.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_monotonic_and_ends_once_at_total() {
        let transport = Arc::new(
            FakeTransport::new(|query| match query {
                GeocodeQuery::PostalComponents { postal_code, .. } if postal_code == "9000" => {
                    Ok(GeocodeResponse::with_status("ZERO_RESULTS"))
                }
                _ => Ok(GeocodeResponse::ok([Coordinate::new(53.1, 5.9)])),
            })
            .with_delay(Duration::from_millis(120)),
        );
        let store = MemoryStore::with_payload(r#"{"8911 AB|Leeuwarden":{"lat":53.2,"lng":5.8}}"#);
        let orchestrator = orchestrator(transport, Arc::new(store), 2);
        let (observer, seen) = recording_observer();

        let mut rows = vec![
            row(1, "8911 AB", "Leeuwarden"),
            row(2, "9000", ""),
            row(3, "8441 AB", "Heerenveen"),
            row(4, "8441 AB", "Heerenveen"),
            row(5, "9251", "Burgum"),
            row(6, "", ""),
        ];
        orchestrator.resolve_all(&mut rows, Some(observer)).await;

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 6);
        assert!(seen.windows(2).all(|pair| pair[0].done <= pair[1].done));
        assert!(seen.iter().all(|progress| progress.total == 6));
        assert_eq!(seen.last(), Some(&BatchProgress { done: 6, total: 6 }));
        assert_eq!(seen.iter().filter(|progress| progress.done == 6).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_lookups_stay_within_width() {
        let transport = Arc::new(
            FakeTransport::new(|_| Ok(GeocodeResponse::ok([Coordinate::new(53.0, 5.5)])))
                .with_delay(Duration::from_millis(300)),
        );
        let orchestrator = orchestrator(transport.clone(), Arc::new(MemoryStore::default()), 2);

        let mut rows: Vec<Row> = (0..9)
            .map(|i| row(i + 1, &format!("{}", 8400 + i), "Friesland"))
            .collect();
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(summary.resolved, 9);
        assert!(summary.peak_in_flight <= 2);
        assert!(transport.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_lookups_time_out_and_the_batch_completes() {
        let orchestrator = BatchOrchestrator::new(
            Arc::new(GeocodeCache::load(Arc::new(MemoryStore::default()))),
            Arc::new(GeocodeResolver::new(
                Arc::new(HangingTransport),
                "NL",
                "Netherlands",
            )),
            RateLimitedDispatcher::new(1, Duration::from_millis(200)),
            Duration::from_secs(2),
        );

        let mut rows = vec![row(1, "8911 AB", "Leeuwarden"), row(2, "8601", "Sneek")];
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(summary.timed_out, 2);
        assert_eq!(summary.unresolved, 2);
        assert!(rows.iter().all(|row| row.coordinate.is_none()));
    }

    #[tokio::test]
    async fn already_resolved_rows_report_nothing() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.0, 5.5)]))
        }));
        let orchestrator = orchestrator(transport.clone(), Arc::new(MemoryStore::default()), 5);
        let (observer, seen) = recording_observer();

        let mut resolved = row(1, "8911 AB", "Leeuwarden");
        resolved.coordinate = Some(Coordinate::new(53.2, 5.8));
        let mut rows = vec![resolved];
        let summary = orchestrator.resolve_all(&mut rows, Some(observer)).await;

        assert_eq!(summary.pending_rows, 0);
        assert!(seen.lock().is_empty());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_write_failures_do_not_affect_rows() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.2, 5.8)]))
        }));
        let orchestrator = orchestrator(transport, Arc::new(ReadOnlyStore), 5);

        let mut rows = vec![row(1, "8911 AB", "Leeuwarden")];
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(summary.cache_flush_failures, 1);
        assert_eq!(rows[0].coordinate, Some(Coordinate::new(53.2, 5.8)));
        assert_eq!(
            orchestrator.cache().get("8911 AB|Leeuwarden"),
            Some(Coordinate::new(53.2, 5.8))
        );
    }

    struct ThreadRecordingStore {
        writers: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl CacheStore for ThreadRecordingStore {
        fn load(&self) -> AppResult<Option<String>> {
            Ok(None)
        }

        fn save(&self, _payload: &str) -> AppResult<()> {
            self.writers.lock().push(std::thread::current().id());
            Ok(())
        }

        fn describe(&self) -> String {
            "thread-recording".into()
        }
    }

    #[tokio::test]
    async fn cache_flushes_run_off_the_runtime_thread() {
        let transport = Arc::new(FakeTransport::new(|_| {
            Ok(GeocodeResponse::ok([Coordinate::new(53.2, 5.8)]))
        }));
        let store = Arc::new(ThreadRecordingStore {
            writers: Mutex::new(Vec::new()),
        });
        let orchestrator = BatchOrchestrator::new(
            Arc::new(GeocodeCache::load(store.clone())),
            Arc::new(GeocodeResolver::new(transport, "NL", "Netherlands")),
            RateLimitedDispatcher::new(2, Duration::ZERO),
            Duration::from_secs(15),
        );

        let mut rows = vec![row(1, "8911 AB", "Leeuwarden"), row(2, "8601", "Sneek")];
        let summary = orchestrator.resolve_all(&mut rows, None).await;

        assert_eq!(summary.resolved, 2);
        let runtime_thread = std::thread::current().id();
        let writers = store.writers.lock().clone();
        assert_eq!(writers.len(), 2);
        assert!(writers.iter().all(|id| *id != runtime_thread));
    }
}
