use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use roster_geocoder::ingestion::read_csv_path;
use roster_geocoder::{
    build_report, init_tracing, write_filtered_csv, write_report, AppConfig, BatchProgress,
    GeocodingApp, MarkerFilter, ProgressObserver,
};

const PROGRESS_LOG_EVERY: usize = 25;

#[derive(Parser, Debug)]
#[command(name = "roster-geocoder")]
#[command(about = "Geocode a sports club roster by postal code and emit map markers")]
struct Args {
    /// Roster CSV (Vereniging, sport, bond, adres, postcode, plaats, gemeente)
    input: PathBuf,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also write the filtered rows, resolved or not, as CSV
    #[arg(long)]
    csv_output: Option<PathBuf>,

    /// Only keep markers in this municipality (repeatable)
    #[arg(long = "municipality")]
    municipalities: Vec<String>,

    /// Only keep markers for this sport (repeatable)
    #[arg(long = "sport")]
    sports: Vec<String>,

    /// Case-insensitive match on organization, locality or postal code
    #[arg(short, long)]
    query: Option<String>,

    /// Drop markers outside the configured region
    #[arg(long)]
    inside_region_only: bool,

    /// Use a throwaway in-memory cache
    #[arg(long)]
    no_cache: bool,
}

impl Args {
    fn marker_filter(&self) -> MarkerFilter {
        let filter = MarkerFilter::default()
            .with_municipalities(self.municipalities.iter().cloned())
            .with_sports(self.sports.iter().cloned())
            .inside_region_only(self.inside_region_only);
        match &self.query {
            Some(query) => filter.with_query(query.as_str()),
            None => filter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = AppConfig::from_env();
    let mut rows = read_csv_path(&args.input)
        .with_context(|| format!("failed to read roster {}", args.input.display()))?;
    let app = GeocodingApp::from_config(&config, args.no_cache)
        .context("failed to set up geocoding pipeline")?;
    debug!(config = ?app.profile(), "configuration loaded");

    let observer: ProgressObserver = Arc::new(|progress: BatchProgress| {
        if progress.done % PROGRESS_LOG_EVERY == 0 || progress.done == progress.total {
            info!(done = progress.done, total = progress.total, "geocoding progress");
        }
    });
    let summary = app.resolve(&mut rows, Some(observer)).await;

    let filter = args.marker_filter();
    let region = app.region();
    let report = build_report(&rows, summary, &filter, &region);
    info!(
        total = report.counts.total,
        filtered = report.counts.filtered,
        visible = report.counts.visible,
        "writing marker report"
    );

    match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            write_report(BufWriter::new(file), &report)?;
        }
        None => write_report(io::stdout().lock(), &report)?,
    }

    if let Some(path) = &args.csv_output {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let written = write_filtered_csv(BufWriter::new(file), &rows, &filter, &region)?;
        info!(rows = written, path = %path.display(), "filtered rows exported");
    }
    Ok(())
}
