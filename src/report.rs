use std::io::Write;

use serde::Serialize;

use crate::batch::BatchSummary;
use crate::errors::AppResult;
use crate::ingestion::{
    Row, COLUMN_ADDRESS, COLUMN_FEDERATION, COLUMN_LOCALITY, COLUMN_MUNICIPALITY,
    COLUMN_ORGANIZATION, COLUMN_POSTAL_CODE, COLUMN_SPORT,
};
use crate::markers::{build_markers, facets, filter_rows, Facets, Marker, MarkerFilter};
use crate::region::BoundingRegion;

/// `total` counts every row, `filtered` the rows passing the filter, `visible` the
/// filtered rows that became markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub total: usize,
    pub filtered: usize,
    pub visible: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub counts: Counts,
    pub summary: BatchSummary,
    pub facets: Facets,
    pub markers: Vec<Marker>,
}

pub fn build_report(
    rows: &[Row],
    summary: BatchSummary,
    filter: &MarkerFilter,
    region: &BoundingRegion,
) -> Report {
    let markers = build_markers(rows, filter, region);
    Report {
        counts: Counts {
            total: rows.len(),
            filtered: filter_rows(rows, filter, region).len(),
            visible: markers.len(),
        },
        summary,
        facets: facets(rows),
        markers,
    }
}

pub fn write_report<W: Write>(mut writer: W, report: &Report) -> AppResult<()> {
    serde_json::to_writer_pretty(&mut writer, report)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct ExportRecord<'a> {
    organization: &'a str,
    sport: &'a str,
    federation: &'a str,
    address: &'a str,
    postal_code: &'a str,
    locality: &'a str,
    municipality: &'a str,
    lat: Option<f64>,
    lng: Option<f64>,
}

/// Writes the rows passing `filter` as CSV under the roster's own column names plus
/// `lat`/`lng`, which stay empty for unresolved rows. Returns the number of rows written.
pub fn write_filtered_csv<W: Write>(
    writer: W,
    rows: &[Row],
    filter: &MarkerFilter,
    region: &BoundingRegion,
) -> AppResult<usize> {
    let mut csv_writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    csv_writer.write_record([
        COLUMN_ORGANIZATION,
        COLUMN_SPORT,
        COLUMN_FEDERATION,
        COLUMN_ADDRESS,
        COLUMN_POSTAL_CODE,
        COLUMN_LOCALITY,
        COLUMN_MUNICIPALITY,
        "lat",
        "lng",
    ])?;

    let selected = filter_rows(rows, filter, region);
    for row in &selected {
        csv_writer.serialize(ExportRecord {
            organization: &row.organization,
            sport: &row.sport,
            federation: &row.federation,
            address: &row.address,
            postal_code: &row.postal_code,
            locality: &row.locality,
            municipality: &row.municipality,
            lat: row.coordinate.map(|c| c.lat),
            lng: row.coordinate.map(|c| c.lng),
        })?;
    }
    csv_writer.flush()?;
    Ok(selected.len())
}
