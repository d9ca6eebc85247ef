use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::cache::cache_key;
use crate::errors::{AppError, AppResult};
use crate::geocoder::Coordinate;
use crate::postcode::normalize_postcode;

pub const COLUMN_ORGANIZATION: &str = "Vereniging";
pub const COLUMN_SPORT: &str = "sport";
pub const COLUMN_FEDERATION: &str = "bond";
pub const COLUMN_ADDRESS: &str = "adres";
pub const COLUMN_POSTAL_CODE: &str = "postcode";
pub const COLUMN_LOCALITY: &str = "plaats";
pub const COLUMN_MUNICIPALITY: &str = "gemeente";

pub const REQUIRED_COLUMNS: [&str; 7] = [
    COLUMN_ORGANIZATION,
    COLUMN_SPORT,
    COLUMN_FEDERATION,
    COLUMN_ADDRESS,
    COLUMN_POSTAL_CODE,
    COLUMN_LOCALITY,
    COLUMN_MUNICIPALITY,
];

/// One input record as produced by a spreadsheet parser: column name to cell text.
pub type RawRecord = HashMap<String, String>;

/// One organization from the roster. `coordinate` is written once, when geocoding succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub id: usize,
    pub organization: String,
    pub sport: String,
    pub federation: String,
    pub address: String,
    pub postal_code: String,
    pub locality: String,
    pub municipality: String,
    pub coordinate: Option<Coordinate>,
}

impl Row {
    pub fn cache_key(&self) -> String {
        cache_key(&self.postal_code, &self.locality)
    }

    pub fn is_resolved(&self) -> bool {
        self.coordinate.is_some()
    }
}

/// Columns from `REQUIRED_COLUMNS` that are absent, in their canonical order.
pub fn missing_columns<'a>(present: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let present: HashSet<&str> = present.into_iter().collect();
    REQUIRED_COLUMNS
        .iter()
        .filter(|column| !present.contains(*column))
        .map(|column| column.to_string())
        .collect()
}

/// Validates the columns of the first record and builds rows with 1-based ids.
/// An empty record list is reported with every column missing.
pub fn rows_from_records(records: &[RawRecord]) -> AppResult<Vec<Row>> {
    let missing = match records.first() {
        Some(first) => missing_columns(first.keys().map(String::as_str)),
        None => missing_columns(std::iter::empty()),
    };
    if !missing.is_empty() {
        return Err(AppError::MissingColumns(missing));
    }

    let rows = records
        .iter()
        .enumerate()
        .map(|(idx, record)| row_from_record(idx + 1, record))
        .collect::<Vec<_>>();
    info!(rows = rows.len(), "roster rows ingested");
    Ok(rows)
}

pub fn read_csv_path(path: &Path) -> AppResult<Vec<Row>> {
    let file = fs::File::open(path)?;
    read_csv(file)
}

/// Parses a CSV roster. The delimiter (`,` or `;`) is taken from the header line and the
/// header is validated before any row is converted.
pub fn read_csv<R: Read>(mut reader: R) -> AppResult<Vec<Row>> {
    let mut contents = String::new();
    reader.read_to_string(&mut contents)?;
    let contents = contents.trim_start_matches('\u{feff}');
    let delimiter = detect_delimiter(contents.lines().next().unwrap_or_default());
    debug!(delimiter = %(delimiter as char), "parsing roster csv");

    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());

    let headers = csv_reader.headers()?.clone();
    let missing = missing_columns(headers.iter());
    if !missing.is_empty() {
        return Err(AppError::MissingColumns(missing));
    }

    let mut rows = Vec::new();
    for (idx, record) in csv_reader.records().enumerate() {
        let record = record?;
        let raw: RawRecord = headers
            .iter()
            .enumerate()
            .map(|(col, name)| {
                (
                    name.to_string(),
                    record.get(col).unwrap_or_default().to_string(),
                )
            })
            .collect();
        rows.push(row_from_record(idx + 1, &raw));
    }
    info!(rows = rows.len(), "roster rows ingested");
    Ok(rows)
}

fn row_from_record(id: usize, record: &RawRecord) -> Row {
    let field = |column: &str| {
        record
            .get(column)
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    };
    Row {
        id,
        organization: field(COLUMN_ORGANIZATION),
        sport: field(COLUMN_SPORT),
        federation: field(COLUMN_FEDERATION),
        address: field(COLUMN_ADDRESS),
        postal_code: normalize_postcode(&field(COLUMN_POSTAL_CODE)),
        locality: field(COLUMN_LOCALITY),
        municipality: field(COLUMN_MUNICIPALITY),
        coordinate: None,
    }
}

fn detect_delimiter(header: &str) -> u8 {
    if header.matches(';').count() > header.matches(',').count() {
        b';'
    } else {
        b','
    }
}
