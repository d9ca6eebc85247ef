use std::collections::{BTreeSet, HashSet};

use serde::Serialize;

use crate::geocoder::Coordinate;
use crate::ingestion::Row;
use crate::region::BoundingRegion;

/// Display filter over resolved rows. Empty sets place no restriction.
#[derive(Debug, Clone, Default)]
pub struct MarkerFilter {
    pub municipalities: HashSet<String>,
    pub sports: HashSet<String>,
    pub query: Option<String>,
    pub inside_region_only: bool,
}

impl MarkerFilter {
    pub fn with_municipalities<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.municipalities.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_sports<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sports.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        let trimmed = query.trim();
        self.query = (!trimmed.is_empty()).then(|| trimmed.to_lowercase());
        self
    }

    pub fn inside_region_only(mut self, enabled: bool) -> Self {
        self.inside_region_only = enabled;
        self
    }

    fn matches(&self, row: &Row) -> bool {
        if !self.municipalities.is_empty() && !self.municipalities.contains(&row.municipality) {
            return false;
        }
        if !self.sports.is_empty() && !self.sports.contains(&row.sport) {
            return false;
        }
        match &self.query {
            Some(needle) => [&row.organization, &row.locality, &row.postal_code]
                .iter()
                .any(|field| field.to_lowercase().contains(needle.as_str())),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: usize,
    pub organization: String,
    pub sport: String,
    pub federation: String,
    pub address: String,
    pub postal_code: String,
    pub locality: String,
    pub municipality: String,
    pub coordinate: Coordinate,
    pub in_region: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Facets {
    pub municipalities: Vec<String>,
    pub sports: Vec<String>,
}

/// Rows that pass `filter`, in row order, resolved or not. With `inside_region_only`
/// a row must have a coordinate inside `region`.
pub fn filter_rows<'a>(
    rows: &'a [Row],
    filter: &MarkerFilter,
    region: &BoundingRegion,
) -> Vec<&'a Row> {
    rows.iter()
        .filter(|row| filter.matches(row))
        .filter(|row| {
            !filter.inside_region_only
                || row
                    .coordinate
                    .is_some_and(|c| region.contains(c.lat, c.lng))
        })
        .collect()
}

/// Resolved rows that pass `filter`, in row order. Region membership is recorded on
/// every marker and only excludes rows when the filter asks for it.
pub fn build_markers(rows: &[Row], filter: &MarkerFilter, region: &BoundingRegion) -> Vec<Marker> {
    filter_rows(rows, filter, region)
        .into_iter()
        .filter_map(|row| {
            let coordinate = row.coordinate?;
            Some(Marker {
                id: row.id,
                organization: row.organization.clone(),
                sport: row.sport.clone(),
                federation: row.federation.clone(),
                address: row.address.clone(),
                postal_code: row.postal_code.clone(),
                locality: row.locality.clone(),
                municipality: row.municipality.clone(),
                coordinate,
                in_region: region.contains(coordinate.lat, coordinate.lng),
            })
        })
        .collect()
}

/// Distinct municipalities and sports over all rows, resolved or not, sorted without
/// regard to case.
pub fn facets(rows: &[Row]) -> Facets {
    Facets {
        municipalities: distinct(rows.iter().map(|row| row.municipality.as_str())),
        sports: distinct(rows.iter().map(|row| row.sport.as_str())),
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut distinct: Vec<String> = values
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    distinct.sort_by_cached_key(|value| (value.to_lowercase(), value.clone()));
    distinct
}
