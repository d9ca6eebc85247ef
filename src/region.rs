use serde::Serialize;

/// Rectangular latitude/longitude range used for coarse membership tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingRegion {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingRegion {
    /// Rough bounding box of the province of Friesland.
    pub const FRIESLAND: BoundingRegion = BoundingRegion {
        min_lat: 52.8,
        max_lat: 53.7,
        min_lng: 4.6,
        max_lng: 6.7,
    };

    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Finite bounds with each minimum no greater than its maximum.
    pub fn is_valid(&self) -> bool {
        [self.min_lat, self.max_lat, self.min_lng, self.max_lng]
            .iter()
            .all(|v| v.is_finite())
            && self.min_lat <= self.max_lat
            && self.min_lng <= self.max_lng
    }

    /// Bounds are inclusive on every side.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.min_lat && lat <= self.max_lat && lng >= self.min_lng && lng <= self.max_lng
    }
}

impl Default for BoundingRegion {
    fn default() -> Self {
        Self::FRIESLAND
    }
}
