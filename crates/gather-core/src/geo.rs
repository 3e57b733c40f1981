use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// Axis-aligned latitude/longitude box covering the configured region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Iwate prefecture, the default collection region.
    pub fn iwate() -> Self {
        Self::new(38.74, 40.45, 140.65, 142.08)
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }

    pub fn is_well_formed(&self) -> bool {
        self.min_lat <= self.max_lat
            && self.min_lon <= self.max_lon
            && (-90.0..=90.0).contains(&self.min_lat)
            && (-90.0..=90.0).contains(&self.max_lat)
            && (-180.0..=180.0).contains(&self.min_lon)
            && (-180.0..=180.0).contains(&self.max_lon)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::iwate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_zero_distance() {
        assert!(haversine_km(39.70, 141.15, 39.70, 141.15) < 1e-9);
    }

    #[test]
    fn test_haversine_morioka_to_hanamaki() {
        // Morioka station to Hanamaki station, roughly 30 km
        let d = haversine_km(39.7016, 141.1365, 39.3886, 141.1168);
        assert!((30.0..40.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let a = haversine_km(39.70, 141.15, 39.27, 141.88);
        let b = haversine_km(39.27, 141.88, 39.70, 141.15);
        assert!((a - b).abs() < 1e-9);
    }

    #[test]
    fn test_bounding_box_contains() {
        let bbox = BoundingBox::iwate();
        assert!(bbox.contains(39.70, 141.15));
        assert!(!bbox.contains(35.68, 139.76)); // Tokyo
        assert!(bbox.is_well_formed());
        assert!(!BoundingBox::new(40.0, 39.0, 140.0, 141.0).is_well_formed());
    }
}
