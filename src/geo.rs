use serde::{Deserialize, Serialize};

const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// `None` when the pair is outside the valid coordinate range.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self { latitude, longitude })
    }
}

/// Distance between two coordinates, in meters.
pub trait DistanceCalculator: Send + Sync {
    fn distance(&self, a: GeoPoint, b: GeoPoint) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Haversine;

impl DistanceCalculator for Haversine {
    fn distance(&self, a: GeoPoint, b: GeoPoint) -> f64 {
        let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
        let dlat = lat2 - lat1;
        let dlon = (b.longitude - a.longitude).to_radians();
        let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(GeoPoint::new(91.0, 0.0).is_none());
        assert!(GeoPoint::new(0.0, -181.0).is_none());
        assert!(GeoPoint::new(f64::NAN, 0.0).is_none());
        assert!(GeoPoint::new(38.7, -9.1).is_some());
    }

    #[test]
    fn haversine_known_distance() {
        // Lisbon (Praça do Comércio) to Porto (Ribeira), roughly 274 km
        let lisbon = GeoPoint::new(38.7075, -9.1364).unwrap();
        let porto = GeoPoint::new(41.1405, -8.6110).unwrap();
        let d = Haversine.distance(lisbon, porto);
        assert!((270_000.0..280_000.0).contains(&d), "got {}", d);
    }

    #[test]
    fn haversine_zero_for_same_point() {
        let p = GeoPoint::new(38.7, -9.1).unwrap();
        assert_eq!(Haversine.distance(p, p), 0.0);
    }
}
