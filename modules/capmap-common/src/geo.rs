use serde::{Deserialize, Serialize};

/// Latitude range covering the UK, including Shetland and the Channel coast.
pub const UK_LAT_RANGE: (f64, f64) = (49.0, 61.0);
/// Longitude range covering the UK, from western Ireland approaches to the East Anglian coast.
pub const UK_LON_RANGE: (f64, f64) = (-8.0, 2.0);

/// A map viewport expressed as north/south/east/west bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Default viewport covering the whole UK.
    pub fn uk() -> Self {
        Self {
            north: 58.7,
            south: 50.0,
            east: 1.8,
            west: -8.2,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
    }

    /// Whether any part of the viewport falls inside UK bounds.
    /// A viewport entirely outside yields the `out_of_range` map response.
    pub fn intersects_uk(&self) -> bool {
        self.south <= UK_LAT_RANGE.1
            && self.north >= UK_LAT_RANGE.0
            && self.west <= UK_LON_RANGE.1
            && self.east >= UK_LON_RANGE.0
    }
}

/// Whether a coordinate pair is a plausible UK coordinate.
pub fn is_uk_coordinate(lat: f64, lon: f64) -> bool {
    lat >= UK_LAT_RANGE.0 && lat <= UK_LAT_RANGE.1 && lon >= UK_LON_RANGE.0 && lon <= UK_LON_RANGE.1
}

/// Haversine great-circle distance between two lat/lon points in kilometers.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uk_bounds_accept_mainland_and_reject_continent() {
        assert!(is_uk_coordinate(51.5, -0.1)); // London
        assert!(is_uk_coordinate(57.1, -2.1)); // Aberdeen
        assert!(!is_uk_coordinate(48.85, 2.35)); // Paris
        assert!(!is_uk_coordinate(40.7, -74.0)); // New York
    }

    #[test]
    fn viewport_outside_uk_does_not_intersect() {
        let alps = BoundingBox {
            north: 47.0,
            south: 45.0,
            east: 11.0,
            west: 7.0,
        };
        assert!(!alps.intersects_uk());
        assert!(BoundingBox::uk().intersects_uk());
    }

    #[test]
    fn haversine_london_edinburgh() {
        let d = haversine_km(51.5074, -0.1278, 55.9533, -3.1883);
        assert!((d - 534.0).abs() < 10.0);
    }
}
