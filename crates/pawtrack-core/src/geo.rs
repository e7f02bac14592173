//! Great-circle distance on a spherical earth, plus the bounding box used as a
//! coarse server-side pre-filter.

use serde::{Deserialize, Serialize};

use crate::{Coordinate, SearchError};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Slack applied to the box so points exactly on the circle stay inside it.
const BOX_PADDING: f64 = 1.0001;

/// Haversine distance between two validated coordinates.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1.0 for antipodal points.
    let central_angle = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_KM * central_angle
}

/// Distance between raw degree pairs. Out-of-range or non-finite input is rejected, never clamped.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> Result<f64, SearchError> {
    let a = Coordinate::new(lat1, lon1)?;
    let b = Coordinate::new(lat2, lon2)?;
    Ok(distance_km(a, b))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl BoundingBox {
    /// Smallest lat/lon box covering the circle of `radius_km` around `center`.
    ///
    /// Near the poles, or when the box would wrap the antimeridian, the full
    /// longitude span is used. The box only narrows a query; callers still
    /// filter precisely with [`distance_km`].
    pub fn around(center: Coordinate, radius_km: f64) -> Self {
        let angular = radius_km.max(0.0) * BOX_PADDING / EARTH_RADIUS_KM;
        let lat_delta = angular.to_degrees();
        let min_latitude = (center.latitude - lat_delta).max(-90.0);
        let max_latitude = (center.latitude + lat_delta).min(90.0);

        let touches_pole = min_latitude <= -90.0 || max_latitude >= 90.0;
        let ratio = angular.sin() / center.latitude.to_radians().cos();
        let (min_longitude, max_longitude) = if touches_pole || !(0.0..1.0).contains(&ratio) {
            (-180.0, 180.0)
        } else {
            let lon_delta = ratio.asin().to_degrees();
            let min = center.longitude - lon_delta;
            let max = center.longitude + lon_delta;
            if min < -180.0 || max > 180.0 {
                (-180.0, 180.0)
            } else {
                (min, max)
            }
        };

        Self {
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
        }
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        (self.min_latitude..=self.max_latitude).contains(&point.latitude)
            && (self.min_longitude..=self.max_longitude).contains(&point.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn identical_points_are_zero_apart() {
        let p = c(37.7749, -122.4194);
        assert_eq!(distance_km(p, p), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let pairs = [
            (c(37.7749, -122.4194), c(37.7849, -122.4294)),
            (c(51.5074, -0.1278), c(48.8566, 2.3522)),
            (c(-33.8688, 151.2093), c(35.6762, 139.6503)),
            (c(89.9, 10.0), c(-89.9, -170.0)),
        ];
        for (a, b) in pairs {
            assert!((distance_km(a, b) - distance_km(b, a)).abs() < 1e-6);
            assert!(distance_km(a, b) >= 0.0);
        }
    }

    #[test]
    fn san_francisco_blocks_are_about_one_and_a_half_km_apart() {
        let d = distance_km(c(37.7749, -122.4194), c(37.7849, -122.4294));
        assert!((d - 1.417).abs() < 0.01, "got {d}");
    }

    #[test]
    fn london_to_paris_matches_reference() {
        let d = distance_km(c(51.5074, -0.1278), c(48.8566, 2.3522));
        assert!((d - 343.56).abs() < 0.5, "got {d}");
    }

    #[test]
    fn antipodal_points_do_not_produce_nan() {
        let d = distance_km(c(0.0, 0.0), c(0.0, 180.0));
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn haversine_rejects_out_of_range_degrees() {
        assert!(matches!(
            haversine_km(95.0, 0.0, 0.0, 0.0),
            Err(SearchError::InvalidCoordinate { latitude, .. }) if latitude == 95.0
        ));
        assert!(haversine_km(0.0, 0.0, 0.0, 181.0).is_err());
        assert!(haversine_km(f64::NAN, 0.0, 0.0, 0.0).is_err());
        assert!(haversine_km(10.0, 20.0, 10.5, 20.5).is_ok());
    }

    #[test]
    fn bounding_box_covers_the_search_circle() {
        let center = c(37.7749, -122.4194);
        let bbox = BoundingBox::around(center, 10.0);
        assert!(bbox.contains(center));
        let north = c(37.7749 + (10.0 / EARTH_RADIUS_KM).to_degrees(), -122.4194);
        assert!((distance_km(center, north) - 10.0).abs() < 1e-6);
        assert!(bbox.contains(north));
        assert!(bbox.min_longitude < -122.4194 && bbox.max_longitude > -122.4194);
        assert!(!bbox.contains(c(38.0, -122.4194)));
    }

    #[test]
    fn bounding_box_widens_near_pole_and_antimeridian() {
        let polar = BoundingBox::around(c(89.95, 0.0), 20.0);
        assert_eq!(polar.max_latitude, 90.0);
        assert_eq!((polar.min_longitude, polar.max_longitude), (-180.0, 180.0));

        let dateline = BoundingBox::around(c(0.0, 179.99), 5.0);
        assert_eq!((dateline.min_longitude, dateline.max_longitude), (-180.0, 180.0));
    }
}
