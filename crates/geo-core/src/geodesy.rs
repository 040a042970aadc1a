//! Great-circle helpers used by the route engine.

use crate::state::Coordinate;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in metres between two coordinates.
pub fn haversine_m(from: Coordinate, to: Coordinate) -> f64 {
    let d_lat = (to.latitude - from.latitude).to_radians();
    let d_lon = (to.longitude - from.longitude).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + from.latitude.to_radians().cos()
            * to.latitude.to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Linear interpolation in coordinate degrees (not along the great circle).
pub fn lerp(from: Coordinate, to: Coordinate, fraction: f64) -> Coordinate {
    Coordinate {
        latitude: from.latitude + (to.latitude - from.latitude) * fraction,
        longitude: from.longitude + (to.longitude - from.longitude) * fraction,
    }
}

/// Sum of the haversine lengths of every segment in `points`.
pub fn path_length_m(points: &[Coordinate]) -> f64 {
    points
        .windows(2)
        .map(|pair| haversine_m(pair[0], pair[1]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_DEGREE_M: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

    #[test]
    fn one_degree_of_latitude_matches_arc_length() {
        let d = haversine_m(Coordinate::new(10.0, 20.0), Coordinate::new(11.0, 20.0));
        assert!((d - ONE_DEGREE_M).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn one_degree_of_longitude_on_equator_matches_arc_length() {
        let d = haversine_m(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 1.0));
        assert!((d - ONE_DEGREE_M).abs() < 1e-6, "got {d}");
    }

    #[test]
    fn distance_is_symmetric_and_zero_for_identical_points() {
        let paris = Coordinate::new(48.8566, 2.3522);
        let tokyo = Coordinate::new(35.6762, 139.6503);
        assert_eq!(haversine_m(paris, paris), 0.0);
        let there = haversine_m(paris, tokyo);
        let back = haversine_m(tokyo, paris);
        assert!((there - back).abs() < 1e-6);
        assert!(there > 9_000_000.0 && there < 10_000_000.0);
    }

    #[test]
    fn lerp_is_linear_in_degrees() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(2.0, -4.0);
        assert_eq!(lerp(a, b, 0.0), a);
        assert_eq!(lerp(a, b, 1.0), b);
        assert_eq!(lerp(a, b, 0.25), Coordinate::new(0.5, -1.0));
    }

    #[test]
    fn path_length_sums_segments() {
        let path = [
            Coordinate::new(0.0, 0.0),
            Coordinate::new(1.0, 0.0),
            Coordinate::new(2.0, 0.0),
        ];
        assert!((path_length_m(&path) - 2.0 * ONE_DEGREE_M).abs() < 1e-6);
        assert_eq!(path_length_m(&path[..1]), 0.0);
    }
}
