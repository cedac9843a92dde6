//! # Geometry Engine
//!
//! Converts a latitude/longitude rectangle into the ordered list of sample
//! points a scan visits. Sampling footprints are circles of a fixed radius, so
//! the points are laid out on a hexagonal lattice: every lattice hexagon is
//! circumscribed by the footprint of its centre, and the hexagons tile the
//! plane without gaps.
//!
//! Distances use a local equirectangular approximation: north-south metres come
//! from the meridian arc, east-west metres from the parallel at the
//! rectangle's average latitude. This is accurate for city-sized areas and is
//! undefined across the antimeridian, which is rejected up front.
//!
//! The lattice is shrunk by `(1 - error_margin)` so neighbouring footprints
//! overlap and absorb both the approximation and positional error reported by
//! the service.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{GeometryError, GeometryResult};

/// Mean earth radius in kilometres.
pub const EARTH_RADIUS_KM: f64 = 6371.0;
/// Metres per kilometre.
pub const M_IN_KM: f64 = 1000.0;
/// Converts an area in square metres to square kilometres.
pub const M2_TO_KM2: f64 = 1.0 / (M_IN_KM * M_IN_KM);

const DEGREES_OF_LAT: f64 = 180.0;
const EARTH_RADIUS_M: f64 = EARTH_RADIUS_KM * M_IN_KM;
/// Latitudes closer than this to a pole make longitude steps explode.
const MAX_ABS_AVERAGE_LATITUDE: f64 = 89.0;

/// Axis-aligned rectangle in degrees, always stored normalised.
///
/// Corners may be supplied in any order; construction sorts them into
/// `(lower_lat, lower_lng, upper_lat, upper_lng)`. On the wire a rectangle is
/// the four element array `[lat1, lng1, lat2, lng2]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingRectangle {
    pub lower_lat: f64,
    pub lower_lng: f64,
    pub upper_lat: f64,
    pub upper_lng: f64,
}

impl BoundingRectangle {
    /// Builds a rectangle from two opposite corners in any order.
    pub fn new(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> Self {
        Self {
            lower_lat: lat1.min(lat2),
            lower_lng: lng1.min(lng2),
            upper_lat: lat1.max(lat2),
            upper_lng: lng1.max(lng2),
        }
    }

    pub fn lat_span(&self) -> f64 {
        self.upper_lat - self.lower_lat
    }

    pub fn lng_span(&self) -> f64 {
        self.upper_lng - self.lower_lng
    }

    pub fn average_latitude(&self) -> f64 {
        (self.lower_lat + self.upper_lat) / 2.0
    }

    /// True when either span is zero.
    pub fn is_degenerate(&self) -> bool {
        self.lat_span() <= 0.0 || self.lng_span() <= 0.0
    }

    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lower_lat..=self.upper_lat).contains(&latitude)
            && (self.lower_lng..=self.upper_lng).contains(&longitude)
    }

    /// Checks that the rectangle can be tiled.
    ///
    /// Zero-span rectangles are accepted here (they tile to a single point);
    /// configuration validation rejects them separately.
    pub fn validate(&self) -> GeometryResult<()> {
        let corners = [self.lower_lat, self.lower_lng, self.upper_lat, self.upper_lng];
        if corners.iter().any(|value| !value.is_finite()) {
            return Err(GeometryError::NonFiniteCoordinate);
        }
        for lat in [self.lower_lat, self.upper_lat] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(GeometryError::LatitudeOutOfRange(lat));
            }
        }
        for lng in [self.lower_lng, self.upper_lng] {
            if !(-180.0..=180.0).contains(&lng) {
                return Err(GeometryError::LongitudeOutOfRange(lng));
            }
        }
        if self.lng_span() > 180.0 {
            return Err(GeometryError::AntimeridianSpan(self.lng_span()));
        }
        if self.average_latitude().abs() > MAX_ABS_AVERAGE_LATITUDE {
            return Err(GeometryError::PolarRectangle(self.average_latitude()));
        }
        Ok(())
    }
}

impl From<[f64; 4]> for BoundingRectangle {
    fn from([lat1, lng1, lat2, lng2]: [f64; 4]) -> Self {
        Self::new(lat1, lng1, lat2, lng2)
    }
}

impl From<BoundingRectangle> for [f64; 4] {
    fn from(rect: BoundingRectangle) -> Self {
        [rect.lower_lat, rect.lower_lng, rect.upper_lat, rect.upper_lng]
    }
}

/// A position the scanner will query. Only produced by [`tile`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

impl SamplePoint {
    fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }
}

impl std::fmt::Display for SamplePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// North-south distance in metres between two latitudes.
pub fn meridian_distance(lat1: f64, lat2: f64) -> f64 {
    EARTH_RADIUS_M * (lat1 - lat2).abs().to_radians()
}

/// East-west distance in metres between two longitudes along the parallel at `lat`.
pub fn longitude_distance(lng1: f64, lng2: f64, lat: f64) -> f64 {
    EARTH_RADIUS_M * (lng1 - lng2).abs().to_radians() * lat.to_radians().cos()
}

/// Degrees of latitude spanned by `distance` metres.
pub fn delta_latitude(distance: f64) -> f64 {
    (DEGREES_OF_LAT * distance) / (EARTH_RADIUS_M * PI)
}

/// Degrees of longitude spanned by `distance` metres at latitude `lat`.
pub fn delta_longitude(distance: f64, lat: f64) -> f64 {
    (DEGREES_OF_LAT * distance) / (EARTH_RADIUS_M * PI * lat.to_radians().cos())
}

/// Approximate area of the rectangle in square metres.
pub fn approximate_area(rect: &BoundingRectangle) -> f64 {
    let lat_dist = meridian_distance(rect.lower_lat, rect.upper_lat);
    let lng_dist = longitude_distance(rect.lower_lng, rect.upper_lng, rect.average_latitude());
    lat_dist * lng_dist
}

/// Checks the footprint radius (metres) and the overlap margin.
pub fn validate_sampling(radius: f64, error_margin: f64) -> GeometryResult<()> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(GeometryError::InvalidRadius(radius));
    }
    if !error_margin.is_finite() || !(0.0..1.0).contains(&error_margin) {
        return Err(GeometryError::InvalidErrorMargin(error_margin));
    }
    Ok(())
}

/// Lattice spacing for one rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HexSteps {
    /// Circumradius of one lattice hexagon in metres, `radius * (1 - error_margin)`.
    pub spacing_m: f64,
    /// Degrees between rows.
    pub lat_step: f64,
    /// Degrees between points of a row.
    pub lng_step: f64,
}

impl HexSteps {
    pub fn new(rect: &BoundingRectangle, radius: f64, error_margin: f64) -> GeometryResult<Self> {
        validate_sampling(radius, error_margin)?;
        let spacing_m = radius * (1.0 - error_margin);
        Ok(Self {
            spacing_m,
            lat_step: delta_latitude(spacing_m * 1.5),
            lng_step: delta_longitude(spacing_m * 3f64.sqrt(), rect.average_latitude()),
        })
    }
}

/// Produces the ordered sample points covering `rect`.
///
/// Rows run south to north, points west to east, and odd rows are shifted
/// half a step west (brick offset). The lowest row sits so the flat band of
/// its hexagons starts on the lower edge, every row starts at or west of the
/// western edge and ends at or east of the eastern edge, and rows continue
/// until a band reaches the upper edge. The result is non-empty for every
/// valid input, including zero-span rectangles.
///
/// Every point of the rectangle lies within `radius * (1 - error_margin)` of
/// some returned point under the local distance approximation.
pub fn tile(rect: &BoundingRectangle, radius: f64, error_margin: f64) -> GeometryResult<Vec<SamplePoint>> {
    rect.validate()?;
    let steps = HexSteps::new(rect, radius, error_margin)?;

    // Half the height of a hexagon's vertical edge, i.e. spacing / 2 in degrees.
    let half_band = steps.lat_step / 3.0;
    let row_end = rect.upper_lng + steps.lng_step;

    let mut points = Vec::new();
    let mut row = 0usize;
    loop {
        let lat = rect.lower_lat + half_band + row as f64 * steps.lat_step;
        let row_start = if row % 2 == 1 {
            rect.lower_lng - steps.lng_step / 2.0
        } else {
            rect.lower_lng
        };

        let mut column = 0usize;
        loop {
            let lng = row_start + column as f64 * steps.lng_step;
            if lng >= row_end {
                break;
            }
            points.push(SamplePoint::at(lat, lng));
            column += 1;
        }

        if lat + half_band >= rect.upper_lat {
            break;
        }
        row += 1;
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_distance(rect: &BoundingRectangle, a: (f64, f64), b: &SamplePoint) -> f64 {
        let dy = meridian_distance(a.0, b.latitude);
        let dx = longitude_distance(a.1, b.longitude, rect.average_latitude());
        (dx * dx + dy * dy).sqrt()
    }

    fn assert_covers(rect: &BoundingRectangle, radius: f64, error: f64) {
        let points = tile(rect, radius, error).unwrap();
        let limit = radius * (1.0 - error) * (1.0 + 1e-9);
        let samples = 60;
        for i in 0..=samples {
            for j in 0..=samples {
                let lat = rect.lower_lat + rect.lat_span() * i as f64 / samples as f64;
                let lng = rect.lower_lng + rect.lng_span() * j as f64 / samples as f64;
                let nearest = points
                    .iter()
                    .map(|p| local_distance(rect, (lat, lng), p))
                    .fold(f64::INFINITY, f64::min);
                assert!(
                    nearest <= limit,
                    "({lat}, {lng}) is {nearest:.3}m from the nearest sample, limit {limit:.3}m"
                );
            }
        }
    }

    #[test]
    fn test_area_of_small_equatorial_square() {
        let rect = BoundingRectangle::new(0.0, 0.0, 0.01, 0.01);
        let km2 = approximate_area(&rect) * M2_TO_KM2;
        assert!((km2 - 1.2364).abs() < 0.001, "area was {km2}");
    }

    #[test]
    fn test_small_square_tiles_inside_padded_bounds() {
        let rect = BoundingRectangle::new(0.0, 0.0, 0.01, 0.01);
        let points = tile(&rect, 100.0, 0.05).unwrap();
        let steps = HexSteps::new(&rect, 100.0, 0.05).unwrap();

        assert!(!points.is_empty());
        for point in &points {
            assert!(point.latitude >= rect.lower_lat - steps.lat_step);
            assert!(point.latitude <= rect.upper_lat + steps.lat_step);
            assert!(point.longitude >= rect.lower_lng - steps.lng_step);
            assert!(point.longitude <= rect.upper_lng + steps.lng_step);
            assert_eq!(point.altitude, 0.0);
        }
    }

    #[test]
    fn test_tile_is_deterministic() {
        let rect = BoundingRectangle::new(51.50, -0.13, 51.52, -0.10);
        assert_eq!(tile(&rect, 70.0, 0.05).unwrap(), tile(&rect, 70.0, 0.05).unwrap());
    }

    #[test]
    fn test_corner_order_does_not_matter() {
        let a = BoundingRectangle::new(40.71, -74.02, 40.73, -73.99);
        let b = BoundingRectangle::new(40.73, -73.99, 40.71, -74.02);
        let c = BoundingRectangle::new(40.71, -73.99, 40.73, -74.02);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(tile(&a, 100.0, 0.05).unwrap(), tile(&c, 100.0, 0.05).unwrap());
    }

    #[test]
    fn test_coverage_at_equator_and_high_latitude() {
        assert_covers(&BoundingRectangle::new(0.0, 0.0, 0.01, 0.01), 100.0, 0.05);
        assert_covers(&BoundingRectangle::new(59.90, 10.70, 59.92, 10.76), 150.0, 0.1);
        assert_covers(&BoundingRectangle::new(-33.87, 151.20, -33.86, 151.21), 70.0, 0.0);
    }

    #[test]
    fn test_coverage_of_sliver_rectangle() {
        // Thinner than a single row.
        assert_covers(&BoundingRectangle::new(10.0, 20.0, 10.0002, 20.02), 100.0, 0.05);
    }

    #[test]
    fn test_larger_margin_never_reduces_point_count() {
        let rect = BoundingRectangle::new(34.05, -118.26, 34.07, -118.23);
        let mut previous = 0;
        for margin in [0.0, 0.05, 0.1, 0.2, 0.4] {
            let steps = HexSteps::new(&rect, 100.0, margin).unwrap();
            let count = tile(&rect, 100.0, margin).unwrap().len();
            assert!(count >= previous, "margin {margin} gave {count} < {previous}");
            if margin > 0.0 {
                let looser = HexSteps::new(&rect, 100.0, margin - 0.05).unwrap();
                assert!(steps.lat_step < looser.lat_step);
                assert!(steps.lng_step < looser.lng_step);
            }
            previous = count;
        }
    }

    #[test]
    fn test_zero_area_rectangle_yields_one_point() {
        let rect = BoundingRectangle::new(12.5, 45.0, 12.5, 45.0);
        let points = tile(&rect, 100.0, 0.05).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].longitude, 45.0);
    }

    #[test]
    fn test_rows_alternate_offset() {
        let rect = BoundingRectangle::new(0.0, 0.0, 0.01, 0.01);
        let steps = HexSteps::new(&rect, 100.0, 0.05).unwrap();
        let points = tile(&rect, 100.0, 0.05).unwrap();

        let first_row_lat = points[0].latitude;
        let second_row = points
            .iter()
            .find(|p| p.latitude > first_row_lat)
            .expect("more than one row");
        assert_eq!(points[0].longitude, rect.lower_lng);
        assert!((second_row.longitude - (rect.lower_lng - steps.lng_step / 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_inputs_are_rejected() {
        let rect = BoundingRectangle::new(0.0, 0.0, 0.01, 0.01);
        assert_eq!(tile(&rect, 0.0, 0.05), Err(GeometryError::InvalidRadius(0.0)));
        assert_eq!(tile(&rect, -5.0, 0.05), Err(GeometryError::InvalidRadius(-5.0)));
        assert_eq!(tile(&rect, 100.0, 1.0), Err(GeometryError::InvalidErrorMargin(1.0)));
        assert!(matches!(
            tile(&BoundingRectangle::new(0.0, -179.0, 0.01, 179.0), 100.0, 0.05),
            Err(GeometryError::AntimeridianSpan(_))
        ));
        assert!(matches!(
            tile(&BoundingRectangle::new(95.0, 0.0, 0.01, 0.01), 100.0, 0.05),
            Err(GeometryError::LatitudeOutOfRange(_))
        ));
        let poisoned = BoundingRectangle {
            upper_lng: f64::INFINITY,
            ..rect
        };
        assert_eq!(tile(&poisoned, 100.0, 0.05), Err(GeometryError::NonFiniteCoordinate));
    }

    #[test]
    fn test_rectangle_wire_format() {
        let rect: BoundingRectangle = serde_json::from_str("[1.5, 2.5, 1.0, 2.0]").unwrap();
        assert_eq!(rect, BoundingRectangle::new(1.0, 2.0, 1.5, 2.5));
        assert_eq!(serde_json::to_string(&rect).unwrap(), "[1.0,2.0,1.5,2.5]");
    }
}
