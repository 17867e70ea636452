//! Pure geodesy helpers: distances, polygons, areas, clustering.
//!
//! Everything here is synchronous and allocation-light so the geospatial
//! checker can run it inline on the request task.

mod cluster;

pub use cluster::{cluster_points, Cluster};

use serde::{Deserialize, Serialize};

use crate::domain::GeoPoint;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Metres per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = 111_319.9;

/// Great-circle distance in metres.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Axis-aligned lat/lon rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub north: f64,
    pub west: f64,
    pub east: f64,
}

impl BoundingBox {
    pub const fn new(south: f64, north: f64, west: f64, east: f64) -> Self {
        Self {
            south,
            north,
            west,
            east,
        }
    }

    pub fn contains(&self, p: &GeoPoint) -> bool {
        p.lat >= self.south && p.lat <= self.north && p.lon >= self.west && p.lon <= self.east
    }

    /// Box enclosing every point within `radius_m` of `center`.
    pub fn around(center: &GeoPoint, radius_m: f64) -> Self {
        let dlat = radius_m / METERS_PER_DEGREE;
        let cos = center.lat.to_radians().cos().abs().max(1e-6);
        let dlon = radius_m / (METERS_PER_DEGREE * cos);
        Self::new(
            center.lat - dlat,
            center.lat + dlat,
            center.lon - dlon,
            center.lon + dlon,
        )
    }
}

/// Ray-casting point-in-polygon. The ring may or may not repeat its first
/// vertex. Points exactly on an edge may land either side.
pub fn point_in_polygon(p: &GeoPoint, ring: &[GeoPoint]) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (&ring[i], &ring[j]);
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let cross_lon = a.lon + (p.lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
            if p.lon < cross_lon {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Arithmetic mean of the points. Adequate for the sub-kilometre spans of a
/// planting session.
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lat, lon) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lon), p| (lat + p.lat, lon + p.lon));
    Some(GeoPoint::new(lat / n, lon / n))
}

/// Convex hull (Andrew's monotone chain), counter-clockwise, no repeated
/// closing vertex.
pub fn convex_hull(points: &[GeoPoint]) -> Vec<GeoPoint> {
    let mut pts: Vec<GeoPoint> = points.to_vec();
    pts.sort_by(|a, b| a.lon.total_cmp(&b.lon).then(a.lat.total_cmp(&b.lat)));
    pts.dedup_by(|a, b| a.lon == b.lon && a.lat == b.lat);

    if pts.len() < 3 {
        return pts;
    }

    fn cross(o: &GeoPoint, a: &GeoPoint, b: &GeoPoint) -> f64 {
        (a.lon - o.lon) * (b.lat - o.lat) - (a.lat - o.lat) * (b.lon - o.lon)
    }

    let mut hull: Vec<GeoPoint> = Vec::with_capacity(pts.len() * 2);
    for p in &pts {
        while hull.len() >= 2 && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(*p);
    }
    let lower_len = hull.len() + 1;
    for p in pts.iter().rev().skip(1) {
        while hull.len() >= lower_len
            && cross(&hull[hull.len() - 2], &hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(*p);
    }
    hull.pop();
    hull
}

/// Area of a polygon ring in square metres using an equirectangular
/// projection centred on the ring's mean latitude.
pub fn polygon_area_m2(ring: &[GeoPoint]) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    let mean_lat = ring.iter().map(|p| p.lat).sum::<f64>() / ring.len() as f64;
    let kx = METERS_PER_DEGREE * mean_lat.to_radians().cos();
    let ky = METERS_PER_DEGREE;

    let mut twice_area = 0.0;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = (ring[i].lon * kx, ring[i].lat * ky);
        let (xj, yj) = (ring[j].lon * kx, ring[j].lat * ky);
        twice_area += xj * yi - xi * yj;
        j = i;
    }
    (twice_area / 2.0).abs()
}

/// Area covered by a set of points: the convex hull's area.
pub fn covered_area_m2(points: &[GeoPoint]) -> f64 {
    polygon_area_m2(&convex_hull(points))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Offset a point by metres north/east.
    fn offset(origin: &GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
        GeoPoint::new(
            origin.lat + north_m / METERS_PER_DEGREE,
            origin.lon + east_m / (METERS_PER_DEGREE * origin.lat.to_radians().cos()),
        )
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Port-au-Prince to Cap-Haïtien, roughly 135 km
        let pap = GeoPoint::new(18.5944, -72.3074);
        let cap = GeoPoint::new(19.7578, -72.2047);
        let d = haversine_m(&pap, &cap);
        assert!((125_000.0..140_000.0).contains(&d), "distance {d}");
        assert_eq!(haversine_m(&pap, &pap), 0.0);
    }

    #[test]
    fn point_in_polygon_handles_closed_and_open_rings() {
        let open = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(1.0, 0.0),
        ];
        let mut closed = open.clone();
        closed.push(open[0]);

        let inside = GeoPoint::new(0.5, 0.5);
        let outside = GeoPoint::new(1.5, 0.5);
        assert!(point_in_polygon(&inside, &open));
        assert!(point_in_polygon(&inside, &closed));
        assert!(!point_in_polygon(&outside, &open));
        assert!(!point_in_polygon(&outside, &closed));
    }

    #[test]
    fn ten_meter_square_has_hundred_square_meters() {
        let origin = GeoPoint::new(18.44, -72.29);
        let square = vec![
            origin,
            offset(&origin, 0.0, 10.0),
            offset(&origin, 10.0, 10.0),
            offset(&origin, 10.0, 0.0),
            offset(&origin, 5.0, 5.0),
        ];
        let area = covered_area_m2(&square);
        assert!((area - 100.0).abs() < 1.0, "area {area}");
        assert_eq!(convex_hull(&square).len(), 4);
    }

    #[test]
    fn degenerate_hull_has_no_area() {
        let origin = GeoPoint::new(18.44, -72.29);
        let line = vec![origin, offset(&origin, 10.0, 0.0), offset(&origin, 20.0, 0.0)];
        assert!(covered_area_m2(&line) < 1e-6);
    }

    #[test]
    fn bounding_box_around_contains_radius() {
        let center = GeoPoint::new(18.44, -72.29);
        let bbox = BoundingBox::around(&center, 50.0);
        assert!(bbox.contains(&offset(&center, 49.0, 0.0)));
        assert!(bbox.contains(&offset(&center, 0.0, -49.0)));
        assert!(!bbox.contains(&offset(&center, 60.0, 0.0)));
    }
}
