//! Admin-defined planting zones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::GeoPoint;

/// Inclusive elevation band in metres above sea level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElevationRange {
    pub min: f64,
    pub max: f64,
}

impl ElevationRange {
    pub fn contains(&self, meters: f64) -> bool {
        meters >= self.min && meters <= self.max
    }
}

/// Polygon + elevation band + species list where claims are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantingZone {
    pub id: String,
    pub name: String,
    /// Ordered ring; closing vertex optional.
    pub polygon: Vec<GeoPoint>,
    pub elevation_range: ElevationRange,
    #[serde(default)]
    pub optimal_species: BTreeSet<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub restrictions: BTreeSet<String>,
}

fn default_active() -> bool {
    true
}

impl PlantingZone {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        crate::geo::point_in_polygon(point, &self.polygon)
    }

    /// A zone needs at least a triangle to enclose anything.
    pub fn is_well_formed(&self) -> bool {
        self.polygon.len() >= 3
            && self.polygon.iter().all(GeoPoint::is_valid)
            && self.elevation_range.min <= self.elevation_range.max
    }

    /// Axis-aligned rectangle zone, mostly useful for seeding and tests.
    pub fn rectangle(
        id: impl Into<String>,
        name: impl Into<String>,
        south: f64,
        west: f64,
        north: f64,
        east: f64,
        elevation_range: ElevationRange,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            polygon: vec![
                GeoPoint::new(south, west),
                GeoPoint::new(south, east),
                GeoPoint::new(north, east),
                GeoPoint::new(north, west),
            ],
            elevation_range,
            optimal_species: BTreeSet::new(),
            active: true,
            restrictions: BTreeSet::new(),
        }
    }

    pub fn with_species<I, S>(mut self, species: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optimal_species = species.into_iter().map(Into::into).collect();
        self
    }
}

/// Zones seeded into an empty catalog on first start.
pub fn default_zones() -> Vec<PlantingZone> {
    let mut pic_macaya = PlantingZone::rectangle(
        "pic_macaya",
        "Pic Macaya National Park Buffer",
        18.3423,
        -74.0236,
        18.3812,
        -73.9847,
        ElevationRange {
            min: 1000.0,
            max: 2347.0,
        },
    )
    .with_species(["endemic_pine", "mahogany", "cedar"]);
    pic_macaya
        .restrictions
        .insert("protected_area_buffer".to_string());

    vec![
        PlantingZone::rectangle(
            "kenscoff",
            "Kenscoff Reforestation Zone",
            18.4387,
            -72.2936,
            18.4476,
            -72.2847,
            ElevationRange {
                min: 1500.0,
                max: 2200.0,
            },
        )
        .with_species(["pine", "eucalyptus", "cedar"]),
        pic_macaya,
        PlantingZone::rectangle(
            "cotes_de_fer",
            "Côtes de Fer Coastal Restoration",
            18.2087,
            -72.7936,
            18.2476,
            -72.7547,
            ElevationRange {
                min: 0.0,
                max: 100.0,
            },
        )
        .with_species(["mangrove", "coconut", "seagrape"]),
        PlantingZone::rectangle(
            "central_plateau",
            "Central Plateau Agroforestry",
            18.9087,
            -72.1936,
            19.0476,
            -72.0547,
            ElevationRange {
                min: 200.0,
                max: 500.0,
            },
        )
        .with_species(["mango", "avocado", "coffee", "cacao"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_zones_are_well_formed() {
        let zones = default_zones();
        assert_eq!(zones.len(), 4);
        assert!(zones.iter().all(PlantingZone::is_well_formed));
    }

    #[test]
    fn kenscoff_contains_its_center() {
        let zone = &default_zones()[0];
        assert!(zone.contains(&GeoPoint::new(18.4431, -72.2891)));
        assert!(!zone.contains(&GeoPoint::new(18.50, -72.2891)));
    }
}
