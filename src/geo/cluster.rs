//! Density-based clustering (DBSCAN) over photo locations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{centroid, haversine_m};
use crate::domain::{GeoPoint, TrackPoint};

/// A dense group of track points.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cluster {
    pub center: GeoPoint,
    pub point_count: usize,
    /// Largest distance from the center to a member, in metres.
    pub radius_m: f64,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
}

impl Cluster {
    /// Points per hour over the cluster's time span; `None` when all points
    /// share one timestamp.
    pub fn points_per_hour(&self) -> Option<f64> {
        let hours = (self.last_at - self.first_at).num_milliseconds() as f64 / 3_600_000.0;
        (hours > 0.0).then(|| self.point_count as f64 / hours)
    }
}

/// Cluster `track` with DBSCAN. Noise points are dropped.
///
/// O(n²) neighbour search; submissions are capped well below where that
/// matters.
pub fn cluster_points(track: &[TrackPoint], eps_m: f64, min_points: usize) -> Vec<Cluster> {
    const UNVISITED: isize = -2;
    const NOISE: isize = -1;

    let n = track.len();
    let mut labels = vec![UNVISITED; n];
    let mut next_label: isize = 0;

    let neighbours = |i: usize| -> Vec<usize> {
        (0..n)
            .filter(|&j| haversine_m(&track[i].location, &track[j].location) <= eps_m)
            .collect()
    };

    for i in 0..n {
        if labels[i] != UNVISITED {
            continue;
        }
        let seeds = neighbours(i);
        if seeds.len() < min_points {
            labels[i] = NOISE;
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[i] = label;

        let mut queue = seeds;
        let mut k = 0;
        while k < queue.len() {
            let j = queue[k];
            k += 1;
            if labels[j] == NOISE {
                labels[j] = label;
            }
            if labels[j] != UNVISITED {
                continue;
            }
            labels[j] = label;
            let more = neighbours(j);
            if more.len() >= min_points {
                queue.extend(more);
            }
        }
    }

    (0..next_label)
        .filter_map(|label| {
            let members: Vec<&TrackPoint> = track
                .iter()
                .zip(&labels)
                .filter(|(_, l)| **l == label)
                .map(|(p, _)| p)
                .collect();
            let points: Vec<GeoPoint> = members.iter().map(|p| p.location).collect();
            let center = centroid(&points)?;
            let radius_m = points
                .iter()
                .map(|p| haversine_m(&center, p))
                .fold(0.0, f64::max);
            let first_at = members.iter().map(|p| p.at).min()?;
            let last_at = members.iter().map(|p| p.at).max()?;
            Some(Cluster {
                center,
                point_count: members.len(),
                radius_m,
                first_at,
                last_at,
            })
        })
        .collect()
}
