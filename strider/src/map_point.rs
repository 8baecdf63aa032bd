use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::frame::KeyframeId;

/// Identifies a landmark. Assigned monotonically by the [`Map`](crate::Map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MapPointId(pub u64);

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageSide {
    Left,
    Right,
}

/// Back-reference from a landmark to one of the keyframe features observing
/// it. The reference is weak in the same sense as the feature's landmark
/// link: dropping either side never keeps the other alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub keyframe_id: KeyframeId,
    pub feature_index: usize,
    pub side: ImageSide,
}

/// A landmark: a 3D point in world coordinates.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,
    pub position: Point3<f64>,
    pub observations: Vec<Observation>,
    /// Total number of successful observations ever recorded; not reduced
    /// when observations are detached.
    pub observed_count: u32,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Point3<f64>) -> Self {
        Self {
            id,
            position,
            observations: Vec::new(),
            observed_count: 0,
        }
    }

    pub fn add_observation(&mut self, obs: Observation) {
        if !self.observations.contains(&obs) {
            self.observations.push(obs);
            self.observed_count += 1;
        }
    }

    pub fn remove_observation(&mut self, obs: &Observation) {
        self.observations.retain(|o| o != obs);
    }

    /// Detach every observation made from the given keyframe.
    pub fn remove_keyframe_observations(&mut self, keyframe_id: KeyframeId) {
        self.observations.retain(|o| o.keyframe_id != keyframe_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(kf: u64, idx: usize, side: ImageSide) -> Observation {
        Observation {
            keyframe_id: KeyframeId(kf),
            feature_index: idx,
            side,
        }
    }

    #[test]
    fn observations_are_deduplicated() {
        let mut mp = MapPoint::new(MapPointId(0), Point3::origin());
        mp.add_observation(obs(0, 3, ImageSide::Left));
        mp.add_observation(obs(0, 3, ImageSide::Left));
        mp.add_observation(obs(0, 3, ImageSide::Right));
        assert_eq!(mp.observations.len(), 2);
        assert_eq!(mp.observed_count, 2);
    }

    #[test]
    fn detaching_does_not_decrement_counter() {
        let mut mp = MapPoint::new(MapPointId(0), Point3::origin());
        mp.add_observation(obs(0, 1, ImageSide::Left));
        mp.add_observation(obs(1, 2, ImageSide::Left));
        mp.remove_keyframe_observations(KeyframeId(0));
        assert_eq!(mp.observations.len(), 1);
        assert_eq!(mp.observed_count, 2);
    }
}
