use std::collections::BTreeMap;

use nalgebra::{Isometry3, Point2, Point3};
use parking_lot::Mutex;

use crate::frame::{Frame, KeyframeId};
use crate::map_point::{MapPoint, MapPointId, Observation};

/// Shared store of keyframes and landmarks.
///
/// The map is the only state shared between the frontend and the backend; a
/// single coarse lock serializes access. Keyframe and landmark ids are
/// assigned here so there is one source of truth for their monotonicity.
///
/// A window of recent keyframes stays "active": only those participate in
/// local bundle adjustment. When the window overflows, the keyframe closest
/// to the newest one is retired if it is redundant (pose distance below
/// [`REDUNDANT_KEYFRAME_DISTANCE`]), otherwise the farthest one; its
/// observations are detached and landmarks left unobserved are culled.
/// Retired keyframes remain stored.
pub struct Map {
    num_active_keyframes: usize,
    inner: Mutex<MapInner>,
}

const REDUNDANT_KEYFRAME_DISTANCE: f64 = 0.2;

#[derive(Default)]
struct MapInner {
    keyframes: BTreeMap<KeyframeId, Frame>,
    active_keyframes: Vec<KeyframeId>,
    landmarks: BTreeMap<MapPointId, MapPoint>,
    next_keyframe_id: u64,
    next_map_point_id: u64,
}

/// Immutable copy of the map geometry, for passive consumers.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    pub keyframes: Vec<(KeyframeId, Isometry3<f64>)>,
    pub landmarks: Vec<(MapPointId, Point3<f64>)>,
}

/// One keyframe of the active window as seen by bundle adjustment.
#[derive(Debug, Clone)]
pub struct BaKeyframe {
    pub id: KeyframeId,
    pub pose: Isometry3<f64>,
    pub observations: Vec<BaObservation>,
}

#[derive(Debug, Clone)]
pub struct BaObservation {
    pub map_point: MapPointId,
    pub feature_index: usize,
    pub pixel: Point2<f64>,
}

/// Copy of the active window handed to the backend; optimization runs on
/// this copy so no map lock is held while iterating.
#[derive(Debug, Clone)]
pub struct BaWindow {
    pub keyframes: Vec<BaKeyframe>,
    pub landmarks: BTreeMap<MapPointId, Point3<f64>>,
}

impl Map {
    pub fn new(num_active_keyframes: usize) -> Self {
        Self {
            num_active_keyframes,
            inner: Mutex::new(MapInner::default()),
        }
    }

    /// Store a keyframe, assign its id and maintain the active window.
    pub fn insert_keyframe(&self, mut frame: Frame) -> KeyframeId {
        let mut inner = self.inner.lock();
        let id = KeyframeId(inner.next_keyframe_id);
        inner.next_keyframe_id += 1;
        frame.keyframe_id = Some(id);
        inner.active_keyframes.push(id);
        inner.keyframes.insert(id, frame);
        if inner.active_keyframes.len() > self.num_active_keyframes {
            retire_one_keyframe(&mut inner);
        }
        id
    }

    /// Replace the stored copy of a keyframe (after the frontend augmented
    /// its features).
    pub fn update_keyframe(&self, frame: Frame) {
        let Some(id) = frame.keyframe_id else { return };
        let mut inner = self.inner.lock();
        if let std::collections::btree_map::Entry::Occupied(mut e) = inner.keyframes.entry(id) {
            e.insert(frame);
        }
    }

    pub fn insert_map_point(
        &self,
        position: Point3<f64>,
        observations: Vec<Observation>,
    ) -> MapPointId {
        let mut inner = self.inner.lock();
        let id = MapPointId(inner.next_map_point_id);
        inner.next_map_point_id += 1;
        let mut mp = MapPoint::new(id, position);
        for obs in observations {
            mp.add_observation(obs);
        }
        inner.landmarks.insert(id, mp);
        id
    }

    pub fn add_observation(&self, id: MapPointId, obs: Observation) {
        let mut inner = self.inner.lock();
        if let Some(mp) = inner.landmarks.get_mut(&id) {
            mp.add_observation(obs);
        }
    }

    /// Resolve a (possibly stale) landmark id to its world position.
    pub fn point_position(&self, id: MapPointId) -> Option<Point3<f64>> {
        self.inner.lock().landmarks.get(&id).map(|mp| mp.position)
    }

    pub fn set_point_position(&self, id: MapPointId, position: Point3<f64>) {
        let mut inner = self.inner.lock();
        if let Some(mp) = inner.landmarks.get_mut(&id) {
            mp.position = position;
        }
    }

    pub fn set_keyframe_pose(&self, id: KeyframeId, pose: Isometry3<f64>) {
        let mut inner = self.inner.lock();
        if let Some(kf) = inner.keyframes.get_mut(&id) {
            kf.pose = pose;
        }
    }

    /// Detach one observation from a landmark and clear the corresponding
    /// feature's landmark link. Landmarks left with no observation are
    /// culled.
    pub fn detach_observation(&self, id: MapPointId, obs: &Observation) {
        let mut inner = self.inner.lock();
        if let Some(mp) = inner.landmarks.get_mut(&id) {
            mp.remove_observation(obs);
            if mp.observations.is_empty() {
                inner.landmarks.remove(&id);
            }
        }
        if let Some(kf) = inner.keyframes.get_mut(&obs.keyframe_id) {
            let feature = match obs.side {
                crate::map_point::ImageSide::Left => {
                    kf.features_left.get_mut(obs.feature_index)
                }
                crate::map_point::ImageSide::Right => kf
                    .features_right
                    .get_mut(obs.feature_index)
                    .and_then(|f| f.as_mut()),
            };
            if let Some(feature) = feature {
                if feature.map_point == Some(id) {
                    feature.map_point = None;
                }
            }
        }
    }

    pub fn keyframe_count(&self) -> usize {
        self.inner.lock().keyframes.len()
    }

    pub fn landmark_count(&self) -> usize {
        self.inner.lock().landmarks.len()
    }

    pub fn keyframe_pose(&self, id: KeyframeId) -> Option<Isometry3<f64>> {
        self.inner.lock().keyframes.get(&id).map(|kf| kf.pose)
    }

    pub fn snapshot(&self) -> MapSnapshot {
        let inner = self.inner.lock();
        MapSnapshot {
            keyframes: inner
                .keyframes
                .iter()
                .map(|(id, kf)| (*id, kf.pose))
                .collect(),
            landmarks: inner
                .landmarks
                .iter()
                .map(|(id, mp)| (*id, mp.position))
                .collect(),
        }
    }

    /// Copy out the active window for local bundle adjustment.
    pub fn ba_window(&self) -> BaWindow {
        let inner = self.inner.lock();
        let mut landmarks = BTreeMap::new();
        let mut keyframes = Vec::with_capacity(inner.active_keyframes.len());
        for id in &inner.active_keyframes {
            let Some(kf) = inner.keyframes.get(id) else {
                continue;
            };
            let mut observations = Vec::new();
            for (i, feature) in kf.features_left.iter().enumerate() {
                let Some(mp_id) = feature.map_point else {
                    continue;
                };
                let Some(mp) = inner.landmarks.get(&mp_id) else {
                    continue;
                };
                landmarks.insert(mp_id, mp.position);
                observations.push(BaObservation {
                    map_point: mp_id,
                    feature_index: i,
                    pixel: feature.position,
                });
            }
            keyframes.push(BaKeyframe {
                id: *id,
                pose: kf.pose,
                observations,
            });
        }
        BaWindow {
            keyframes,
            landmarks,
        }
    }
}

fn pose_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    let rel = a * b.inverse();
    rel.translation.vector.norm() + rel.rotation.angle()
}

/// Retire one keyframe from the active window: the one nearest the newest
/// keyframe when that distance marks it redundant, otherwise the farthest.
fn retire_one_keyframe(inner: &mut MapInner) {
    let Some(newest) = inner.active_keyframes.last().copied() else {
        return;
    };
    let Some(reference) = inner.keyframes.get(&newest).map(|kf| kf.pose) else {
        return;
    };

    let mut nearest: Option<(f64, KeyframeId)> = None;
    let mut farthest: Option<(f64, KeyframeId)> = None;
    for id in &inner.active_keyframes {
        if *id == newest {
            continue;
        }
        let Some(kf) = inner.keyframes.get(id) else {
            continue;
        };
        let d = pose_distance(&kf.pose, &reference);
        if nearest.map_or(true, |(best, _)| d < best) {
            nearest = Some((d, *id));
        }
        if farthest.map_or(true, |(best, _)| d > best) {
            farthest = Some((d, *id));
        }
    }
    let victim = match (nearest, farthest) {
        (Some((min_d, near_id)), Some((_, far_id))) => {
            if min_d < REDUNDANT_KEYFRAME_DISTANCE {
                near_id
            } else {
                far_id
            }
        }
        _ => return,
    };

    inner.active_keyframes.retain(|id| *id != victim);
    let map_point_ids: Vec<MapPointId> = inner
        .keyframes
        .get(&victim)
        .map(|kf| {
            kf.features_left
                .iter()
                .filter_map(|f| f.map_point)
                .chain(
                    kf.features_right
                        .iter()
                        .flatten()
                        .filter_map(|f| f.map_point),
                )
                .collect()
        })
        .unwrap_or_default();
    for mp_id in map_point_ids {
        if let Some(mp) = inner.landmarks.get_mut(&mp_id) {
            mp.remove_keyframe_observations(victim);
            if mp.observations.is_empty() {
                inner.landmarks.remove(&mp_id);
            }
        }
    }
    tracing::debug!("retired keyframe {victim} from the active window");
}
