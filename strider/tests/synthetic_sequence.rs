//! End-to-end tracking over a synthetic stereo sequence.
//!
//! The scene is a textured plane at constant depth in front of the rig. The
//! analytic texture lets us render sub-pixel-consistent stereo pairs for any
//! rig position, so the whole pipeline (detection, stereo matching,
//! triangulation, pose tracking, keyframing, reset) can be exercised against
//! known ground truth.

use std::sync::Arc;

use image::{GrayImage, Luma};
use nalgebra::{Isometry3, Vector3};

use strider::{Frame, FrameId, System, TraceViewer, TrackingConfig, TrackingStatus};
use strider_mvg::Camera;

const W: u32 = 640;
const H: u32 = 480;
const FX: f64 = 400.0;
const FY: f64 = 400.0;
const CX: f64 = 320.0;
const CY: f64 = 240.0;
const BASELINE: f64 = 0.2;
const DEPTH: f64 = 8.0;

fn cameras() -> (Camera, Camera) {
    let left = Camera::new(FX, FY, CX, CY, BASELINE, Isometry3::identity()).unwrap();
    let right = Camera::new(
        FX,
        FY,
        CX,
        CY,
        BASELINE,
        Isometry3::translation(-BASELINE, 0.0, 0.0),
    )
    .unwrap();
    (left, right)
}

/// Smooth plane texture, in world units.
fn plane_texture(x: f64, y: f64) -> f64 {
    127.0 + 40.0 * (23.0 * x).sin() * (19.0 * y).cos()
        + 30.0 * (7.1 * x + 11.3 * y).sin()
        + 25.0 * (13.7 * x - 5.2 * y).cos()
}

/// A second, unrelated texture for the abrupt-jump scenario.
fn other_texture(x: f64, y: f64) -> f64 {
    127.0 + 45.0 * (17.0 * x + 4.0).cos() * (29.0 * y + 2.0).sin()
        + 35.0 * (9.7 * x - 6.1 * y + 1.0).cos()
}

/// Render the view of the plane from a camera `cam_offset` to the right of a
/// rig standing at `rig_x` (the rig looks down +z; the plane is at z=DEPTH).
fn render(rig_x: f64, cam_offset: f64, tex: fn(f64, f64) -> f64) -> GrayImage {
    GrayImage::from_fn(W, H, |u, v| {
        let x = (f64::from(u) - CX) * DEPTH / FX + rig_x + cam_offset;
        let y = (f64::from(v) - CY) * DEPTH / FY;
        Luma([tex(x, y).clamp(0.0, 255.0) as u8])
    })
}

fn stereo_frame(id: u64, rig_x: f64, tex: fn(f64, f64) -> f64) -> Frame {
    Frame::new(
        FrameId(id),
        render(rig_x, 0.0, tex),
        render(rig_x, BASELINE, tex),
    )
    .unwrap()
}

fn make_system(config: TrackingConfig) -> System {
    let (left, right) = cameras();
    System::new(config, left, right, Arc::new(TraceViewer)).unwrap()
}

#[test]
fn pure_translation_is_tracked_without_new_keyframes() {
    let mut system = make_system(TrackingConfig::default());
    let step = 0.05;

    let status = system.track(stereo_frame(0, 0.0, plane_texture)).unwrap();
    assert_eq!(status, TrackingStatus::TrackingGood);
    assert_eq!(system.map().keyframe_count(), 1);
    assert!(
        system.map().landmark_count() >= 80,
        "only {} landmarks after initialization",
        system.map().landmark_count()
    );

    // stereo baseline check: triangulated depths match the plane depth
    for (id, p) in &system.map().snapshot().landmarks {
        assert!(
            (p.z - DEPTH).abs() < 0.02 * DEPTH,
            "landmark {id} at depth {:.3}, expected {DEPTH}",
            p.z
        );
    }

    for k in 1..10u64 {
        let truth = k as f64 * step;
        let status = system
            .track(stereo_frame(k, truth, plane_texture))
            .unwrap();
        assert_eq!(status, TrackingStatus::TrackingGood, "frame {k}");
        let pose = system.current_pose().unwrap();
        // world→rig: a rig at +x has pose translation -x
        let err = (pose.translation.vector + Vector3::new(truth, 0.0, 0.0)).norm();
        assert!(
            err < 0.02 * truth.max(0.1),
            "frame {k}: translation error {err:.4} (truth {truth:.2})"
        );
    }

    // the scene stays densely trackable, so initialization's keyframe is the
    // only one
    assert_eq!(system.map().keyframe_count(), 1);
    system.shutdown();
}

#[test]
fn stationary_rig_converges_to_identity_motion() {
    let mut system = make_system(TrackingConfig::default());
    system.track(stereo_frame(0, 0.0, plane_texture)).unwrap();

    for k in 1..6u64 {
        let status = system.track(stereo_frame(k, 0.0, plane_texture)).unwrap();
        assert_eq!(status, TrackingStatus::TrackingGood);
    }

    let rel = system.frontend().relative_motion();
    assert!(rel.translation.vector.norm() < 1e-3);
    assert!(rel.rotation.angle() < 1e-3);
    assert_eq!(system.map().keyframe_count(), 1);
    system.shutdown();
}

#[test]
fn initialization_waits_for_enough_stereo_matches() {
    let config = TrackingConfig {
        // unreachable bar: the detector tops out at num_features corners
        num_features_init: 10_000,
        ..TrackingConfig::default()
    };
    let mut system = make_system(config);
    let status = system.track(stereo_frame(0, 0.0, plane_texture)).unwrap();
    assert_eq!(status, TrackingStatus::Initing);
    assert_eq!(system.map().keyframe_count(), 0);
    assert_eq!(system.map().landmark_count(), 0);
    system.shutdown();
}

#[test]
fn abrupt_jump_loses_tracking_and_reset_reinitializes() {
    let mut system = make_system(TrackingConfig::default());
    system.track(stereo_frame(0, 0.0, plane_texture)).unwrap();
    system.track(stereo_frame(1, 0.05, plane_texture)).unwrap();
    system.track(stereo_frame(2, 0.10, plane_texture)).unwrap();
    assert_eq!(system.status(), TrackingStatus::TrackingGood);
    let keyframes_before = system.map().keyframe_count();

    // an unrelated image: almost every correspondence becomes an outlier
    let status = system.track(stereo_frame(3, 0.0, other_texture)).unwrap();
    assert_eq!(status, TrackingStatus::Lost);

    // the next frame triggers the (soft) reset...
    let status = system.track(stereo_frame(4, 0.0, other_texture)).unwrap();
    assert_eq!(status, TrackingStatus::Initing);
    // ...and the map survives it
    assert!(system.map().keyframe_count() >= keyframes_before);

    // the frame after that re-initializes from scratch
    let status = system.track(stereo_frame(5, 0.0, other_texture)).unwrap();
    assert_eq!(status, TrackingStatus::TrackingGood);
    system.shutdown();
}

#[test]
fn feature_starvation_inserts_a_keyframe() {
    let mut system = make_system(TrackingConfig::default());
    system.track(stereo_frame(0, 0.0, plane_texture)).unwrap();
    system.track(stereo_frame(1, 0.02, plane_texture)).unwrap();
    assert_eq!(system.map().keyframe_count(), 1);

    // occlude the right 60% of both images: most tracked features die and
    // the inlier count falls under the keyframe threshold
    let mut frame = stereo_frame(2, 0.04, plane_texture);
    let occlude = |img: &GrayImage| {
        let mut img = img.clone();
        for v in 0..H {
            for u in (2 * W / 5)..W {
                img.put_pixel(u, v, Luma([90u8]));
            }
        }
        img
    };
    frame = Frame::new(
        FrameId(2),
        occlude(&frame.left),
        occlude(&frame.right),
    )
    .unwrap();

    let status = system.track(frame).unwrap();
    assert_ne!(status, TrackingStatus::Lost);
    assert_eq!(
        system.map().keyframe_count(),
        2,
        "expected the starved frame to be promoted to keyframe"
    );
    system.shutdown();
}
