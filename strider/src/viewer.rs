use crate::frame::Frame;
use crate::map::MapSnapshot;

/// Passive consumer of tracking output.
///
/// The frontend pushes every processed frame and a map snapshot after each
/// map change; implementations must not block for long, since the push
/// happens on the tracking thread.
pub trait Viewer: Send + Sync {
    fn add_current_frame(&self, frame: &Frame);
    fn update_map(&self, map: &MapSnapshot);
}

/// Viewer that reports to the log instead of a display.
#[derive(Debug, Default)]
pub struct TraceViewer;

impl Viewer for TraceViewer {
    fn add_current_frame(&self, frame: &Frame) {
        tracing::debug!(
            "frame {}: {} features, pose t=({:.3}, {:.3}, {:.3})",
            frame.id,
            frame.features_left.len(),
            frame.pose.translation.vector.x,
            frame.pose.translation.vector.y,
            frame.pose.translation.vector.z,
        );
    }

    fn update_map(&self, map: &MapSnapshot) {
        tracing::debug!(
            "map updated: {} keyframes, {} landmarks",
            map.keyframes.len(),
            map.landmarks.len()
        );
    }
}
