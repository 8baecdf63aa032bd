use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use strider::{System, TraceViewer, TrackingConfig, TrackingStatus};

mod kitti;

#[derive(Debug, Parser)]
#[command(name = "strider-run", about = "stereo visual odometry on a KITTI-style sequence")]
struct Opt {
    /// Sequence directory (containing calib.txt, image_0/, image_1/)
    #[arg(short = 'd', long = "dataset")]
    dataset: PathBuf,
    /// Tracking parameters YAML file
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Stop after this many frames
    #[arg(long = "max-frames")]
    max_frames: Option<u64>,
}

fn main() -> eyre::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "strider=info,strider_run=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::parse();

    let config = match &opt.config {
        Some(path) => {
            info!("reading tracking parameters from {}", path.display());
            TrackingConfig::from_yaml_path(path)?
        }
        None => TrackingConfig::default(),
    };

    let mut dataset = kitti::Dataset::open(&opt.dataset)?;
    let (camera_left, camera_right) = dataset.cameras();
    info!(
        "cameras: fx={:.1} baseline={:.4}",
        camera_left.fx(),
        camera_right.baseline()
    );

    let mut system = System::new(config, camera_left, camera_right, Arc::new(TraceViewer))?;

    let mut processed = 0u64;
    while let Some(frame) = dataset.next_frame()? {
        let id = frame.id;
        let status = system.track(frame)?;
        processed += 1;
        if status == TrackingStatus::Lost {
            info!("frame {id}: tracking lost");
        }
        if let Some(pose) = system.current_pose() {
            // camera trajectory = inverse of the world→rig transform
            let center = pose.inverse().translation.vector;
            tracing::debug!(
                "frame {id}: {status} at ({:.3}, {:.3}, {:.3})",
                center.x,
                center.y,
                center.z
            );
        }
        if opt.max_frames.is_some_and(|max| processed >= max) {
            break;
        }
    }

    info!(
        "processed {processed} frames: final status {}, {} keyframes, {} landmarks",
        system.status(),
        system.map().keyframe_count(),
        system.map().landmark_count()
    );
    system.shutdown();
    Ok(())
}
