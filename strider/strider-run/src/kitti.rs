//! Reader for KITTI-odometry-style stereo sequences.
//!
//! Expected layout under the sequence directory:
//!
//! ```text
//! calib.txt            P0/P1 projection matrices, one per line
//! image_0/000000.png   left grayscale frames
//! image_1/000000.png   right grayscale frames
//! ```

use std::path::{Path, PathBuf};

use eyre::{eyre, WrapErr};
use nalgebra::Matrix3x4;

use strider::{Frame, FrameId};
use strider_mvg::Camera;

pub struct Dataset {
    root: PathBuf,
    camera_left: Camera,
    camera_right: Camera,
    next_index: u64,
}

impl Dataset {
    pub fn open(root: &Path) -> eyre::Result<Self> {
        let calib_path = root.join("calib.txt");
        let calib = std::fs::read_to_string(&calib_path)
            .wrap_err_with(|| format!("reading {}", calib_path.display()))?;
        let p0 = parse_projection(&calib, "P0")?;
        let p1 = parse_projection(&calib, "P1")?;
        let camera_left = Camera::from_projection(&p0)?;
        let camera_right = Camera::from_projection(&p1)?;
        Ok(Self {
            root: root.to_path_buf(),
            camera_left,
            camera_right,
            next_index: 0,
        })
    }

    pub fn cameras(&self) -> (Camera, Camera) {
        (self.camera_left.clone(), self.camera_right.clone())
    }

    /// Load the next stereo pair, or `None` once the sequence is exhausted.
    pub fn next_frame(&mut self) -> eyre::Result<Option<Frame>> {
        let left_path = self.image_path(0, self.next_index);
        let right_path = self.image_path(1, self.next_index);
        if !left_path.exists() || !right_path.exists() {
            return Ok(None);
        }
        let left = image::open(&left_path)
            .wrap_err_with(|| format!("loading {}", left_path.display()))?
            .into_luma8();
        let right = image::open(&right_path)
            .wrap_err_with(|| format!("loading {}", right_path.display()))?
            .into_luma8();
        let frame = Frame::new(FrameId(self.next_index), left, right)?;
        self.next_index += 1;
        Ok(Some(frame))
    }

    fn image_path(&self, cam: usize, index: u64) -> PathBuf {
        self.root
            .join(format!("image_{cam}"))
            .join(format!("{index:06}.png"))
    }
}

fn parse_projection(calib: &str, name: &str) -> eyre::Result<Matrix3x4<f64>> {
    let line = calib
        .lines()
        .find(|l| l.starts_with(name))
        .ok_or_else(|| eyre!("no {name} entry in calib.txt"))?;
    let values: Vec<f64> = line
        .split_whitespace()
        .skip(1)
        .map(|tok| tok.parse::<f64>())
        .collect::<Result<_, _>>()
        .wrap_err_with(|| format!("parsing {name} entry"))?;
    if values.len() != 12 {
        return Err(eyre!(
            "{name} entry has {} values, expected 12",
            values.len()
        ));
    }
    Ok(Matrix3x4::from_row_slice(&values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const CALIB: &str = "\
P0: 718.856 0.0 607.1928 0.0 0.0 718.856 185.2157 0.0 0.0 0.0 1.0 0.0
P1: 718.856 0.0 607.1928 -386.1448 0.0 718.856 185.2157 0.0 0.0 0.0 1.0 0.0
";

    #[test]
    fn parses_kitti_calibration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calib.txt"), CALIB).unwrap();
        let dataset = Dataset::open(dir.path()).unwrap();
        let (left, right) = dataset.cameras();
        assert_relative_eq!(left.fx(), 718.856);
        assert_relative_eq!(left.baseline(), 0.0);
        // KITTI sequence 00 baseline is about 0.537 m
        assert_relative_eq!(right.baseline(), 386.1448 / 718.856, epsilon = 1e-9);
    }

    #[test]
    fn missing_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calib.txt"), "P0: 1 0 0 0 0 1 0 0 0 0 1 0\n").unwrap();
        assert!(Dataset::open(dir.path()).is_err());
    }

    #[test]
    fn exhausted_sequence_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calib.txt"), CALIB).unwrap();
        let mut dataset = Dataset::open(dir.path()).unwrap();
        assert!(dataset.next_frame().unwrap().is_none());
    }
}
