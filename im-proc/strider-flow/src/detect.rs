use nalgebra::Point2;

use crate::pyramid::{at, GrayImageF32};
use crate::DetectConfig;

/// Binary exclusion mask for the detector.
///
/// The frontend paints a box around every feature it is already tracking so
/// that new detections do not duplicate existing ones.
#[derive(Debug, Clone)]
pub struct Mask {
    width: u32,
    height: u32,
    blocked: Vec<bool>,
}

impl Mask {
    /// A mask with every pixel available.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            blocked: vec![false; (width as usize) * (height as usize)],
        }
    }

    /// Block a square box of side `2 * half_size` centered on `(x, y)`.
    pub fn block_box(&mut self, center: &Point2<f64>, half_size: u32) {
        let h = i64::from(half_size);
        let cx = center.x.round() as i64;
        let cy = center.y.round() as i64;
        let x0 = (cx - h).clamp(0, i64::from(self.width) - 1);
        let x1 = (cx + h).clamp(0, i64::from(self.width) - 1);
        let y0 = (cy - h).clamp(0, i64::from(self.height) - 1);
        let y1 = (cy + h).clamp(0, i64::from(self.height) - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                self.blocked[y as usize * self.width as usize + x as usize] = true;
            }
        }
    }

    #[inline]
    pub fn is_free(&self, x: u32, y: u32) -> bool {
        !self.blocked[y as usize * self.width as usize + x as usize]
    }
}

/// Detect up to `max_corners` Shi–Tomasi corners outside the masked regions.
///
/// The response at a pixel is the minimum eigenvalue of the 3×3-window
/// spatial gradient matrix. Candidates below `quality_level` times the
/// strongest response are discarded; the survivors are accepted strongest
/// first, each suppressing later candidates within `min_distance` pixels.
pub fn detect(
    img: &GrayImageF32,
    mask: &Mask,
    max_corners: usize,
    config: &DetectConfig,
) -> Vec<Point2<f64>> {
    let w = img.width();
    let h = img.height();
    if w < 8 || h < 8 || max_corners == 0 {
        return Vec::new();
    }

    // minimum-eigenvalue response over a 3x3 window; 2px border skipped for
    // the gradient stencil
    let mut responses = vec![0.0f64; (w as usize) * (h as usize)];
    let mut max_response = 0.0f64;
    for y in 2..h - 2 {
        for x in 2..w - 2 {
            let mut g11 = 0.0f64;
            let mut g12 = 0.0f64;
            let mut g22 = 0.0f64;
            for wy in -1i64..=1 {
                for wx in -1i64..=1 {
                    let xx = i64::from(x) + wx;
                    let yy = i64::from(y) + wy;
                    let ix = f64::from(at(img, xx + 1, yy) - at(img, xx - 1, yy)) * 0.5;
                    let iy = f64::from(at(img, xx, yy + 1) - at(img, xx, yy - 1)) * 0.5;
                    g11 += ix * ix;
                    g12 += ix * iy;
                    g22 += iy * iy;
                }
            }
            let response =
                0.5 * ((g11 + g22) - ((g11 - g22).powi(2) + 4.0 * g12 * g12).sqrt());
            responses[y as usize * w as usize + x as usize] = response;
            if response > max_response {
                max_response = response;
            }
        }
    }
    if max_response <= 0.0 {
        return Vec::new();
    }

    let threshold = config.quality_level * max_response;
    let mut candidates: Vec<(f64, u32, u32)> = Vec::new();
    for y in 2..h - 2 {
        for x in 2..w - 2 {
            let response = responses[y as usize * w as usize + x as usize];
            if response >= threshold && mask.is_free(x, y) {
                candidates.push((response, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    let n_candidates = candidates.len();

    let min_dist2 = config.min_distance * config.min_distance;
    let mut accepted: Vec<Point2<f64>> = Vec::new();
    for (_response, x, y) in candidates {
        let p = Point2::new(f64::from(x), f64::from(y));
        if accepted
            .iter()
            .all(|q| (p - q).norm_squared() >= min_dist2)
        {
            accepted.push(p);
            if accepted.len() >= max_corners {
                break;
            }
        }
    }
    tracing::trace!(
        "detector: {} corners accepted from {} candidates",
        accepted.len(),
        n_candidates
    );
    accepted
}
