use nalgebra::Point2;

use crate::pyramid::{sample, Pyramid};
use crate::FlowConfig;

/// Track points from `prev` to `next` with pyramidal Lucas–Kanade.
///
/// `points` are source locations in `prev`; `guesses` are initial estimates
/// of the corresponding locations in `next` (pass the source location itself
/// when nothing better is known). Both slices must have the same length.
///
/// The per-point result is `None` when the point cannot be tracked: the
/// source or the refined location leaves the image, or the patch around the
/// source has too little structure for the flow equations to be solvable
/// (minimum-eigenvalue gate).
pub fn track(
    prev: &Pyramid,
    next: &Pyramid,
    points: &[Point2<f64>],
    guesses: &[Point2<f64>],
    config: &FlowConfig,
) -> Vec<Option<Point2<f64>>> {
    assert_eq!(points.len(), guesses.len());
    points
        .iter()
        .zip(guesses.iter())
        .map(|(pt, guess)| track_one(prev, next, pt, guess, config))
        .collect()
}

fn track_one(
    prev: &Pyramid,
    next: &Pyramid,
    point: &Point2<f64>,
    guess: &Point2<f64>,
    config: &FlowConfig,
) -> Option<Point2<f64>> {
    let margin = f64::from(config.window / 2) + 1.0;
    if !in_bounds(prev, point, margin) {
        return None;
    }

    let top = prev
        .num_levels()
        .min(next.num_levels())
        .min(config.levels)
        .max(1)
        - 1;
    // accumulated flow in full-resolution pixel units
    let mut flow = guess - point;

    for level in (0..=top).rev() {
        let scale = 1.0 / f64::from(1u32 << level);
        let prev_img = prev.level(level);
        let next_img = next.level(level);
        let px = point.x * scale;
        let py = point.y * scale;
        let half = i64::from(config.window / 2);
        let npix = ((2 * half + 1) * (2 * half + 1)) as f64;

        // spatial gradient matrix of the source patch
        let mut g11 = 0.0f64;
        let mut g12 = 0.0f64;
        let mut g22 = 0.0f64;
        for wy in -half..=half {
            for wx in -half..=half {
                let x = px + wx as f64;
                let y = py + wy as f64;
                let ix = f64::from(sample(prev_img, x + 1.0, y) - sample(prev_img, x - 1.0, y)) * 0.5;
                let iy = f64::from(sample(prev_img, x, y + 1.0) - sample(prev_img, x, y - 1.0)) * 0.5;
                g11 += ix * ix;
                g12 += ix * iy;
                g22 += iy * iy;
            }
        }
        let trace = g11 + g22;
        let min_eig = 0.5 * (trace - ((g11 - g22).powi(2) + 4.0 * g12 * g12).sqrt());
        if min_eig / npix < config.min_eigenvalue {
            if level == 0 {
                return None;
            }
            continue;
        }
        let det = g11 * g22 - g12 * g12;
        let inv_det = 1.0 / det;

        let mut dx = flow.x * scale;
        let mut dy = flow.y * scale;
        for _ in 0..config.iterations {
            let mut bx = 0.0f64;
            let mut by = 0.0f64;
            for wy in -half..=half {
                for wx in -half..=half {
                    let x = px + wx as f64;
                    let y = py + wy as f64;
                    let ix =
                        f64::from(sample(prev_img, x + 1.0, y) - sample(prev_img, x - 1.0, y)) * 0.5;
                    let iy =
                        f64::from(sample(prev_img, x, y + 1.0) - sample(prev_img, x, y - 1.0)) * 0.5;
                    let it = f64::from(sample(next_img, x + dx, y + dy) - sample(prev_img, x, y));
                    bx += ix * it;
                    by += iy * it;
                }
            }
            let step_x = inv_det * (g22 * bx - g12 * by);
            let step_y = inv_det * (g11 * by - g12 * bx);
            dx -= step_x;
            dy -= step_y;
            if step_x * step_x + step_y * step_y < config.epsilon * config.epsilon {
                break;
            }
        }
        flow.x = dx / scale;
        flow.y = dy / scale;
    }

    let refined = point + flow;
    if !in_bounds(next, &refined, margin) {
        return None;
    }
    Some(refined)
}

#[inline]
fn in_bounds(pyr: &Pyramid, p: &Point2<f64>, margin: f64) -> bool {
    p.x >= margin
        && p.y >= margin
        && p.x < f64::from(pyr.width()) - margin
        && p.y < f64::from(pyr.height()) - margin
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    /// Smooth synthetic texture so that shifted copies can be generated
    /// analytically with sub-pixel consistency.
    fn textured(w: u32, h: u32, shift_x: f64, shift_y: f64) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let xf = x as f64 - shift_x;
            let yf = y as f64 - shift_y;
            let v = 128.0 + 55.0 * (xf * 0.21).sin() * (yf * 0.17).cos()
                + 40.0 * (xf * 0.05 + yf * 0.08).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn stationary_points_stay_put() {
        let img = textured(96, 96, 0.0, 0.0);
        let pyr = Pyramid::build(&img, 3);
        let cfg = FlowConfig::default();
        let pts = vec![Point2::new(40.0, 40.0), Point2::new(60.0, 30.0)];
        let got = track(&pyr, &pyr, &pts, &pts, &cfg);
        for (src, dst) in pts.iter().zip(got.iter()) {
            let dst = dst.expect("tracked");
            assert!((dst - src).norm() < 0.1, "drifted to {dst:?}");
        }
    }

    #[test]
    fn recovers_small_translation() {
        let prev = textured(96, 96, 0.0, 0.0);
        let next = textured(96, 96, 3.0, -2.0);
        let prev_pyr = Pyramid::build(&prev, 3);
        let next_pyr = Pyramid::build(&next, 3);
        let cfg = FlowConfig::default();
        let pts = vec![Point2::new(48.0, 48.0), Point2::new(35.0, 60.0)];
        let got = track(&prev_pyr, &next_pyr, &pts, &pts, &cfg);
        for (src, dst) in pts.iter().zip(got.iter()) {
            let dst = dst.expect("tracked");
            let flow = dst - src;
            assert!(
                (flow.x - 3.0).abs() < 0.5 && (flow.y + 2.0).abs() < 0.5,
                "flow {flow:?}"
            );
        }
    }

    #[test]
    fn initial_guess_enables_large_displacement() {
        let prev = textured(128, 96, 0.0, 0.0);
        let next = textured(128, 96, 17.0, 0.0);
        let prev_pyr = Pyramid::build(&prev, 3);
        let next_pyr = Pyramid::build(&next, 3);
        let cfg = FlowConfig::default();
        let pts = vec![Point2::new(50.0, 48.0)];
        let guesses = vec![Point2::new(66.0, 48.0)];
        let got = track(&prev_pyr, &next_pyr, &pts, &guesses, &cfg);
        let dst = got[0].expect("tracked");
        assert!((dst.x - 67.0).abs() < 0.5 && (dst.y - 48.0).abs() < 0.5, "{dst:?}");
    }

    #[test]
    fn flat_patch_is_rejected() {
        let img = GrayImage::from_pixel(64, 64, Luma([100u8]));
        let pyr = Pyramid::build(&img, 3);
        let cfg = FlowConfig::default();
        let pts = vec![Point2::new(32.0, 32.0)];
        let got = track(&pyr, &pyr, &pts, &pts, &cfg);
        assert!(got[0].is_none());
    }

    #[test]
    fn out_of_bounds_source_is_rejected() {
        let img = textured(64, 64, 0.0, 0.0);
        let pyr = Pyramid::build(&img, 3);
        let cfg = FlowConfig::default();
        let pts = vec![Point2::new(2.0, 2.0)];
        let got = track(&pyr, &pyr, &pts, &pts, &cfg);
        assert!(got[0].is_none());
    }
}
