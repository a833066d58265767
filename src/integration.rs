//! Integration: concentric-annulus signal/background regions, planar
//! background fit, saturation handling and optional profile fitting
//!.

use crate::config::{IntegrationMethod, Radii};
use crate::geometry::{Geometry, Image};
use crate::types::{Crystal, Reflection};

fn solve3(m: [[f64; 3]; 3], rhs: [f64; 3]) -> Option<[f64; 3]> {
    let det = |mm: [[f64; 3]; 3]| -> f64 {
        mm[0][0] * (mm[1][1] * mm[2][2] - mm[1][2] * mm[2][1])
            - mm[0][1] * (mm[1][0] * mm[2][2] - mm[1][2] * mm[2][0])
            + mm[0][2] * (mm[1][0] * mm[2][1] - mm[1][1] * mm[2][0])
    };
    let d = det(m);
    if d.abs() < 1e-12 {
        return None;
    }
    let mut result = [0.0; 3];
    for col in 0..3 {
        let mut mm = m;
        for row in 0..3 {
            mm[row][col] = rhs[row];
        }
        result[col] = det(mm) / d;
    }
    Some(result)
}

struct Pixel {
    dfs: f64,
    dss: f64,
    value: f64,
    saturated: bool,
}

fn gather_ring(
    image: &Image,
    geom: &Geometry,
    panel_idx: usize,
    cfs: f64,
    css: f64,
    r_lo: f64,
    r_hi: f64,
) -> Option<Vec<Pixel>> {
    let panel = geom.panel(panel_idx)?;
    let data = image.panel_data.get(panel_idx)?;
    let span = r_hi.ceil() as isize;
    let cfs_i = cfs.round() as isize;
    let css_i = css.round() as isize;

    // The whole integration box must fit inside the panel; a reflection
    // whose box would cross the boundary is rejected rather than silently
    // losing the pixels that fall outside it.
    if cfs_i - span < 0 || css_i - span < 0 || cfs_i + span >= panel.w as isize || css_i + span >= panel.h as isize {
        return None;
    }

    let mut out = Vec::new();
    for dss_i in -span..=span {
        for dfs_i in -span..=span {
            let fs_i = cfs_i + dfs_i;
            let ss_i = css_i + dss_i;
            let dfs = fs_i as f64 - cfs;
            let dss = ss_i as f64 - css;
            let r = dfs.hypot(dss);
            if r < r_lo || r > r_hi {
                continue;
            }
            let idx = ss_i as usize * panel.w + fs_i as usize;
            if panel.bad[idx] {
                continue;
            }
            out.push(Pixel {
                dfs,
                dss,
                value: data[idx],
                saturated: panel.is_saturated(fs_i as usize, ss_i as usize, data[idx]),
            });
        }
    }
    Some(out)
}

/// Move the integration centre by up to one pixel toward the intensity
/// centroid of the signal disk at its current position. Falls back to the
/// unmoved centre if the disk is empty or has non-positive total weight.
fn recenter_on_centroid(
    image: &Image,
    geom: &Geometry,
    panel_idx: usize,
    fs: f64,
    ss: f64,
    signal_radius: f64,
) -> (f64, f64) {
    let Some(pixels) = gather_ring(image, geom, panel_idx, fs, ss, 0.0, signal_radius) else {
        return (fs, ss);
    };
    let mut weight = 0.0;
    let mut moment_fs = 0.0;
    let mut moment_ss = 0.0;
    for p in &pixels {
        let w = p.value.max(0.0);
        weight += w;
        moment_fs += w * p.dfs;
        moment_ss += w * p.dss;
    }
    if weight <= 0.0 {
        return (fs, ss);
    }
    let centroid_dfs = moment_fs / weight;
    let centroid_dss = moment_ss / weight;
    let shift = centroid_dfs.hypot(centroid_dss);
    if shift <= 1e-9 {
        return (fs, ss);
    }
    let scale = shift.min(1.0) / shift;
    (fs + centroid_dfs * scale, ss + centroid_dss * scale)
}

/// Fit a plane `value = c0 + c1*dfs + c2*dss` to the background ring by
/// ordinary least squares. Returns the three coefficients.
fn fit_background_plane(pixels: &[Pixel]) -> Option<[f64; 3]> {
    let n = pixels.len() as f64;
    if n == 0.0 {
        return None;
    }
    let (mut sx, mut sy, mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    let (mut s1, mut sv, mut sxv, mut syv) = (0.0, 0.0, 0.0, 0.0);
    for p in pixels {
        sx += p.dfs;
        sy += p.dss;
        sxx += p.dfs * p.dfs;
        syy += p.dss * p.dss;
        sxy += p.dfs * p.dss;
        s1 += 1.0;
        sv += p.value;
        sxv += p.dfs * p.value;
        syv += p.dss * p.value;
    }
    let m = [[s1, sx, sy], [sx, sxx, sxy], [sy, sxy, syy]];
    let rhs = [sv, sxv, syv];
    solve3(m, rhs)
}

fn background_at(plane: [f64; 3], dfs: f64, dss: f64) -> f64 {
    plane[0] + plane[1] * dfs + plane[2] * dss
}

/// Integrate a single reflection's signal region against its fitted
/// background. Mutates `r.intensity`, `r.esd` and `r.flags` in place.
#[allow(clippy::too_many_arguments)]
fn integrate_reflection(
    r: &mut Reflection,
    image: &Image,
    geom: &Geometry,
    radii: &Radii,
    method: IntegrationMethod,
    use_saturated: bool,
    min_bg_pixels: usize,
    recenter: bool,
) {
    let (cfs, css) = if recenter {
        recenter_on_centroid(image, geom, r.panel, r.fs, r.ss, radii.inner)
    } else {
        (r.fs, r.ss)
    };

    let Some(bg_pixels) = gather_ring(image, geom, r.panel, cfs, css, radii.middle, radii.outer) else {
        r.flags.not_integrable = true;
        return;
    };
    if bg_pixels.len() < min_bg_pixels {
        r.flags.not_integrable = true;
        return;
    }
    let Some(plane) = fit_background_plane(&bg_pixels) else {
        r.flags.not_integrable = true;
        return;
    };
    let bg_resid_var = {
        let var = bg_pixels
            .iter()
            .map(|p| (p.value - background_at(plane, p.dfs, p.dss)).powi(2))
            .sum::<f64>()
            / bg_pixels.len() as f64;
        var.max(0.0)
    };

    let Some(signal_pixels) = gather_ring(image, geom, r.panel, cfs, css, 0.0, radii.inner) else {
        r.flags.not_integrable = true;
        return;
    };
    if signal_pixels.is_empty() {
        r.flags.not_integrable = true;
        return;
    }

    let any_saturated = signal_pixels.iter().any(|p| p.saturated);
    r.flags.saturated = any_saturated;

    let usable: Vec<&Pixel> = signal_pixels
        .iter()
        .filter(|p| use_saturated || !p.saturated)
        .collect();
    if usable.is_empty() {
        r.flags.not_integrable = true;
        return;
    }

    let raw_sum: f64 = usable
        .iter()
        .map(|p| p.value - background_at(plane, p.dfs, p.dss))
        .sum();
    // Scale up for any saturated pixels excluded from the sum, assuming a
    // uniform per-pixel signal contribution across the disk.
    let scale = signal_pixels.len() as f64 / usable.len() as f64;
    let mut intensity = raw_sum * scale;

    if method == IntegrationMethod::ProfileFit {
        // Gaussian profile amplitude fit: weight each pixel by its distance
        // from centre instead of a flat sum.
        let sigma = (radii.inner / 2.0).max(1e-6);
        let mut num = 0.0;
        let mut den = 0.0;
        for p in &usable {
            let profile = (-(p.dfs * p.dfs + p.dss * p.dss) / (2.0 * sigma * sigma)).exp();
            let observed = p.value - background_at(plane, p.dfs, p.dss);
            num += profile * observed;
            den += profile * profile;
        }
        if den > 1e-12 {
            let amplitude = num / den;
            let profile_sum: f64 = usable
                .iter()
                .map(|p| (-(p.dfs * p.dfs + p.dss * p.dss) / (2.0 * sigma * sigma)).exp())
                .sum();
            intensity = amplitude * profile_sum * scale;
        }
    }

    let variance = usable.iter().map(|p| p.value.abs()).sum::<f64>() + bg_resid_var * usable.len() as f64;
    r.esd = variance.max(0.0).sqrt() * scale;

    if r.partiality_valid() && r.partiality > 1e-6 {
        let correction = r.lorentz * r.partiality;
        intensity /= correction;
        r.esd /= correction;
    } else {
        r.flags.not_integrable = true;
        return;
    }
    r.intensity = intensity;
}

/// Integrate every reflection of every crystal against the (unfiltered)
/// image snapshot.
#[allow(clippy::too_many_arguments)]
pub fn integrate_crystal(
    crystal: &mut Crystal,
    image: &Image,
    geom: &Geometry,
    radii: &Radii,
    method: IntegrationMethod,
    use_saturated: bool,
    min_bg_pixels: usize,
    recenter: bool,
) {
    for r in &mut crystal.reflections {
        integrate_reflection(r, image, geom, radii, method, use_saturated, min_bg_pixels, recenter);
    }
}
