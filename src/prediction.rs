//! Prediction of which reflections intersect the Ewald sphere for a given
//! orientation, the four partiality models, and simplex-based prediction
//! refinement.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::EngineError;
use crate::geometry::{Geometry, Image, Spectrum, Vec3};
use crate::types::{Centering, Crystal, Hkl, Reflection, ReflectionFlags};

/// Which partiality model to evaluate candidate reflections with.
#[derive(Debug, Clone)]
pub enum PartialityModel {
    /// Partiality 1, Lorentz 1; used when the spectrum is unknown.
    Unity,
    /// Reciprocal-lattice points as spheres of radius `r0 + m*|q|`,
    /// intersected with a finite-width Ewald sphere by numerical
    /// integration (a fixed small number of samples) over the spectrum.
    XSphere { r0: f64, m: f64 },
    /// Gaussian in signed excitation error, width set by the profile
    /// radius.
    EwaldOffset { radius: f64 },
    /// Deterministic pseudo-random partiality, seeded by serial and hkl,
    /// for tests that need a stable but non-trivial partiality value.
    Random { serial: u64 },
}

/// Number of spectral samples taken per component when integrating XSphere
/// overlap over the spectrum; offsets in units of the component's k-width.
const XSPHERE_SAMPLE_OFFSETS: [f64; 5] = [-2.0, -1.0, 0.0, 1.0, 2.0];

/// Pick a partiality model for `crystal` given `image`'s spectrum: XSphere
/// when the spectrum has genuine spectral width to integrate over, Ewald
/// offset when the crystal has a known mosaic spread but the beam is
/// effectively monochromatic, and Unity otherwise.
pub fn select_partiality_model(crystal: &Crystal, image: &Image) -> PartialityModel {
    let has_spectral_width = image
        .spectrum
        .as_ref()
        .map(|s| s.components.len() > 1 || s.components.iter().any(|c| c.k_width > 0.0))
        .unwrap_or(false);
    if has_spectral_width {
        PartialityModel::XSphere { r0: crystal.profile_radius, m: crystal.mosaicity }
    } else if crystal.mosaicity > 0.0 {
        PartialityModel::EwaldOffset { radius: crystal.profile_radius }
    } else {
        PartialityModel::Unity
    }
}

fn forbidden(hkl: Hkl, centering: Centering) -> bool {
    let (h, k, l) = (hkl.h, hkl.k, hkl.l);
    let even = |x: i32| x.rem_euclid(2) == 0;
    match centering {
        Centering::P | Centering::H => false,
        Centering::I => !even(h + k + l),
        Centering::F => !(even(h + k) && even(k + l) && even(h + l)),
        Centering::C => !even(h + k),
        Centering::A => !even(k + l),
        Centering::B => !even(h + l),
        Centering::R => (-h + k + l).rem_euclid(3) != 0,
    }
}

fn lorentz_factor(k_in: &Vec3, k_out: &Vec3) -> f64 {
    let cos_two_theta = (k_in.dot(k_out) / (k_in.norm() * k_out.norm())).clamp(-1.0, 1.0);
    let two_theta = cos_two_theta.acos();
    let s = two_theta.sin().abs().max(1e-6);
    1.0 / s
}

fn solve3(m: [[f64; 3]; 3], rhs: [f64; 3]) -> Option<[f64; 3]> {
    let det = |mm: [[f64; 3]; 3]| -> f64 {
        mm[0][0] * (mm[1][1] * mm[2][2] - mm[1][2] * mm[2][1])
            - mm[0][1] * (mm[1][0] * mm[2][2] - mm[1][2] * mm[2][0])
            + mm[0][2] * (mm[1][0] * mm[2][1] - mm[1][1] * mm[2][0])
    };
    let d = det(m);
    if d.abs() < 1e-30 {
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

/// Project a scattering direction onto whichever panel it hits, returning
/// (panel index, fs, ss). Panels are tried in order; the first in-bounds
/// hit wins.
fn project_to_panel(geom: &Geometry, dir: Vec3) -> Option<(usize, f64, f64)> {
    for (idx, panel) in geom.panels.iter().enumerate() {
        let m = [
            [panel.fs_vec.x, panel.ss_vec.x, -dir.x],
            [panel.fs_vec.y, panel.ss_vec.y, -dir.y],
            [panel.fs_vec.z, panel.ss_vec.z, -dir.z],
        ];
        let rhs = [-panel.origin.x, -panel.origin.y, -panel.origin.z];
        let Some([fs, ss, t]) = solve3(m, rhs) else { continue };
        if t <= 0.0 {
            continue;
        }
        if panel.in_bounds(fs, ss) {
            return Some((idx, fs, ss));
        }
    }
    None
}

/// Overlap of a reciprocal-lattice point of profile radius `r` with the
/// Ewald sphere of a single monochromatic beam at wavenumber `k`.
fn sphere_overlap(q: Vec3, k: f64, r: f64) -> f64 {
    let k_in = Vec3::new(0.0, 0.0, k);
    let k_out = k_in.add(&q);
    let exc = k_out.norm() - k_in.norm();
    (1.0 - (exc / r).abs()).clamp(0.0, 1.0)
}

/// XSphere partiality and predicted k: numerically integrate the sphere
/// overlap over the spectrum by sampling each Gaussian component at a fixed
/// small number of points, weighting by the component weight and the
/// Gaussian density at that offset.
fn xsphere_partiality(q: Vec3, spectrum: &Spectrum, r: f64) -> (f64, f64) {
    let mut weighted_overlap = 0.0;
    let mut weight_total = 0.0;
    let mut k_numerator = 0.0;
    for comp in &spectrum.components {
        let width = comp.k_width.max(1e-20);
        for &t in &XSPHERE_SAMPLE_OFFSETS {
            let k = comp.k_center + t * width;
            let density = (-(t * t) / 2.0).exp();
            let sample_weight = comp.weight * density;
            let overlap = sphere_overlap(q, k, r);
            weighted_overlap += overlap * sample_weight;
            weight_total += sample_weight;
            k_numerator += k * overlap * sample_weight;
        }
    }
    if weight_total <= 0.0 {
        let fallback_k = spectrum.components.first().map(|c| c.k_center).unwrap_or(0.0);
        return (0.0, fallback_k);
    }
    let partiality = (weighted_overlap / weight_total).clamp(0.0, 1.0);
    let predicted_k = if weighted_overlap > 1e-12 {
        k_numerator / weighted_overlap
    } else {
        spectrum.components[0].k_center
    };
    (partiality, predicted_k)
}

fn partiality_for(
    model: &PartialityModel,
    hkl: Hkl,
    q: Vec3,
    k_in: Vec3,
    spectrum_k: f64,
    spectrum: Option<&Spectrum>,
) -> (f64, f64) {
    // Returns (partiality, predicted_k).
    match model {
        PartialityModel::Unity => (1.0, spectrum_k),
        PartialityModel::XSphere { r0, m } => {
            let r = r0 + m * q.norm();
            match spectrum {
                Some(spectrum) => xsphere_partiality(q, spectrum, r),
                None => (sphere_overlap(q, spectrum_k, r), spectrum_k),
            }
        }
        PartialityModel::EwaldOffset { radius } => {
            let k_out = k_in.add(&q);
            let exc = k_out.norm() - k_in.norm();
            let width = radius.max(1e-6);
            ((-(exc * exc) / (2.0 * width * width)).exp(), spectrum_k)
        }
        PartialityModel::Random { serial } => {
            let seed = serial
                .wrapping_mul(2_654_435_761)
                .wrapping_add(hkl.h as u64)
                .wrapping_mul(97)
                .wrapping_add(hkl.k as u64)
                .wrapping_mul(193)
                .wrapping_add(hkl.l as u64);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (rng.gen_range(0.0..1.0), spectrum_k)
        }
    }
}

/// Default excitation-error tolerance, m^-1. Reflections whose reciprocal
/// lattice point misses the Ewald sphere by more than this are dropped.
/// Order-of-magnitude matches a typical still-shot profile radius
/// (~10^-3 to 10^-2 Angstrom^-1).
pub const DEFAULT_EXCITATION_THRESHOLD: f64 = 2.0e7;

/// Generate and project every reflection with resolution <= cutoff (in
/// 1/m) and non-negligible partiality under `model`.
pub fn predict_reflections(
    crystal: &Crystal,
    image: &Image,
    geom: &Geometry,
    model: &PartialityModel,
    excitation_threshold: f64,
) -> Result<Vec<Reflection>, EngineError> {
    let (a_star, b_star, c_star) = crystal.cell.reciprocal();
    let wavelength = if image.wavelength > 0.0 { image.wavelength } else { 1e-10 };
    let k_in = Vec3::new(0.0, 0.0, 1.0 / wavelength);

    // Resolution cutoff: resolve down to half the shortest real-space axis.
    // Bounding each Miller index independently by the matching reciprocal
    // axis length (rather than one shared loop bound) keeps the search
    // tight even for very anisotropic cells.
    let shortest_axis = crystal
        .cell
        .a_vec
        .norm()
        .min(crystal.cell.b_vec.norm())
        .min(crystal.cell.c_vec.norm());
    let max_q = 2.0 / shortest_axis.max(1e-12);
    let hmax = (max_q / a_star.norm().max(1e-12)).ceil() as i32;
    let kmax = (max_q / b_star.norm().max(1e-12)).ceil() as i32;
    let lmax = (max_q / c_star.norm().max(1e-12)).ceil() as i32;

    let mut out = Vec::new();
    for h in -hmax..=hmax {
        for k in -kmax..=kmax {
            for l in -lmax..=lmax {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let hkl = Hkl::new(h, k, l);
                if forbidden(hkl, crystal.cell.centering) {
                    continue;
                }
                let q = a_star
                    .scale(h as f64)
                    .add(&b_star.scale(k as f64))
                    .add(&c_star.scale(l as f64));
                if q.norm() > max_q {
                    continue;
                }
                let k_out = k_in.add(&q);
                let exc = k_out.norm() - k_in.norm();
                if exc.abs() > excitation_threshold {
                    continue;
                }

                let (partiality, predicted_k) =
                    partiality_for(model, hkl, q, k_in, 1.0 / wavelength, image.spectrum.as_ref());
                if partiality <= 1e-6 {
                    continue;
                }

                let Some((panel, fs, ss)) = project_to_panel(geom, k_out) else { continue };

                out.push(Reflection {
                    hkl,
                    fs,
                    ss,
                    panel,
                    excitation_error: exc,
                    predicted_k,
                    lorentz: lorentz_factor(&k_in, &k_out),
                    partiality,
                    intensity: 0.0,
                    esd: 0.0,
                    redundancy: 1,
                    symmetric_equivalent: hkl,
                    flags: ReflectionFlags::default(),
                });
            }
        }
    }
    Ok(out)
}

/// The four parameters refined by `refine_prediction`: two small rotations
/// around lab x/y, the profile radius, and the wavelength.
#[derive(Debug, Clone, Copy)]
pub struct RefinementParams {
    pub rot_x: f64,
    pub rot_y: f64,
    pub radius: f64,
    pub wavelength: f64,
}

const MAX_RADIUS: f64 = 5.0e9;
const MAX_ROTATION_TOTAL: f64 = 5.0_f64.to_radians().to_degrees() * std::f64::consts::PI / 180.0; // 5 degrees in radians

fn rotate_cell(cell: &crate::cell::UnitCell, rot_x: f64, rot_y: f64) -> crate::cell::UnitCell {
    let rx = |v: Vec3| -> Vec3 {
        Vec3::new(v.x, v.y * rot_x.cos() - v.z * rot_x.sin(), v.y * rot_x.sin() + v.z * rot_x.cos())
    };
    let ry = |v: Vec3| -> Vec3 {
        Vec3::new(v.x * rot_y.cos() + v.z * rot_y.sin(), v.y, -v.x * rot_y.sin() + v.z * rot_y.cos())
    };
    let apply = |v: Vec3| ry(rx(v));
    crate::cell::UnitCell {
        a_vec: apply(cell.a_vec),
        b_vec: apply(cell.b_vec),
        c_vec: apply(cell.c_vec),
        lattice_type: cell.lattice_type,
        centering: cell.centering,
    }
}

/// Matching radius (px) within which a predicted reflection is considered
/// to correspond to an observed peak, for residual purposes.
const MATCH_RADIUS_PX: f64 = 4.0;

/// Residual: the scaled log-intensity disagreement between the predicted
/// reflection list and the current reference (observed) peak list. Each
/// predicted reflection is matched to its nearest observed peak within
/// `MATCH_RADIUS_PX`; for a perfect model, `ln(peak.intensity) -
/// ln(partiality)` would be the same constant (the unknown overall scale
/// factor) for every match, so the residual is the variance of that
/// quantity across matches rather than its absolute value — this makes the
/// residual invariant to the nuisance scale and sensitive only to how well
/// the geometry/partiality model explains relative intensities.
fn residual(
    crystal: &Crystal,
    image: &Image,
    geom: &Geometry,
    peaks: &crate::types::PeakList,
    params: RefinementParams,
) -> f64 {
    if params.radius.abs() > MAX_RADIUS || params.wavelength <= 0.0 {
        return f64::INFINITY;
    }
    let rotated_cell = rotate_cell(&crystal.cell, params.rot_x, params.rot_y);
    let mut trial = crystal.clone();
    trial.cell = rotated_cell;
    trial.profile_radius = params.radius;
    let mut trial_image = image.clone();
    trial_image.wavelength = params.wavelength;

    let model = select_partiality_model(&trial, &trial_image);
    let predicted = match predict_reflections(&trial, &trial_image, geom, &model, DEFAULT_EXCITATION_THRESHOLD) {
        Ok(r) => r,
        Err(_) => return f64::INFINITY,
    };
    if predicted.is_empty() {
        return f64::INFINITY;
    }

    let match_radius2 = MATCH_RADIUS_PX * MATCH_RADIUS_PX;
    let mut log_ratios = Vec::new();
    for r in &predicted {
        if r.partiality <= 1e-6 {
            continue;
        }
        let nearest = peaks
            .peaks
            .iter()
            .filter(|p| p.panel == r.panel)
            .filter(|p| p.intensity > 0.0)
            .map(|p| (p, (r.fs - p.fs).powi(2) + (r.ss - p.ss).powi(2)))
            .filter(|(_, d2)| *d2 <= match_radius2)
            .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap());
        if let Some((peak, _)) = nearest {
            log_ratios.push(peak.intensity.ln() - r.partiality.ln());
        }
    }
    if log_ratios.len() < 2 {
        return f64::INFINITY;
    }
    let mean = log_ratios.iter().sum::<f64>() / log_ratios.len() as f64;
    log_ratios.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / log_ratios.len() as f64
}

/// Nelder-Mead simplex minimization of `residual` over the four refinement
/// parameters, starting from the crystal's current cell/radius/wavelength.
/// Also tries the cell under each axis-permutation reindexing and keeps
/// whichever gave the lower final residual.
pub fn refine_prediction(
    crystal: &Crystal,
    image: &Image,
    geom: &Geometry,
    peaks: &crate::types::PeakList,
) -> Option<RefinementParams> {
    let candidates_cells = [
        crystal.cell.clone(),
        crystal.cell.transform([[0, 1, 0], [1, 0, 0], [0, 0, 1]]),
        crystal.cell.transform([[0, 0, 1], [0, 1, 0], [1, 0, 0]]),
    ];

    let mut best: Option<(RefinementParams, f64)> = None;
    for cell in candidates_cells {
        let mut reindexed = crystal.clone();
        reindexed.cell = cell;
        let start = RefinementParams {
            rot_x: 0.0,
            rot_y: 0.0,
            radius: crystal.profile_radius,
            wavelength: image.wavelength,
        };
        if let Some((params, err)) = simplex_minimize(&reindexed, image, geom, peaks, start) {
            if best.as_ref().map(|(_, e)| err < *e).unwrap_or(true) {
                best = Some((params, err));
            }
        }
    }
    best.map(|(p, _)| p)
}

fn params_as_vec(p: RefinementParams) -> [f64; 4] {
    [p.rot_x, p.rot_y, p.radius, p.wavelength]
}

fn vec_as_params(v: [f64; 4]) -> RefinementParams {
    RefinementParams { rot_x: v[0], rot_y: v[1], radius: v[2], wavelength: v[3] }
}

fn simplex_minimize(
    crystal: &Crystal,
    image: &Image,
    geom: &Geometry,
    peaks: &crate::types::PeakList,
    start: RefinementParams,
) -> Option<(RefinementParams, f64)> {
    let f = |v: [f64; 4]| -> f64 {
        let p = vec_as_params(v);
        if p.rot_x.hypot(p.rot_y).abs() > MAX_ROTATION_TOTAL {
            return f64::INFINITY;
        }
        residual(crystal, image, geom, peaks, p)
    };

    let step = [0.01_f64.to_radians(), 0.01_f64.to_radians(), start.radius * 0.05, start.wavelength * 0.001];
    let mut simplex: Vec<[f64; 4]> = Vec::with_capacity(5);
    simplex.push(params_as_vec(start));
    for i in 0..4 {
        let mut v = params_as_vec(start);
        v[i] += step[i].max(1e-12);
        simplex.push(v);
    }
    let mut values: Vec<f64> = simplex.iter().map(|v| f(*v)).collect();

    for _ in 0..80 {
        let mut order: Vec<usize> = (0..5).collect();
        order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap());
        let (best, worst, second_worst) = (order[0], order[4], order[3]);

        let centroid: [f64; 4] = {
            let mut c = [0.0; 4];
            for &i in &order[0..4] {
                for d in 0..4 {
                    c[d] += simplex[i][d] / 4.0;
                }
            }
            c
        };

        let reflect = |scale: f64| -> [f64; 4] {
            let mut r = [0.0; 4];
            for d in 0..4 {
                r[d] = centroid[d] + scale * (centroid[d] - simplex[worst][d]);
            }
            r
        };

        let xr = reflect(1.0);
        let fr = f(xr);

        if fr < values[best] {
            let xe = reflect(2.0);
            let fe = f(xe);
            if fe < fr {
                simplex[worst] = xe;
                values[worst] = fe;
            } else {
                simplex[worst] = xr;
                values[worst] = fr;
            }
        } else if fr < values[second_worst] {
            simplex[worst] = xr;
            values[worst] = fr;
        } else {
            let xc = reflect(-0.5);
            let fc = f(xc);
            if fc < values[worst] {
                simplex[worst] = xc;
                values[worst] = fc;
            } else {
                for &i in &order[1..5] {
                    let best_point = simplex[best];
                    for (coord, best_coord) in simplex[i].iter_mut().zip(best_point.iter()) {
                        *coord = best_coord + 0.5 * (*coord - best_coord);
                    }
                    values[i] = f(simplex[i]);
                }
            }
        }
    }

    let best_idx = (0..5).min_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap())?;
    if !values[best_idx].is_finite() {
        return None;
    }
    Some((vec_as_params(simplex[best_idx]), values[best_idx]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{reference_cubic_cell, synthetic_image_from_cell};
    use crate::geometry::Geometry;

    #[test]
    fn predicted_reflections_stay_within_panel_bounds() {
        let geom = Geometry::single_panel(512, 512, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let crystal = Crystal::new(cell, "test");
        let image = synthetic_image_from_cell(&geom, &crystal.cell, 0.0).0;
        let reflections =
            predict_reflections(&crystal, &image, &geom, &PartialityModel::Unity, DEFAULT_EXCITATION_THRESHOLD).unwrap();
        assert!(!reflections.is_empty());
        for r in &reflections {
            let panel = geom.panel(r.panel).unwrap();
            assert!(panel.in_bounds(r.fs, r.ss));
        }
    }

    #[test]
    fn forbidden_reflections_skipped_for_i_centering() {
        assert!(forbidden(Hkl::new(1, 0, 0), Centering::I));
        assert!(!forbidden(Hkl::new(1, 1, 0), Centering::I));
    }

    #[test]
    fn unity_model_gives_full_partiality() {
        let (p, _) = partiality_for(
            &PartialityModel::Unity,
            Hkl::new(1, 0, 0),
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 1e10),
            1e10,
            None,
        );
        assert_eq!(p, 1.0);
    }

    #[test]
    fn xsphere_model_integrates_over_spectrum_width() {
        let spectrum = Spectrum {
            components: vec![crate::geometry::SpectrumComponent { k_center: 1e10, k_width: 1e7, weight: 1.0 }],
        };
        let (p, k) = partiality_for(
            &PartialityModel::XSphere { r0: 1e8, m: 0.0 },
            Hkl::new(1, 0, 0),
            Vec3::ZERO,
            Vec3::new(0.0, 0.0, 1e10),
            1e10,
            Some(&spectrum),
        );
        assert!((0.0..=1.0).contains(&p));
        assert!(p > 0.0);
        assert!(k.is_finite());
    }

    #[test]
    fn select_partiality_model_picks_xsphere_for_wide_spectrum() {
        let cell = reference_cubic_cell(50e-10);
        let crystal = Crystal::new(cell, "test");
        let geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
        let (mut image, _) = synthetic_image_from_cell(&geom, &crystal.cell, 0.0);
        image.spectrum = Some(Spectrum {
            components: vec![crate::geometry::SpectrumComponent { k_center: 1e10, k_width: 1e7, weight: 1.0 }],
        });
        assert!(matches!(select_partiality_model(&crystal, &image), PartialityModel::XSphere { .. }));
    }
}
