//! Synthetic image/cell builders shared by unit tests across modules.
//! Not part of the public API; gated behind `cfg(test)` in `lib.rs`.

use crate::cell::UnitCell;
use crate::geometry::{Geometry, Image, Spectrum};
use crate::prediction::{predict_reflections, PartialityModel};
use crate::types::{Centering, Crystal, LatticeType, Peak, PeakList};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// A cubic reference cell with edge length `a` metres, P centering.
pub fn reference_cubic_cell(a: f64) -> UnitCell {
    UnitCell::from_parameters(
        a,
        a,
        a,
        std::f64::consts::FRAC_PI_2,
        std::f64::consts::FRAC_PI_2,
        std::f64::consts::FRAC_PI_2,
        LatticeType::Cubic,
        Centering::P,
    )
    .unwrap()
}

/// Build a single-panel image whose panel data is flat background noise
/// with Gaussian bumps of the given peak height injected at `positions`
/// (fs, ss), plus deterministic low-amplitude noise seeded by `serial`.
pub fn synthetic_image_with_peaks(
    geom: &Geometry,
    positions: &[(f64, f64)],
    peak_height: f64,
    bg_sigma: f64,
    serial: u64,
) -> Image {
    let panel = &geom.panels[0];
    let mut data = vec![0.0_f64; panel.w * panel.h];

    let mut rng = ChaCha8Rng::seed_from_u64(serial);
    for ss in 0..panel.h {
        for fs in 0..panel.w {
            data[ss * panel.w + fs] = 100.0 + rng.gen_range(-bg_sigma..bg_sigma);
        }
    }

    for &(pfs, pss) in positions {
        let cfs = pfs.round() as isize;
        let css = pss.round() as isize;
        for dfs in -2..=2 {
            for dss in -2..=2 {
                let nfs = cfs + dfs;
                let nss = css + dss;
                if nfs < 0 || nss < 0 || nfs as usize >= panel.w || nss as usize >= panel.h {
                    continue;
                }
                let r2 = (dfs * dfs + dss * dss) as f64;
                let amplitude = peak_height * (-r2 / 2.0).exp();
                data[nss as usize * panel.w + nfs as usize] += amplitude;
            }
        }
    }

    Image {
        serial,
        filename: "synthetic".to_string(),
        event: None,
        wavelength: 1e-10,
        spectrum: Some(Spectrum::monochromatic(1e-10)),
        panel_data: vec![data],
        metadata: HashMap::new(),
        prepared_peaks: None,
    }
}

/// Build an image and matching peak list geometrically consistent with
/// `cell`: every peak sits exactly on a predicted (Unity-model) reflection,
/// so the indexing driver's reference backend can recover the orientation.
pub fn synthetic_image_from_cell(
    geom: &Geometry,
    cell: &UnitCell,
    wavelength_offset: f64,
) -> (Image, PeakList) {
    let wavelength = 1e-10 + wavelength_offset;
    let crystal = Crystal::new(cell.clone(), "synthetic");
    let image = Image {
        serial: 1,
        filename: "synthetic".to_string(),
        event: None,
        wavelength,
        spectrum: Some(Spectrum::monochromatic(wavelength)),
        panel_data: geom.panels.iter().map(|p| vec![0.0; p.w * p.h]).collect(),
        metadata: HashMap::new(),
        prepared_peaks: None,
    };

    let reflections = predict_reflections(&crystal, &image, geom, &PartialityModel::Unity, crate::prediction::DEFAULT_EXCITATION_THRESHOLD)
        .expect("synthetic prediction should not fail");
    let peaks = PeakList {
        peaks: reflections
            .iter()
            .map(|r| Peak::new(r.fs, r.ss, r.panel, 1000.0))
            .collect(),
    };

    let mut image = image;
    image.prepared_peaks = Some(peaks.clone());
    (image, peaks)
}
