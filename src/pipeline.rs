//! Per-image pipeline: filter -> peak search -> index -> refine
//! -> integrate -> chunk assembly. The unfiltered image snapshot taken at
//! entry is the only one ever passed to indexing/refinement/integration;
//! the filtered copy exists solely to help peak search.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::cell::UnitCell;
use crate::config::{EngineConfig, FilterConfig};
use crate::error::EngineError;
use crate::geometry::{Geometry, Image, Vec3};
use crate::indexing::{self, IndexingBackend};
use crate::integration;
use crate::peaksearch;
use crate::prediction;
use crate::types::{Chunk, ChunkMetadata, PeakList, TimingAccount};

const EXCITATION_THRESHOLD_M: f64 = prediction::DEFAULT_EXCITATION_THRESHOLD;

/// Output of a single successful pipeline run.
pub struct PipelineOutput {
    pub chunk: Chunk,
    pub timing: TimingAccount,
}

fn median_of(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    values[values.len() / 2]
}

/// A median-background estimate over a `box_side` x `box_side` window
/// (box_side odd), subtracted from the raw value. Used only to feed peak
/// search; never seen by indexing or integration.
fn median_filtered(image: &Image, geom: &Geometry, box_side: usize) -> Image {
    let half = (box_side / 2) as isize;
    let mut filtered = image.clone();
    for (panel, data) in geom.panels.iter().zip(filtered.panel_data.iter_mut()) {
        let original = data.clone();
        for ss in 0..panel.h {
            for fs in 0..panel.w {
                let mut window = Vec::with_capacity(box_side * box_side);
                for dss in -half..=half {
                    for dfs in -half..=half {
                        let nfs = fs as isize + dfs;
                        let nss = ss as isize + dss;
                        let v = if nfs < 0 || nss < 0 || nfs as usize >= panel.w || nss as usize >= panel.h {
                            original[ss * panel.w + fs]
                        } else {
                            original[nss as usize * panel.w + nfs as usize]
                        };
                        window.push(v);
                    }
                }
                let median = median_of(&mut window);
                data[ss * panel.w + fs] = original[ss * panel.w + fs] - median;
            }
        }
    }
    filtered
}

/// Zero every 3x3 block of the image that contains any negative pixel. Used
/// only to feed peak search; never seen by indexing or integration.
fn noise_filtered(image: &Image, geom: &Geometry) -> Image {
    let mut filtered = image.clone();
    for (panel, data) in geom.panels.iter().zip(filtered.panel_data.iter_mut()) {
        let original = data.clone();
        for ss in 0..panel.h {
            for fs in 0..panel.w {
                let mut any_negative = false;
                for dss in -1isize..=1 {
                    for dfs in -1isize..=1 {
                        let nfs = fs as isize + dfs;
                        let nss = ss as isize + dss;
                        if nfs < 0 || nss < 0 || nfs as usize >= panel.w || nss as usize >= panel.h {
                            continue;
                        }
                        if original[nss as usize * panel.w + nfs as usize] < 0.0 {
                            any_negative = true;
                        }
                    }
                }
                if any_negative {
                    data[ss * panel.w + fs] = 0.0;
                }
            }
        }
    }
    filtered
}

/// Build the peak-search-only snapshot: an optional median filter followed
/// by an optional 3x3 noise filter, applied in that order. Neither stage
/// runs by default; the raw `image` is what indexing/integration always see.
fn apply_filters(image: &Image, geom: &Geometry, filter: &FilterConfig) -> Image {
    let mut current = image.clone();
    if let Some(box_side) = filter.median_box {
        current = median_filtered(&current, geom, box_side);
    }
    if filter.noise_filter {
        current = noise_filtered(&current, geom);
    }
    current
}

/// Drop peaks whose resolution (1/d, m^-1) falls outside `highres`/`push_res`.
fn apply_resolution_cutoff(
    peaks: PeakList,
    geom: &Geometry,
    image: &Image,
    push_res: f64,
    highres: Option<f64>,
) -> PeakList {
    if highres.is_none() && push_res <= 0.0 {
        return peaks;
    }
    let kept = peaks
        .peaks
        .into_iter()
        .filter(|p| {
            let Some(panel) = geom.panel(p.panel) else { return false };
            let pos = panel.project(p.fs, p.ss);
            let clen = panel.resolve_clen(&image.metadata).unwrap_or(pos.z);
            let in_plane = Vec3::new(pos.x, pos.y, 0.0).norm();
            let resolution_limit = highres.map(|d| 1.0 / d).unwrap_or(f64::INFINITY);
            let two_theta = (in_plane / clen.max(1e-12)).atan();
            let q = 2.0 * (two_theta / 2.0).sin() / image.wavelength.max(1e-15);
            q <= resolution_limit + push_res
        })
        .collect();
    PeakList { peaks: kept }
}

fn num_saturated_peaks(peaks: &PeakList, geom: &Geometry) -> usize {
    peaks
        .peaks
        .iter()
        .filter(|p| {
            geom.panel(p.panel)
                .map(|panel| panel.is_saturated(p.fs.round() as usize, p.ss.round() as usize, p.intensity))
                .unwrap_or(false)
        })
        .count()
}

fn apply_refinement(
    crystal: &mut crate::types::Crystal,
    params: &prediction::RefinementParams,
) {
    let rx = |v: Vec3| -> Vec3 {
        Vec3::new(v.x, v.y * params.rot_x.cos() - v.z * params.rot_x.sin(), v.y * params.rot_x.sin() + v.z * params.rot_x.cos())
    };
    let ry = |v: Vec3| -> Vec3 {
        Vec3::new(v.x * params.rot_y.cos() + v.z * params.rot_y.sin(), v.y, -v.x * params.rot_y.sin() + v.z * params.rot_y.cos())
    };
    let apply = |v: Vec3| ry(rx(v));
    crystal.cell = UnitCell {
        a_vec: apply(crystal.cell.a_vec),
        b_vec: apply(crystal.cell.b_vec),
        c_vec: apply(crystal.cell.c_vec),
        lattice_type: crystal.cell.lattice_type,
        centering: crystal.cell.centering,
    };
    crystal.profile_radius = params.radius;
}

/// Run the full per-image pipeline against `image`. Returns `Ok(None)` if
/// cancellation was observed at a stage boundary; no partial chunk is ever
/// produced in that case.
#[allow(clippy::too_many_arguments)]
pub fn process_image(
    image: &Image,
    geom: &Geometry,
    config: &EngineConfig,
    backends: &[Box<dyn IndexingBackend>],
    cancel: &AtomicBool,
) -> Result<Option<PipelineOutput>, EngineError> {
    let mut timing = TimingAccount::default();
    if cancel.load(Ordering::Relaxed) {
        return Ok(None);
    }

    let t0 = Instant::now();
    let filtered = apply_filters(image, geom, &config.filter);
    timing.filter_ns = t0.elapsed().as_nanos() as u64;
    if cancel.load(Ordering::Relaxed) {
        return Ok(None);
    }

    let t1 = Instant::now();
    let raw_peaks = peaksearch::search(&config.peak_search, &filtered, geom, !config.use_saturated)?;
    let skip_revalidate = config.peak_search.is_prepared() && !config.revalidate_prepared_peaks;
    let revalidated = if skip_revalidate {
        raw_peaks
    } else {
        peaksearch::revalidate(raw_peaks, image, geom, config.revalidate_min_snr)
    };
    let peaks = apply_resolution_cutoff(revalidated, geom, image, config.push_res, config.highres);
    timing.peaksearch_ns = t1.elapsed().as_nanos() as u64;
    if cancel.load(Ordering::Relaxed) {
        return Ok(None);
    }

    let mut crystals = Vec::new();
    if peaks.len() >= config.min_peaks {
        let t2 = Instant::now();
        crystals = indexing::index_image(
            backends,
            image,
            geom,
            &peaks,
            config.reference_cell.as_ref(),
            &config.tolerance,
            &config.flags,
            config.retry_rounds,
            config.retry_peaks_removed,
            config.peak_check_fraction,
            config.peak_check_radius_px,
        )?;
        timing.indexing_ns = t2.elapsed().as_nanos() as u64;

        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let t3 = Instant::now();
        if config.flags.refine {
            for crystal in &mut crystals {
                if let Some(params) = prediction::refine_prediction(crystal, image, geom, &peaks) {
                    apply_refinement(crystal, &params);
                }
            }
        }
        for crystal in &mut crystals {
            let model = prediction::select_partiality_model(crystal, image);
            crystal.reflections =
                prediction::predict_reflections(crystal, image, geom, &model, EXCITATION_THRESHOLD_M)?;
        }
        timing.refine_ns = t3.elapsed().as_nanos() as u64;

        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let t4 = Instant::now();
        for crystal in &mut crystals {
            integration::integrate_crystal(
                crystal,
                image,
                geom,
                &config.integration_radii,
                config.integration,
                config.use_saturated,
                config.min_bg_pixels,
                config.recenter_on_signal_centroid,
            );
            if !config.use_saturated {
                crystal.reflections.retain(|r| !r.flags.saturated);
            }
        }
        timing.integration_ns = t4.elapsed().as_nanos() as u64;
    }

    let photon_energy_ev = geom
        .panel(0)
        .and_then(|p| p.resolve_photon_energy(&image.metadata).ok())
        .unwrap_or(0.0);

    let chunk = Chunk {
        filename: image.filename.clone(),
        event: image.event.clone(),
        serial: image.serial,
        wavelength: image.wavelength,
        metadata: ChunkMetadata { photon_energy_ev, copy_fields: Vec::new() },
        num_saturated_peaks: num_saturated_peaks(&peaks, geom),
        indexed_by: crystals.first().map(|c| c.indexed_by.clone()),
        peaks: Some(peaks),
        crystals,
    };

    Ok(Some(PipelineOutput { chunk, timing }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::ReferenceLatticeBackend;
    use crate::test_support::{reference_cubic_cell, synthetic_image_from_cell};

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn hit_image_produces_chunk_with_crystal() {
        let geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let (image, _peaks) = synthetic_image_from_cell(&geom, &cell, 0.0);
        let backends: Vec<Box<dyn IndexingBackend>> =
            vec![Box::new(ReferenceLatticeBackend::new(cell.clone()))];
        let mut config = EngineConfig::default();
        config.peak_search = peaksearch::PeakSearchMethod::Payload;
        config.reference_cell = Some(cell);
        config.min_peaks = 4;
        config.flags.refine = false;
        // The synthetic image carries peaks at exact predicted positions but
        // no rendered pixel data behind them, so there's nothing for revalidate
        // to recompute SNR against.
        config.revalidate_prepared_peaks = false;
        let cancel = AtomicBool::new(false);
        let out = process_image(&image, &geom, &config, &backends, &cancel).unwrap().unwrap();
        assert!(out.chunk.is_hit());
        assert!(!out.chunk.crystals[0].reflections.is_empty());
    }

    #[test]
    fn cancellation_before_start_yields_no_chunk() {
        let geom = Geometry::single_panel(32, 32, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let (image, _peaks) = synthetic_image_from_cell(&geom, &cell, 0.0);
        let backends: Vec<Box<dyn IndexingBackend>> = Vec::new();
        let config = EngineConfig::default();
        let cancel = AtomicBool::new(true);
        let out = process_image(&image, &geom, &config, &backends, &cancel).unwrap();
        assert!(out.is_none());
    }
}
