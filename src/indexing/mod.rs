//! Indexing driver: invokes one or more backends, validates candidates
//! against a reference cell and the observed peaks, and drives the
//! retry/multi-lattice loops.

mod backend;

pub use backend::{BackendCapabilities, BackendHandle, ExternalProcessBackend, IndexingBackend, ReferenceLatticeBackend};

use crate::cell::{match_against_reference, CellTolerance};
use crate::config::IndexingFlags;
use crate::error::EngineError;
use crate::geometry::{Geometry, Image};
use crate::prediction::{predict_reflections, select_partiality_model};
use crate::types::{Crystal, PeakList, RejectReason};

/// One round of the single-pass indexing logic: try each
/// backend in order, validate its candidates, and accept the first/ best
/// that passes. Returns the accepted crystals from this pass (normally at
/// most one, but a backend may offer several equally-valid candidates).
#[allow(clippy::too_many_arguments)]
fn single_pass(
    backends: &[Box<dyn IndexingBackend>],
    image: &Image,
    geom: &Geometry,
    peaks: &PeakList,
    reference_cell: Option<&crate::cell::UnitCell>,
    tol: &CellTolerance,
    flags: &IndexingFlags,
    peak_check_fraction: f64,
    peak_check_radius_px: f64,
) -> Result<Vec<Crystal>, EngineError> {
    for backend in backends {
        let handle = match backend.prepare(reference_cell, tol, *flags) {
            Ok(h) => h,
            Err(_) => continue,
        };
        let candidates = match backend.index(image, peaks, &handle) {
            Ok(c) if !c.is_empty() => c,
            _ => {
                backend.cleanup(handle);
                continue;
            }
        };
        backend.cleanup(handle);

        let mut best: Option<(crate::cell::UnitCell, f64)> = None;
        for candidate in candidates {
            let resolved = if let Some(reference) = reference_cell
                .filter(|_| flags.check_cell_axes || flags.check_cell_combinations)
            {
                match match_against_reference(&candidate, reference, tol, flags.check_cell_combinations) {
                    Some((cell, err)) => (cell, err),
                    None => continue,
                }
            } else {
                (candidate, 0.0)
            };

            if flags.check_peaks {
                let crystal = Crystal::new(resolved.0.clone(), backend.name());
                let model = select_partiality_model(&crystal, image);
                let predicted = predict_reflections(&crystal, image, geom, &model, crate::prediction::DEFAULT_EXCITATION_THRESHOLD)?;
                let fraction = peak_match_fraction(&predicted, peaks, peak_check_radius_px);
                if fraction < peak_check_fraction {
                    continue;
                }
            }

            match &best {
                Some((_, best_err)) if *best_err <= resolved.1 => {}
                _ => best = Some(resolved),
            }
        }

        if let Some((cell, _)) = best {
            let mut crystal = Crystal::new(cell, backend.name());
            let model = select_partiality_model(&crystal, image);
            crystal.reflections =
                predict_reflections(&crystal, image, geom, &model, crate::prediction::DEFAULT_EXCITATION_THRESHOLD)?;
            return Ok(vec![crystal]);
        }
    }
    Ok(Vec::new())
}

fn peak_match_fraction(
    predicted: &[crate::types::Reflection],
    peaks: &PeakList,
    radius_px: f64,
) -> f64 {
    if peaks.is_empty() {
        return 0.0;
    }
    let matched = peaks
        .peaks
        .iter()
        .filter(|p| {
            predicted.iter().any(|r| {
                r.panel == p.panel
                    && ((r.fs - p.fs).powi(2) + (r.ss - p.ss).powi(2)).sqrt() <= radius_px
            })
        })
        .count();
    matched as f64 / peaks.len() as f64
}

/// Peaks "accounted for" by a crystal: those within `radius_px` of one of
/// its predicted reflections. Used to thin the peak list between retry and
/// multi-lattice rounds.
fn peaks_accounted_for(crystal: &Crystal, peaks: &PeakList, radius_px: f64) -> Vec<usize> {
    peaks
        .peaks
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            crystal.reflections.iter().any(|r| {
                r.panel == p.panel
                    && ((r.fs - p.fs).powi(2) + (r.ss - p.ss).powi(2)).sqrt() <= radius_px
            })
        })
        .map(|(i, _)| i)
        .collect()
}

/// Run the full indexing driver (single pass, retry, multi) against one
/// image's peak list.
#[allow(clippy::too_many_arguments)]
pub fn index_image(
    backends: &[Box<dyn IndexingBackend>],
    image: &Image,
    geom: &Geometry,
    peaks: &PeakList,
    reference_cell: Option<&crate::cell::UnitCell>,
    tol: &CellTolerance,
    flags: &IndexingFlags,
    retry_rounds: usize,
    retry_peaks_removed: usize,
    peak_check_fraction: f64,
    peak_check_radius_px: f64,
) -> Result<Vec<Crystal>, EngineError> {
    let mut working_peaks = peaks.clone();
    let mut crystals = Vec::new();

    let mut first = single_pass(
        backends,
        image,
        geom,
        &working_peaks,
        reference_cell,
        tol,
        flags,
        peak_check_fraction,
        peak_check_radius_px,
    )?;

    if first.is_empty() && flags.retry {
        for _ in 0..retry_rounds {
            working_peaks.remove_weakest(retry_peaks_removed);
            if working_peaks.is_empty() {
                break;
            }
            first = single_pass(
                backends,
                image,
                geom,
                &working_peaks,
                reference_cell,
                tol,
                flags,
                peak_check_fraction,
                peak_check_radius_px,
            )?;
            if !first.is_empty() {
                break;
            }
        }
    }

    if first.is_empty() {
        return Ok(crystals);
    }
    crystals.append(&mut first);

    if flags.multi {
        loop {
            let last = crystals.last().unwrap();
            let accounted = peaks_accounted_for(last, &working_peaks, peak_check_radius_px);
            if accounted.is_empty() {
                break;
            }
            let mut remaining = Vec::with_capacity(working_peaks.len());
            for (i, p) in working_peaks.peaks.iter().enumerate() {
                if !accounted.contains(&i) {
                    remaining.push(p.clone());
                }
            }
            working_peaks = PeakList { peaks: remaining };
            if working_peaks.is_empty() {
                break;
            }
            let next = single_pass(
                backends,
                image,
                geom,
                &working_peaks,
                reference_cell,
                tol,
                flags,
                peak_check_fraction,
                peak_check_radius_px,
            )?;
            if next.is_empty() {
                break;
            }
            crystals.extend(next);
        }
    }

    for crystal in &mut crystals {
        crystal.user_flag = RejectReason::None;
    }

    Ok(crystals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::test_support::{reference_cubic_cell, synthetic_image_from_cell};

    #[test]
    fn single_lattice_indexes_with_reference_backend() {
        let geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let (image, peaks) = synthetic_image_from_cell(&geom, &cell, 0.0);
        let backends: Vec<Box<dyn IndexingBackend>> =
            vec![Box::new(ReferenceLatticeBackend::new(cell.clone()))];
        let flags = IndexingFlags {
            check_cell_axes: true,
            check_cell_combinations: false,
            refine: false,
            check_peaks: true,
            retry: true,
            multi: false,
        };
        let tol = CellTolerance::default();
        let crystals = index_image(
            &backends,
            &image,
            &geom,
            &peaks,
            Some(&cell),
            &tol,
            &flags,
            3,
            5,
            0.3,
            2.0,
        )
        .unwrap();
        assert_eq!(crystals.len(), 1);
    }

    #[test]
    fn mismatched_reference_cell_rejects_candidate() {
        let geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let other_reference = reference_cubic_cell(80e-10);
        let (image, peaks) = synthetic_image_from_cell(&geom, &cell, 0.0);
        let backends: Vec<Box<dyn IndexingBackend>> =
            vec![Box::new(ReferenceLatticeBackend::new(cell.clone()))];
        let flags = IndexingFlags {
            check_cell_axes: true,
            check_cell_combinations: false,
            refine: false,
            check_peaks: false,
            retry: false,
            multi: false,
        };
        let tol = CellTolerance::default();
        let crystals = index_image(
            &backends,
            &image,
            &geom,
            &peaks,
            Some(&other_reference),
            &tol,
            &flags,
            0,
            0,
            0.3,
            2.0,
        )
        .unwrap();
        assert!(crystals.is_empty());
    }
}
