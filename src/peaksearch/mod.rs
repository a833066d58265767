//! Peak search: five algorithms selected per image, plus the shared
//! revalidation post-step.

mod payload;
mod peakfinder8;
mod peakfinder9;
mod prepared;
mod revalidate;
mod zaefferer;

pub use payload::extract_from_payload;
pub use revalidate::revalidate;

use crate::error::{EngineError, ImageProcessError};
use crate::geometry::{Geometry, Image};
use crate::types::PeakList;

/// Which peak-search method to run, with its tunable parameters.
#[derive(Debug, Clone)]
pub enum PeakSearchMethod {
    Zaefferer { grad_threshold: f64, snr_threshold: f64 },
    Peakfinder8 { threshold_sigma: f64, min_pixels: usize, max_pixels: usize, min_res: f64, max_res: f64 },
    Peakfinder9 { bg_sigma_threshold: f64, min_pixels: usize },
    PreparedHdf5,
    PreparedCxi,
    Payload,
}

impl PeakSearchMethod {
    /// Whether this method hands back a list built elsewhere rather than
    /// one found by walking the raw panel data.
    pub fn is_prepared(&self) -> bool {
        matches!(self, PeakSearchMethod::PreparedHdf5 | PeakSearchMethod::PreparedCxi | PeakSearchMethod::Payload)
    }
}

/// A bounded window of pixel values used by search algorithms that walk the
/// raw panel array (zaefferer/peakfinder8/peakfinder9).
pub struct PanelView<'a> {
    pub data: &'a [f64],
    pub bad: &'a [bool],
    pub w: usize,
    pub h: usize,
}

impl<'a> PanelView<'a> {
    pub fn get(&self, fs: isize, ss: isize) -> Option<f64> {
        if fs < 0 || ss < 0 || fs as usize >= self.w || ss as usize >= self.h {
            return None;
        }
        let idx = ss as usize * self.w + fs as usize;
        if self.bad[idx] {
            return None;
        }
        Some(self.data[idx])
    }
}

/// Run the configured peak-search method against `image`, returning the raw
/// peak list (before revalidation).
pub fn search(
    method: &PeakSearchMethod,
    image: &Image,
    geom: &Geometry,
    reject_saturated: bool,
) -> Result<PeakList, EngineError> {
    match method {
        PeakSearchMethod::Zaefferer { grad_threshold, snr_threshold } => {
            zaefferer::run(image, geom, *grad_threshold, *snr_threshold, reject_saturated)
        }
        PeakSearchMethod::Peakfinder8 { threshold_sigma, min_pixels, max_pixels, min_res, max_res } => {
            peakfinder8::run(image, geom, *threshold_sigma, *min_pixels, *max_pixels, *min_res, *max_res)
        }
        PeakSearchMethod::Peakfinder9 { bg_sigma_threshold, min_pixels } => {
            peakfinder9::run(image, geom, *bg_sigma_threshold, *min_pixels)
        }
        PeakSearchMethod::PreparedHdf5 => prepared::from_hdf5_table(image),
        PeakSearchMethod::PreparedCxi => prepared::from_cxi_table(image),
        PeakSearchMethod::Payload => payload::extract_from_payload(image).ok_or_else(|| {
            EngineError::ImageProcess(ImageProcessError::PeakSearchFailed {
                method: "payload".to_string(),
                reason: "no prepared peak list attached to payload".to_string(),
            })
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::test_support::synthetic_image_with_peaks;

    #[test]
    fn zaefferer_finds_injected_peaks() {
        let geom = Geometry::single_panel(64, 64, 100e-6, 0.1, 1.0);
        let positions = [(20.0, 20.0), (40.0, 30.0), (10.0, 50.0)];
        let image = synthetic_image_with_peaks(&geom, &positions, 500.0, 5.0, 1);
        let peaks = search(
            &PeakSearchMethod::Zaefferer { grad_threshold: 10.0, snr_threshold: 3.0 },
            &image,
            &geom,
            false,
        )
        .unwrap();
        assert!(peaks.len() >= positions.len());
        for (fs, ss) in positions {
            let found = peaks
                .peaks
                .iter()
                .any(|p| (p.fs - fs).abs() < 2.0 && (p.ss - ss).abs() < 2.0);
            assert!(found, "expected a peak near ({fs}, {ss})");
        }
    }

}
