//! Engine configuration and defaults.
//!
//! `EngineConfig` collects every knob the core touches, independent of how
//! it was parsed from the CLI (see `main.rs` for the `clap` surface).

use crate::cell::{CellTolerance, UnitCell};
use crate::peaksearch::PeakSearchMethod;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    Rings,
    ProfileFit,
}

/// Filters applied to the peak-search copy of an image only; the copy used
/// for indexing/integration is always the raw snapshot. Both stages are
/// optional and may be combined.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FilterConfig {
    /// Odd box side `2n+1` for the median-background filter; `None` skips it.
    pub median_box: Option<usize>,
    /// Zero every 3x3 block of the image that contains a negative pixel.
    pub noise_filter: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Radii {
    pub inner: f64,
    pub middle: f64,
    pub outer: f64,
}

impl Radii {
    pub fn new(inner: f64, middle: f64, outer: f64) -> Self {
        Radii { inner, middle, outer }
    }
}

/// Flags controlling the indexing driver's single-pass and retry/multi
/// logic.
#[derive(Debug, Clone, Copy)]
pub struct IndexingFlags {
    pub check_cell_axes: bool,
    pub check_cell_combinations: bool,
    pub refine: bool,
    pub check_peaks: bool,
    pub retry: bool,
    pub multi: bool,
}

impl Default for IndexingFlags {
    fn default() -> Self {
        IndexingFlags {
            check_cell_axes: true,
            check_cell_combinations: false,
            refine: true,
            check_peaks: true,
            retry: true,
            multi: false,
        }
    }
}

/// Engine-wide configuration, generalized from per-image-pipeline options
/// down to the peak-search/indexing/integration parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub min_peaks: usize,
    pub peak_search: PeakSearchMethod,
    pub peak_radii: Radii,
    pub filter: FilterConfig,
    pub integration: IntegrationMethod,
    pub integration_radii: Radii,
    pub indexing_backends: Vec<String>,
    pub reference_cell: Option<UnitCell>,
    pub tolerance: CellTolerance,
    pub flags: IndexingFlags,
    pub push_res: f64,
    pub highres: Option<f64>,
    pub wait_for_file: i32,
    pub num_workers: usize,
    pub temp_dir: String,
    pub reorder_buffer_bound: usize,
    pub stall_timeout_secs: u64,
    pub retry_rounds: usize,
    pub retry_peaks_removed: usize,
    pub peak_check_fraction: f64,
    pub peak_check_radius_px: f64,
    pub use_saturated: bool,
    pub min_bg_pixels: usize,
    pub revalidate_prepared_peaks: bool,
    pub revalidate_min_snr: f64,
    pub recenter_on_signal_centroid: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_peaks: 10,
            peak_search: PeakSearchMethod::Zaefferer { grad_threshold: 100_000.0, snr_threshold: 5.0 },
            peak_radii: Radii::new(3.0, 4.0, 5.0),
            filter: FilterConfig::default(),
            integration: IntegrationMethod::Rings,
            integration_radii: Radii::new(3.0, 4.0, 5.0),
            indexing_backends: vec!["test-cell".to_string()],
            reference_cell: None,
            tolerance: CellTolerance::default(),
            flags: IndexingFlags::default(),
            push_res: 0.0,
            highres: None,
            wait_for_file: 0,
            num_workers: num_cpus::get().max(1),
            temp_dir: std::env::temp_dir().to_string_lossy().to_string(),
            reorder_buffer_bound: 256,
            stall_timeout_secs: 30,
            retry_rounds: 3,
            retry_peaks_removed: 5,
            peak_check_fraction: 0.5,
            peak_check_radius_px: 4.0,
            use_saturated: true,
            min_bg_pixels: 6,
            revalidate_prepared_peaks: true,
            revalidate_min_snr: 5.0,
            recenter_on_signal_centroid: false,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.min_peaks > 0);
        assert!(cfg.num_workers >= 1);
        assert!(cfg.peak_radii.inner < cfg.peak_radii.middle);
        assert!(cfg.peak_radii.middle < cfg.peak_radii.outer);
    }
}
