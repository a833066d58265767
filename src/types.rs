//! Core data structures for the engine.
//!
//! These mirror the data model described for images, peaks, crystals and
//! reflections: an image owns zero or more crystals, each crystal owns its
//! own reflection list, and peak lists are replaced wholesale rather than
//! mutated in place.

use std::fmt;

/// Bravais lattice type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatticeType {
    Triclinic,
    Monoclinic,
    Orthorhombic,
    Tetragonal,
    Rhombohedral,
    Hexagonal,
    Cubic,
}

/// Centering symbol: P, A, B, C, I, F, R, H.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Centering {
    P,
    A,
    B,
    C,
    I,
    F,
    R,
    H,
}

impl fmt::Display for Centering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Centering::P => "P",
            Centering::A => "A",
            Centering::B => "B",
            Centering::C => "C",
            Centering::I => "I",
            Centering::F => "F",
            Centering::R => "R",
            Centering::H => "H",
        };
        write!(f, "{c}")
    }
}

/// A single Bragg peak found by peak search.
///
/// Coordinates are panel-relative pixel units (fs, ss), with the half-pixel
/// convention applied by the peak-search method that produced the list.
#[derive(Debug, Clone, PartialEq)]
pub struct Peak {
    pub fs: f64,
    pub ss: f64,
    pub panel: usize,
    pub intensity: f64,
    pub background: Option<f64>,
    pub resolution: Option<f64>,
}

impl Peak {
    pub fn new(fs: f64, ss: f64, panel: usize, intensity: f64) -> Self {
        Peak {
            fs,
            ss,
            panel,
            intensity,
            background: None,
            resolution: None,
        }
    }

    /// Local signal-to-noise estimate given a background level and sigma.
    /// Used by the revalidation pass shared across all peak-search methods.
    pub fn snr(&self, bg: f64, bg_sigma: f64) -> f64 {
        if bg_sigma <= 0.0 {
            return f64::INFINITY;
        }
        (self.intensity - bg) / bg_sigma
    }
}

/// Ordered list of peaks for one image, in detection order.
#[derive(Debug, Clone, Default)]
pub struct PeakList {
    pub peaks: Vec<Peak>,
}

impl PeakList {
    pub fn new() -> Self {
        PeakList { peaks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Remove the `k` weakest peaks by intensity (lowest first), used by the
    /// indexing driver's retry loop.
    pub fn remove_weakest(&mut self, k: usize) {
        if k == 0 || self.peaks.is_empty() {
            return;
        }
        self.peaks
            .sort_by(|a, b| a.intensity.partial_cmp(&b.intensity).unwrap());
        let remove = k.min(self.peaks.len());
        self.peaks.drain(0..remove);
    }
}

/// Miller indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hkl {
    pub h: i32,
    pub k: i32,
    pub l: i32,
}

impl Hkl {
    pub fn new(h: i32, k: i32, l: i32) -> Self {
        Hkl { h, k, l }
    }
}

impl fmt::Display for Hkl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.h, self.k, self.l)
    }
}

/// Integration diagnostic flags for a single reflection.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReflectionFlags {
    pub saturated: bool,
    pub not_integrable: bool,
}

/// A single predicted/measured reflection, owned by exactly one crystal.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub hkl: Hkl,
    pub fs: f64,
    pub ss: f64,
    pub panel: usize,
    pub excitation_error: f64,
    pub predicted_k: f64,
    pub lorentz: f64,
    pub partiality: f64,
    pub intensity: f64,
    pub esd: f64,
    pub redundancy: u32,
    pub symmetric_equivalent: Hkl,
    pub flags: ReflectionFlags,
}

impl Reflection {
    /// Whether this reflection's partiality lies in the valid [0,1] range.
    pub fn partiality_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.partiality)
    }
}

/// Reason a crystal (or candidate) was rejected, used as the "user flag".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    None,
    CellMismatch,
    PeakCheckFailed,
    RefinementDiverged,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::None => "none",
            RejectReason::CellMismatch => "cell-mismatch",
            RejectReason::PeakCheckFailed => "peak-check-failed",
            RejectReason::RefinementDiverged => "refinement-diverged",
        };
        write!(f, "{s}")
    }
}

/// A crystal found on an image: a cell, profile parameters and its own
/// reflection list.
#[derive(Debug, Clone)]
pub struct Crystal {
    pub cell: crate::cell::UnitCell,
    pub profile_radius: f64,
    pub mosaicity: f64,
    pub osf: f64,
    pub b_factor: f64,
    pub reflections: Vec<Reflection>,
    pub user_flag: RejectReason,
    pub indexed_by: String,
}

impl Crystal {
    pub fn new(cell: crate::cell::UnitCell, indexed_by: impl Into<String>) -> Self {
        Crystal {
            cell,
            profile_radius: 0.001e9, // m^-1, nominal default
            mosaicity: 0.0,
            osf: 1.0,
            b_factor: 0.0,
            reflections: Vec::new(),
            user_flag: RejectReason::None,
            indexed_by: indexed_by.into(),
        }
    }

    pub fn num_saturated(&self) -> usize {
        self.reflections.iter().filter(|r| r.flags.saturated).count()
    }
}

/// Per-worker, per-stage wall-clock timing totals. Diagnostic only; never
/// affects correctness.
#[derive(Debug, Clone, Default)]
pub struct TimingAccount {
    pub acquire_ns: u64,
    pub filter_ns: u64,
    pub peaksearch_ns: u64,
    pub indexing_ns: u64,
    pub refine_ns: u64,
    pub integration_ns: u64,
    pub stream_write_ns: u64,
}

impl TimingAccount {
    pub fn total_ns(&self) -> u64 {
        self.acquire_ns
            + self.filter_ns
            + self.peaksearch_ns
            + self.indexing_ns
            + self.refine_ns
            + self.integration_ns
            + self.stream_write_ns
    }
}

/// Metadata copy-fields carried through from the image source to the stream
/// header, e.g. photon energy, detector shift.
#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    pub photon_energy_ev: f64,
    pub copy_fields: Vec<(String, String)>,
}

/// One image's complete result, ready to be serialized by the stream writer.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub filename: String,
    pub event: Option<String>,
    pub serial: u64,
    pub wavelength: f64,
    pub metadata: ChunkMetadata,
    pub peaks: Option<PeakList>,
    pub crystals: Vec<Crystal>,
    pub num_saturated_peaks: usize,
    pub indexed_by: Option<String>,
}

impl Chunk {
    pub fn is_hit(&self) -> bool {
        !self.crystals.is_empty()
    }
}
