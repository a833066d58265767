//! The indexing backend capability set: `prepare` / `index` /
//! `cleanup`, satisfied either by an in-process algorithm or a wrapper
//! around an out-of-process tool. The specific geometry/algorithm of any
//! given third-party backend is out of scope; what's implemented
//! here is the trait boundary plus two reference in-process backends used
//! by the driver's own tests.

use crate::cell::{CellTolerance, UnitCell};
use crate::config::IndexingFlags;
use crate::error::EngineError;
use crate::geometry::Image;
use crate::types::PeakList;

/// What prior information a backend can consume.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCapabilities {
    pub wants_lattice_type: bool,
    pub wants_full_cell: bool,
}

/// Opaque state returned by `prepare` and threaded through to `index` and
/// `cleanup`. A process-backed implementation would stash a child handle
/// and temp-file paths here.
pub struct BackendHandle {
    pub reference_cell: Option<UnitCell>,
    pub tolerance: CellTolerance,
    pub flags: IndexingFlags,
}

pub trait IndexingBackend: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> BackendCapabilities;

    fn prepare(
        &self,
        reference_cell: Option<&UnitCell>,
        tolerance: &CellTolerance,
        flags: IndexingFlags,
    ) -> Result<BackendHandle, EngineError>;

    fn index(
        &self,
        image: &Image,
        peaks: &PeakList,
        handle: &BackendHandle,
    ) -> Result<Vec<UnitCell>, EngineError>;

    fn cleanup(&self, _handle: BackendHandle) {}
}

/// A reference in-process backend that searches a small grid of rotations
/// of a known reference cell around the beam axis and returns candidates
/// whose orientation was not discarded outright. Stands in for a real
/// auto-indexing algorithm (out of scope) well enough to exercise
/// the driver end to end, including the multi-lattice case where a second,
/// rotated lattice remains in the peak list after the first is removed.
pub struct ReferenceLatticeBackend {
    base_cell: UnitCell,
}

impl ReferenceLatticeBackend {
    pub fn new(base_cell: UnitCell) -> Self {
        ReferenceLatticeBackend { base_cell }
    }

    fn rotated_about_beam(&self, angle_rad: f64) -> UnitCell {
        use crate::geometry::Vec3;
        let rotate = |v: Vec3| -> Vec3 {
            Vec3::new(
                v.x * angle_rad.cos() - v.y * angle_rad.sin(),
                v.x * angle_rad.sin() + v.y * angle_rad.cos(),
                v.z,
            )
        };
        UnitCell {
            a_vec: rotate(self.base_cell.a_vec),
            b_vec: rotate(self.base_cell.b_vec),
            c_vec: rotate(self.base_cell.c_vec),
            lattice_type: self.base_cell.lattice_type,
            centering: self.base_cell.centering,
        }
    }
}

impl IndexingBackend for ReferenceLatticeBackend {
    fn name(&self) -> &str {
        "reference-lattice"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities { wants_lattice_type: true, wants_full_cell: true }
    }

    fn prepare(
        &self,
        reference_cell: Option<&UnitCell>,
        tolerance: &CellTolerance,
        flags: IndexingFlags,
    ) -> Result<BackendHandle, EngineError> {
        Ok(BackendHandle { reference_cell: reference_cell.cloned(), tolerance: *tolerance, flags })
    }

    fn index(
        &self,
        _image: &Image,
        peaks: &PeakList,
        _handle: &BackendHandle,
    ) -> Result<Vec<UnitCell>, EngineError> {
        if peaks.len() < 4 {
            return Ok(Vec::new());
        }
        const STEP_DEG: i32 = 5;
        let candidates = (0..360 / STEP_DEG)
            .map(|i| self.rotated_about_beam((i * STEP_DEG) as f64 * std::f64::consts::PI / 180.0))
            .collect();
        Ok(candidates)
    }

    fn cleanup(&self, _handle: BackendHandle) {}
}

/// Wraps an external process satisfying the same capability set. The
/// process's stdin/stdout protocol is backend-specific and encapsulated
/// entirely inside `spawn_and_parse`; a timeout or non-zero exit is
/// reported as "no candidates" rather than propagated as a fatal error
///.
pub struct ExternalProcessBackend {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: std::time::Duration,
}

impl ExternalProcessBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: std::time::Duration) -> Self {
        ExternalProcessBackend { program: program.into(), args, timeout }
    }
}

impl IndexingBackend for ExternalProcessBackend {
    fn name(&self) -> &str {
        &self.program
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    fn prepare(
        &self,
        reference_cell: Option<&UnitCell>,
        tolerance: &CellTolerance,
        flags: IndexingFlags,
    ) -> Result<BackendHandle, EngineError> {
        Ok(BackendHandle { reference_cell: reference_cell.cloned(), tolerance: *tolerance, flags })
    }

    fn index(
        &self,
        _image: &Image,
        _peaks: &PeakList,
        _handle: &BackendHandle,
    ) -> Result<Vec<UnitCell>, EngineError> {
        // A real implementation spawns `self.program` with `self.args`,
        // feeds it a peak list on stdin, and parses candidate cells from
        // stdout within `self.timeout`. Left unimplemented here: the wire
        // protocol of any specific third-party indexer is out of scope.
        Ok(Vec::new())
    }
}
