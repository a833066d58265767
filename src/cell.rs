//! Unit cell representation and the cell-matching logic used by the
//! indexing driver: axis permutation / integer-combination search against a
//! reference cell, and the error figure-of-merit used to break ties between
//! candidate solutions.

use crate::error::{ConfigError, EngineError};
use crate::geometry::Vec3;
use crate::types::{Centering, LatticeType};

const TWO_PI: f64 = std::f64::consts::PI * 2.0;

/// A unit cell, stored as three real-space basis vectors (metres) so that
/// axis permutations and integer combinations are plain vector arithmetic.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCell {
    pub a_vec: Vec3,
    pub b_vec: Vec3,
    pub c_vec: Vec3,
    pub lattice_type: LatticeType,
    pub centering: Centering,
}

impl UnitCell {
    #[allow(clippy::too_many_arguments)]
    pub fn from_parameters(
        a: f64,
        b: f64,
        c: f64,
        alpha: f64,
        beta: f64,
        gamma: f64,
        lattice_type: LatticeType,
        centering: Centering,
    ) -> Result<Self, EngineError> {
        if a <= 0.0 || b <= 0.0 || c <= 0.0 {
            return Err(EngineError::Configuration(ConfigError::CellParse(
                "lengths must be positive".to_string(),
            )));
        }
        for (name, ang) in [("alpha", alpha), ("beta", beta), ("gamma", gamma)] {
            if !(0.0..TWO_PI).contains(&ang) {
                return Err(EngineError::Configuration(ConfigError::CellParse(format!(
                    "angle {name} out of range (0, 2*pi)"
                ))));
            }
        }
        if alpha + beta + gamma >= TWO_PI || alpha + beta <= gamma || beta + gamma <= alpha || alpha + gamma <= beta
        {
            return Err(EngineError::Configuration(ConfigError::CellParse(
                "angles fail triangle inequality".to_string(),
            )));
        }

        // Standard crystallographic construction: a along x, b in the xy
        // plane, c completes a right-handed set.
        let a_vec = Vec3::new(a, 0.0, 0.0);
        let b_vec = Vec3::new(b * gamma.cos(), b * gamma.sin(), 0.0);
        let cx = c * beta.cos();
        let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
        let cz2 = c * c - cx * cx - cy * cy;
        if cz2 <= 0.0 {
            return Err(EngineError::Configuration(ConfigError::CellParse(
                "angles are not geometrically consistent".to_string(),
            )));
        }
        let c_vec = Vec3::new(cx, cy, cz2.sqrt());

        let cell = UnitCell { a_vec, b_vec, c_vec, lattice_type, centering };
        cell.validate()?;
        Ok(cell)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.is_right_handed() {
            return Err(EngineError::Configuration(ConfigError::CellParse(
                "cell is not right-handed".to_string(),
            )));
        }
        let (a, b, c, alpha, beta, gamma) = self.parameters();
        if a <= 0.0 || b <= 0.0 || c <= 0.0 {
            return Err(EngineError::Configuration(ConfigError::CellParse(
                "lengths must be positive".to_string(),
            )));
        }
        for ang in [alpha, beta, gamma] {
            if !(0.0..TWO_PI).contains(&ang) {
                return Err(EngineError::Configuration(ConfigError::CellParse(
                    "angle out of (0, 2*pi)".to_string(),
                )));
            }
        }
        self.centering_consistent()
    }

    fn centering_consistent(&self) -> Result<(), EngineError> {
        use Centering::*;
        use LatticeType::*;
        let ok = matches!(
            (self.lattice_type, self.centering),
            (Cubic, P) | (Cubic, I) | (Cubic, F)
                | (Hexagonal, P) | (Hexagonal, H) | (Rhombohedral, R)
                | (Tetragonal, P) | (Tetragonal, I)
                | (Orthorhombic, _)
                | (Monoclinic, P) | (Monoclinic, C) | (Monoclinic, A) | (Monoclinic, B) | (Monoclinic, I)
                | (Triclinic, P)
        );
        if ok {
            Ok(())
        } else {
            Err(EngineError::Configuration(ConfigError::CellParse(format!(
                "centering {} inconsistent with lattice type",
                self.centering
            ))))
        }
    }

    pub fn is_right_handed(&self) -> bool {
        self.a_vec.dot(&self.b_vec.cross(&self.c_vec)) > 0.0
    }

    /// Return (a, b, c, alpha, beta, gamma) with angles in radians.
    pub fn parameters(&self) -> (f64, f64, f64, f64, f64, f64) {
        let a = self.a_vec.norm();
        let b = self.b_vec.norm();
        let c = self.c_vec.norm();
        let alpha = (self.b_vec.dot(&self.c_vec) / (b * c)).clamp(-1.0, 1.0).acos();
        let beta = (self.a_vec.dot(&self.c_vec) / (a * c)).clamp(-1.0, 1.0).acos();
        let gamma = (self.a_vec.dot(&self.b_vec) / (a * b)).clamp(-1.0, 1.0).acos();
        (a, b, c, alpha, beta, gamma)
    }

    /// Volume of the unit cell, m^3.
    pub fn volume(&self) -> f64 {
        self.a_vec.dot(&self.b_vec.cross(&self.c_vec)).abs()
    }

    /// Reciprocal lattice vectors (2*pi convention) for prediction.
    pub fn reciprocal(&self) -> (Vec3, Vec3, Vec3) {
        let v = self.volume();
        let a_star = self.b_vec.cross(&self.c_vec).scale(1.0 / v);
        let b_star = self.c_vec.cross(&self.a_vec).scale(1.0 / v);
        let c_star = self.a_vec.cross(&self.b_vec).scale(1.0 / v);
        (a_star, b_star, c_star)
    }

    /// Apply the identity transform (used by the idempotence test).
    pub fn identity(&self) -> UnitCell {
        self.clone()
    }

    /// Apply a 3x3 integer-coefficient basis transform and its algebraic
    /// inverse back-to-back; used by round-trip tests.
    pub fn transform(&self, m: [[i32; 3]; 3]) -> UnitCell {
        let combine = |row: [i32; 3]| -> Vec3 {
            self.a_vec
                .scale(row[0] as f64)
                .add(&self.b_vec.scale(row[1] as f64))
                .add(&self.c_vec.scale(row[2] as f64))
        };
        UnitCell {
            a_vec: combine(m[0]),
            b_vec: combine(m[1]),
            c_vec: combine(m[2]),
            lattice_type: self.lattice_type,
            centering: self.centering,
        }
    }
}

/// Fractional length and absolute angle tolerances used for cell matching.
#[derive(Debug, Clone, Copy)]
pub struct CellTolerance {
    pub length_frac: f64,
    pub angle_rad: f64,
}

impl Default for CellTolerance {
    fn default() -> Self {
        CellTolerance { length_frac: 0.05, angle_rad: 1.5_f64.to_radians() }
    }
}

/// Relative error figure-of-merit between a candidate and a reference cell's
/// parameters: sum of fractional length errors plus normalized angle errors.
fn cell_error(candidate: &UnitCell, reference: &UnitCell) -> f64 {
    let (ca, cb, cc, calpha, cbeta, cgamma) = candidate.parameters();
    let (ra, rb, rc, ralpha, rbeta, rgamma) = reference.parameters();
    let len_err = ((ca - ra) / ra).abs() + ((cb - rb) / rb).abs() + ((cc - rc) / rc).abs();
    let ang_err = (calpha - ralpha).abs() + (cbeta - rbeta).abs() + (cgamma - rgamma).abs();
    len_err + ang_err
}

fn within_tolerance(candidate: &UnitCell, reference: &UnitCell, tol: &CellTolerance) -> bool {
    let (ca, cb, cc, calpha, cbeta, cgamma) = candidate.parameters();
    let (ra, rb, rc, ralpha, rbeta, rgamma) = reference.parameters();
    let len_ok = ((ca - ra) / ra).abs() <= tol.length_frac
        && ((cb - rb) / rb).abs() <= tol.length_frac
        && ((cc - rc) / rc).abs() <= tol.length_frac;
    let ang_ok = (calpha - ralpha).abs() <= tol.angle_rad
        && (cbeta - rbeta).abs() <= tol.angle_rad
        && (cgamma - rgamma).abs() <= tol.angle_rad;
    len_ok && ang_ok
}

/// The six axis permutations of a cell (relabeling a/b/c, preserving
/// handedness is not required here since each permutation is re-validated).
fn axis_permutations(cell: &UnitCell) -> Vec<UnitCell> {
    let (a, b, c) = (cell.a_vec, cell.b_vec, cell.c_vec);
    let perms: [[Vec3; 3]; 6] = [
        [a, b, c],
        [a, c, b],
        [b, a, c],
        [b, c, a],
        [c, a, b],
        [c, b, a],
    ];
    perms
        .into_iter()
        .map(|[a_vec, b_vec, c_vec]| UnitCell {
            a_vec,
            b_vec,
            c_vec,
            lattice_type: cell.lattice_type,
            centering: cell.centering,
        })
        .collect()
}

/// Integer linear combinations of the basis vectors with coefficients in
/// {-1,0,1,2}, restricted to combinations whose determinant is +-1 so the
/// resulting cell still describes the same lattice.
fn axis_combinations(cell: &UnitCell) -> Vec<UnitCell> {
    const COEFFS: [i32; 4] = [-1, 0, 1, 2];
    let mut out = Vec::new();
    for idx in 0..COEFFS.len().pow(9) {
        let mut rem = idx;
        let mut entries = [0i32; 9];
        for slot in entries.iter_mut() {
            *slot = COEFFS[rem % COEFFS.len()];
            rem /= COEFFS.len();
        }
        let m = [
            [entries[0], entries[1], entries[2]],
            [entries[3], entries[4], entries[5]],
            [entries[6], entries[7], entries[8]],
        ];
        if determinant(m).abs() != 1 {
            continue;
        }
        out.push(cell.transform(m));
    }
    out
}

fn determinant(m: [[i32; 3]; 3]) -> i32 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Search axis permutations (and, if `combinations` is set, integer
/// combinations) of `candidate` for the one that agrees with `reference`
/// within tolerance. Returns the best-agreeing cell and its error
/// figure-of-merit, or `None` if nothing qualifies.
pub fn match_against_reference(
    candidate: &UnitCell,
    reference: &UnitCell,
    tol: &CellTolerance,
    check_combinations: bool,
) -> Option<(UnitCell, f64)> {
    let mut trial_cells = axis_permutations(candidate);
    if check_combinations {
        trial_cells.extend(axis_combinations(candidate));
    }

    let mut best: Option<(UnitCell, f64)> = None;
    for trial in trial_cells {
        if !within_tolerance(&trial, reference, tol) {
            continue;
        }
        let err = cell_error(&trial, reference);
        match &best {
            Some((_, best_err)) if *best_err <= err => {}
            _ => best = Some((trial, err)),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(a: f64) -> UnitCell {
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

    #[test]
    fn identity_transform_preserves_cell() {
        let cell = cubic(50e-10);
        let id = cell.identity();
        assert_eq!(cell, id);
    }

    #[test]
    fn transform_then_inverse_round_trips() {
        let cell = cubic(50e-10);
        // Swap a<->b then swap back: both are valid unimodular transforms.
        let swap = [[0, 1, 0], [1, 0, 0], [0, 0, 1]];
        let transformed = cell.transform(swap);
        let restored = transformed.transform(swap);

        let scale = cell.a_vec.norm();
        for (v1, v2) in [
            (cell.a_vec, restored.a_vec),
            (cell.b_vec, restored.b_vec),
            (cell.c_vec, restored.c_vec),
        ] {
            assert!((v1.x - v2.x).abs() / scale < 1e-6);
            assert!((v1.y - v2.y).abs() / scale < 1e-6);
            assert!((v1.z - v2.z).abs() / scale < 1e-6);
        }
    }

    #[test]
    fn axis_swapped_cell_matches_reference() {
        let reference = cubic(50e-10);
        let (a, b, c) = (reference.a_vec, reference.b_vec, reference.c_vec);
        let swapped = UnitCell {
            a_vec: b,
            b_vec: c,
            c_vec: a,
            lattice_type: reference.lattice_type,
            centering: reference.centering,
        };
        let tol = CellTolerance::default();
        let result = match_against_reference(&swapped, &reference, &tol, false);
        assert!(result.is_some());
    }

    #[test]
    fn mismatched_cell_does_not_match() {
        let reference = cubic(50e-10);
        let other = cubic(80e-10);
        let tol = CellTolerance::default();
        let result = match_against_reference(&other, &reference, &tol, false);
        assert!(result.is_none());
    }

    #[test]
    fn right_handed_check() {
        let cell = cubic(50e-10);
        assert!(cell.is_right_handed());
    }
}
