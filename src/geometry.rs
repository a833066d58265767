//! Detector geometry: an ordered sequence of rigid panels, and the images
//! that are read against a geometry.
//!
//! A real crate would delegate parsing of `.geom` files to an external
//! library; that parser is out of scope here. What's implemented
//! is the in-memory representation and the handful of operations the rest
//! of the engine needs: pixel-to-lab-frame projection, bad-pixel/saturation
//! lookups, and a minimal line-oriented loader good enough to build a real
//! `Geometry` for tests without vendoring a full grammar.

use crate::error::{ConfigError, EngineError};
use std::collections::HashMap;

/// A 3-D vector in the lab frame, expressed in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vec3 { x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_nonzero(&self) -> bool {
        self.norm() > 0.0
    }

    pub fn dot(&self, other: &Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Vec3) -> Vec3 {
        Vec3::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn scale(&self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn add(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }

    pub fn sub(&self, other: &Vec3) -> Vec3 {
        Vec3::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

/// Source of a per-image variable (camera length, photon energy): either a
/// fixed value baked into the geometry, or a name resolved against the
/// image's metadata copy-fields at load time.
#[derive(Debug, Clone)]
pub enum VariableSource {
    Fixed(f64),
    FromMetadata(String),
}

/// A single rigid detector panel.
#[derive(Debug, Clone)]
pub struct Panel {
    pub name: String,
    pub w: usize,
    pub h: usize,
    /// Lab-frame displacement per unit fs.
    pub fs_vec: Vec3,
    /// Lab-frame displacement per unit ss.
    pub ss_vec: Vec3,
    /// Lab-frame origin of pixel (0,0).
    pub origin: Vec3,
    /// Signed distance along the beam (z), metres.
    pub clen: VariableSource,
    pub photon_energy: VariableSource,
    pub adu_per_photon: f64,
    pub max_adu: f64,
    pub bad: Vec<bool>,
    pub saturation_map: Vec<bool>,
}

impl Panel {
    /// True if (fs, ss) lies inside this panel's pixel rectangle.
    pub fn in_bounds(&self, fs: f64, ss: f64) -> bool {
        fs >= 0.0 && ss >= 0.0 && fs <= (self.w as f64 - 1.0) && ss <= (self.h as f64 - 1.0)
    }

    fn index(&self, fs: usize, ss: usize) -> Option<usize> {
        if fs >= self.w || ss >= self.h {
            return None;
        }
        Some(ss * self.w + fs)
    }

    pub fn is_bad(&self, fs: usize, ss: usize) -> Result<bool, EngineError> {
        let idx = self
            .index(fs, ss)
            .ok_or_else(|| EngineError::PanelOutOfBounds { panel: self.name.clone(), fs, ss })?;
        Ok(self.bad[idx])
    }

    pub fn mark_bad(&mut self, fs: usize, ss: usize) {
        if let Some(idx) = self.index(fs, ss) {
            self.bad[idx] = true;
        }
    }

    pub fn is_saturated(&self, fs: usize, ss: usize, value: f64) -> bool {
        if value >= self.max_adu {
            return true;
        }
        self.index(fs, ss)
            .map(|idx| self.saturation_map[idx])
            .unwrap_or(false)
    }

    /// Project a pixel (fs, ss) to its lab-frame 3-D position.
    pub fn project(&self, fs: f64, ss: f64) -> Vec3 {
        self.origin
            .add(&self.fs_vec.scale(fs))
            .add(&self.ss_vec.scale(ss))
    }

    pub fn resolve_clen(&self, metadata: &HashMap<String, f64>) -> Result<f64, EngineError> {
        resolve_variable(&self.clen, metadata, "clen")
    }

    pub fn resolve_photon_energy(&self, metadata: &HashMap<String, f64>) -> Result<f64, EngineError> {
        resolve_variable(&self.photon_energy, metadata, "photon_energy")
    }
}

fn resolve_variable(
    source: &VariableSource,
    metadata: &HashMap<String, f64>,
    what: &str,
) -> Result<f64, EngineError> {
    match source {
        VariableSource::Fixed(v) => Ok(*v),
        VariableSource::FromMetadata(name) => metadata.get(name).copied().ok_or_else(|| {
            EngineError::Configuration(ConfigError::MissingMetadataKey {
                what: what.to_string(),
                key: name.clone(),
            })
        }),
    }
}

/// An ordered sequence of panels making up a detector geometry.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub panels: Vec<Panel>,
}

impl Geometry {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.panels.is_empty() {
            return Err(EngineError::Configuration(ConfigError::EmptyGeometry));
        }
        for p in &self.panels {
            if !p.fs_vec.is_nonzero() || !p.ss_vec.is_nonzero() {
                return Err(EngineError::Configuration(ConfigError::DegenerateBasis {
                    panel: p.name.clone(),
                }));
            }
        }
        Ok(())
    }

    pub fn panel(&self, idx: usize) -> Option<&Panel> {
        self.panels.get(idx)
    }

    /// Build a minimal single-panel geometry, useful for tests and as the
    /// default when no `.geom` file is supplied.
    pub fn single_panel(w: usize, h: usize, pixel_size_m: f64, clen_m: f64, adu_per_photon: f64) -> Self {
        let panel = Panel {
            name: "p0".to_string(),
            w,
            h,
            fs_vec: Vec3::new(pixel_size_m, 0.0, 0.0),
            ss_vec: Vec3::new(0.0, pixel_size_m, 0.0),
            origin: Vec3::new(
                -(w as f64) * pixel_size_m / 2.0,
                -(h as f64) * pixel_size_m / 2.0,
                clen_m,
            ),
            clen: VariableSource::Fixed(clen_m),
            photon_energy: VariableSource::Fixed(9000.0),
            adu_per_photon,
            max_adu: 1.0e6,
            bad: vec![false; w * h],
            saturation_map: vec![false; w * h],
        };
        Geometry { panels: vec![panel] }
    }

    /// Parse a minimal line-oriented geometry description of the form
    /// `panel/key = value`, enough to exercise the loader without a full
    /// `.geom` grammar.
    pub fn parse_minimal(text: &str) -> Result<Self, EngineError> {
        let mut panels: HashMap<String, PanelBuilder> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((lhs, rhs)) = line.split_once('=') else {
                continue;
            };
            let lhs = lhs.trim();
            let rhs = rhs.trim();
            let Some((panel_name, key)) = lhs.split_once('/') else {
                continue;
            };
            if !panels.contains_key(panel_name) {
                panels.insert(panel_name.to_string(), PanelBuilder::default());
                order.push(panel_name.to_string());
            }
            let builder = panels.get_mut(panel_name).unwrap();
            builder.set(key, rhs).map_err(|e| {
                EngineError::Configuration(ConfigError::GeometryParse(format!(
                    "panel {panel_name}: {e}"
                )))
            })?;
        }

        let mut out = Vec::with_capacity(order.len());
        for name in order {
            let builder = panels.remove(&name).unwrap();
            out.push(builder.build(name)?);
        }
        let geom = Geometry { panels: out };
        geom.validate()?;
        Ok(geom)
    }
}

#[derive(Default)]
struct PanelBuilder {
    w: Option<usize>,
    h: Option<usize>,
    fs: Option<Vec3>,
    ss: Option<Vec3>,
    corner_x: Option<f64>,
    corner_y: Option<f64>,
    clen: Option<f64>,
    adu_per_photon: Option<f64>,
    max_adu: Option<f64>,
}

fn parse_dir(s: &str) -> Result<Vec3, String> {
    // Accepts the `.geom`-style "1.0x +0.5y" direction shorthand, reduced to
    // the two in-plane components we need (z left at 0).
    let mut x = 0.0;
    let mut y = 0.0;
    for term in s.split_whitespace() {
        let term = term.replace('+', "");
        if let Some(stripped) = term.strip_suffix('x') {
            x = stripped.parse::<f64>().map_err(|_| format!("bad x term '{term}'"))?;
        } else if let Some(stripped) = term.strip_suffix('y') {
            y = stripped.parse::<f64>().map_err(|_| format!("bad y term '{term}'"))?;
        } else {
            return Err(format!("unrecognized direction term '{term}'"));
        }
    }
    Ok(Vec3::new(x, y, 0.0))
}

impl PanelBuilder {
    fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "max_fs" => self.w = Some(value.parse::<usize>().map_err(|_| "bad max_fs")? + 1),
            "max_ss" => self.h = Some(value.parse::<usize>().map_err(|_| "bad max_ss")? + 1),
            "fs" => self.fs = Some(parse_dir(value)?),
            "ss" => self.ss = Some(parse_dir(value)?),
            "corner_x" => self.corner_x = Some(value.parse().map_err(|_| "bad corner_x")?),
            "corner_y" => self.corner_y = Some(value.parse().map_err(|_| "bad corner_y")?),
            "clen" => self.clen = Some(value.parse().map_err(|_| "bad clen")?),
            "adu_per_photon" => {
                self.adu_per_photon = Some(value.parse().map_err(|_| "bad adu_per_photon")?)
            }
            "max_adu" => self.max_adu = Some(value.parse().map_err(|_| "bad max_adu")?),
            _ => {}
        }
        Ok(())
    }

    fn build(self, name: String) -> Result<Panel, EngineError> {
        let w = self.w.ok_or_else(|| missing(&name, "max_fs"))?;
        let h = self.h.ok_or_else(|| missing(&name, "max_ss"))?;
        let fs_vec = self.fs.unwrap_or(Vec3::new(1.0e-4, 0.0, 0.0));
        let ss_vec = self.ss.unwrap_or(Vec3::new(0.0, 1.0e-4, 0.0));
        let clen = self.clen.unwrap_or(0.1);
        let origin = Vec3::new(
            self.corner_x.unwrap_or(0.0) * 1.0e-4,
            self.corner_y.unwrap_or(0.0) * 1.0e-4,
            clen,
        );
        Ok(Panel {
            name,
            w,
            h,
            fs_vec,
            ss_vec,
            origin,
            clen: VariableSource::Fixed(clen),
            photon_energy: VariableSource::Fixed(9000.0),
            adu_per_photon: self.adu_per_photon.unwrap_or(1.0),
            max_adu: self.max_adu.unwrap_or(1.0e6),
            bad: vec![false; w * h],
            saturation_map: vec![false; w * h],
        })
    }
}

fn missing(panel: &str, key: &str) -> EngineError {
    EngineError::Configuration(ConfigError::GeometryParse(format!(
        "panel {panel} missing required key '{key}'"
    )))
}

/// A spectrum as a weighted sum of Gaussians in k = 1/lambda.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub components: Vec<SpectrumComponent>,
}

#[derive(Debug, Clone, Copy)]
pub struct SpectrumComponent {
    pub k_center: f64,
    pub k_width: f64,
    pub weight: f64,
}

impl Spectrum {
    pub fn monochromatic(wavelength_m: f64) -> Self {
        Spectrum {
            components: vec![SpectrumComponent {
                k_center: 1.0 / wavelength_m,
                k_width: 0.0,
                weight: 1.0,
            }],
        }
    }
}

/// A per-panel floating-point pixel array with matching bad-pixel state,
/// plus the metadata needed to resolve per-image variables.
#[derive(Debug, Clone)]
pub struct Image {
    pub serial: u64,
    pub filename: String,
    pub event: Option<String>,
    pub wavelength: f64,
    pub spectrum: Option<Spectrum>,
    pub panel_data: Vec<Vec<f64>>,
    pub metadata: HashMap<String, f64>,
    /// Precomputed peak table, present when the container ships one (HDF5
    /// dataset, CXI per-event table, or an in-memory payload).
    pub prepared_peaks: Option<crate::types::PeakList>,
}

impl Image {
    pub fn pixel(&self, panel: usize, fs: usize, ss: usize, geom: &Geometry) -> Option<f64> {
        let p = geom.panel(panel)?;
        if fs >= p.w || ss >= p.h {
            return None;
        }
        self.panel_data.get(panel)?.get(ss * p.w + fs).copied()
    }
}
