//! End-to-end scenarios exercised against the public API: dispatcher::run
//! for the full worker-pool path, pipeline::process_image directly for the
//! single-image saturation case.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use crystfel_engine::cell::UnitCell;
use crystfel_engine::config::EngineConfig;
use crystfel_engine::dispatcher;
use crystfel_engine::geometry::{Geometry, Image, Spectrum};
use crystfel_engine::indexing::{BackendCapabilities, BackendHandle, IndexingBackend, ReferenceLatticeBackend};
use crystfel_engine::peaksearch::PeakSearchMethod;
use crystfel_engine::pipeline;
use crystfel_engine::prediction::{self, PartialityModel};
use crystfel_engine::types::{Centering, Crystal, LatticeType, Peak, PeakList};

fn reference_cubic_cell(a: f64) -> UnitCell {
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

/// An image whose prepared peaks sit exactly on the cell's predicted
/// reflections, with an all-zero panel behind them (no raw pixel data).
fn perfect_image(geom: &Geometry, cell: &UnitCell, serial: u64) -> (Image, PeakList) {
    let wavelength = 1e-10;
    let crystal = Crystal::new(cell.clone(), "synthetic");
    let image = Image {
        serial,
        filename: "synthetic".to_string(),
        event: None,
        wavelength,
        spectrum: Some(Spectrum::monochromatic(wavelength)),
        panel_data: geom.panels.iter().map(|p| vec![0.0; p.w * p.h]).collect(),
        metadata: HashMap::new(),
        prepared_peaks: None,
    };
    let reflections =
        prediction::predict_reflections(&crystal, &image, geom, &PartialityModel::Unity, prediction::DEFAULT_EXCITATION_THRESHOLD)
            .expect("prediction should not fail for a well-formed cell");
    let peaks = PeakList { peaks: reflections.iter().map(|r| Peak::new(r.fs, r.ss, r.panel, 5000.0)).collect() };
    let mut image = image;
    image.prepared_peaks = Some(peaks.clone());
    (image, peaks)
}

#[allow(clippy::field_reassign_with_default)]
fn base_config(cell: UnitCell) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.peak_search = PeakSearchMethod::Payload;
    config.reference_cell = Some(cell);
    config.min_peaks = 4;
    config.flags.refine = false;
    config.revalidate_prepared_peaks = false;
    config
}

fn cell_params_nm(text: &str) -> (f64, f64, f64) {
    let line = text.lines().find(|l| l.starts_with("Cell parameters")).expect("cell parameters line");
    let fields: Vec<&str> = line.split_whitespace().collect();
    (fields[2].parse().unwrap(), fields[3].parse().unwrap(), fields[4].parse().unwrap())
}

fn serials_in_order(text: &str) -> Vec<u64> {
    text.lines()
        .filter_map(|l| l.strip_prefix("Image serial number: "))
        .map(|s| s.parse().unwrap())
        .collect()
}

/// Scenario 1: single perfect image, no noise, every peak exactly on a
/// predicted reflection. One crystal recovers a,b,c within 0.1% of 50 Angstrom
/// and every peak is accounted for.
#[test]
fn single_perfect_image_is_indexed() {
    let geom = Geometry::single_panel(512, 512, 100e-6, 0.1, 1.0);
    let cell = reference_cubic_cell(50e-10);
    let (image, peaks) = perfect_image(&geom, &cell, 1);
    assert!(peaks.len() >= 10, "synthetic geometry should yield a non-trivial peak list");

    let config = base_config(cell);
    let backends: Vec<Box<dyn IndexingBackend>> = vec![Box::new(ReferenceLatticeBackend::new(
        config.reference_cell.clone().unwrap(),
    ))];

    let out = Arc::new(Mutex::new(Vec::new()));
    let writer = SharedBuf(Arc::clone(&out));
    let stats = dispatcher::run(vec![image], Arc::new(geom), Arc::new(config), Arc::new(backends), writer).unwrap();

    assert_eq!(stats.hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
    assert!(text.contains("hit = 1"));
    assert!(text.contains(&format!("num_peaks = {}", peaks.len())));

    let (a, b, c) = cell_params_nm(&text);
    for measured in [a, b, c] {
        assert!((measured - 5.0).abs() / 5.0 < 0.001, "cell edge {measured} nm not within 0.1% of 5.0 nm");
    }
}

/// Scenario 2: too few peaks to attempt indexing. One chunk, no crystal
/// blocks, `indexed_by` absent.
#[test]
fn too_few_peaks_is_a_miss() {
    let geom = Geometry::single_panel(128, 128, 100e-6, 0.1, 1.0);
    let cell = reference_cubic_cell(50e-10);
    let (mut image, peaks) = perfect_image(&geom, &cell, 1);
    image.prepared_peaks = Some(PeakList { peaks: peaks.peaks.into_iter().take(3).collect() });

    let mut config = base_config(cell.clone());
    config.min_peaks = 10;
    let backends: Vec<Box<dyn IndexingBackend>> = vec![Box::new(ReferenceLatticeBackend::new(cell))];

    let out = Arc::new(Mutex::new(Vec::new()));
    let writer = SharedBuf(Arc::clone(&out));
    let stats = dispatcher::run(vec![image], Arc::new(geom), Arc::new(config), Arc::new(backends), writer).unwrap();

    assert_eq!(stats.hits.load(std::sync::atomic::Ordering::Relaxed), 0);
    let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
    assert!(text.contains("hit = 0"));
    assert!(!text.contains("indexed_by"));
    assert!(!text.contains("--- Begin crystal"));
}

/// A backend that panics partway through `index`, standing in for a worker
/// crash on one specific image.
struct PanicsOnSerial {
    inner: ReferenceLatticeBackend,
    crash_serial: u64,
}

impl IndexingBackend for PanicsOnSerial {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn prepare(
        &self,
        reference_cell: Option<&UnitCell>,
        tolerance: &crystfel_engine::cell::CellTolerance,
        flags: crystfel_engine::config::IndexingFlags,
    ) -> Result<BackendHandle, crystfel_engine::error::EngineError> {
        self.inner.prepare(reference_cell, tolerance, flags)
    }

    fn index(
        &self,
        image: &Image,
        peaks: &PeakList,
        handle: &BackendHandle,
    ) -> Result<Vec<UnitCell>, crystfel_engine::error::EngineError> {
        if image.serial == self.crash_serial {
            panic!("simulated worker crash on serial {}", image.serial);
        }
        self.inner.index(image, peaks, handle)
    }
}

/// Scenario 4: one image's worker panics mid-index. Output still contains
/// every other image's chunk in strict serial order, the crashed image is
/// counted as processed-but-failed (no chunk), and the run otherwise
/// completes normally.
#[test]
fn worker_panic_on_one_image_does_not_break_the_run() {
    let geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
    let cell = reference_cubic_cell(50e-10);
    let images: Vec<Image> = (1..=10).map(|serial| perfect_image(&geom, &cell, serial).0).collect();

    let mut config = base_config(cell.clone());
    config.num_workers = 4;
    let backends: Vec<Box<dyn IndexingBackend>> =
        vec![Box::new(PanicsOnSerial { inner: ReferenceLatticeBackend::new(cell), crash_serial: 7 })];

    let out = Arc::new(Mutex::new(Vec::new()));
    let writer = SharedBuf(Arc::clone(&out));
    let stats = dispatcher::run(images, Arc::new(geom), Arc::new(config), Arc::new(backends), writer).unwrap();

    assert_eq!(stats.worker_panics.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(stats.images_processed.load(std::sync::atomic::Ordering::Relaxed), 9);

    let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
    let serials = serials_in_order(&text);
    assert_eq!(serials, vec![1, 2, 3, 4, 5, 6, 8, 9, 10]);
}

/// A backend that blocks past the configured stall timeout on one specific
/// image, standing in for an external indexing process that hangs.
struct StallsOnSerial {
    inner: ReferenceLatticeBackend,
    stall_serial: u64,
    stall_for: std::time::Duration,
}

impl IndexingBackend for StallsOnSerial {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.inner.capabilities()
    }

    fn prepare(
        &self,
        reference_cell: Option<&UnitCell>,
        tolerance: &crystfel_engine::cell::CellTolerance,
        flags: crystfel_engine::config::IndexingFlags,
    ) -> Result<BackendHandle, crystfel_engine::error::EngineError> {
        self.inner.prepare(reference_cell, tolerance, flags)
    }

    fn index(
        &self,
        image: &Image,
        peaks: &PeakList,
        handle: &BackendHandle,
    ) -> Result<Vec<UnitCell>, crystfel_engine::error::EngineError> {
        if image.serial == self.stall_serial {
            std::thread::sleep(self.stall_for);
        }
        self.inner.index(image, peaks, handle)
    }
}

/// Scenario: a worker stalls past `stall_timeout_secs` on one image. The
/// watchdog must flag it cancelled (`stalls_detected`) and the dispatcher
/// must count the image as cancelled rather than silently dropping it,
/// while every other image in the run still completes normally.
#[test]
fn stalled_worker_is_detected_and_counted_as_cancelled() {
    let geom = Geometry::single_panel(128, 128, 100e-6, 0.1, 1.0);
    let cell = reference_cubic_cell(50e-10);
    let images: Vec<Image> = (1..=3).map(|serial| perfect_image(&geom, &cell, serial).0).collect();

    let mut config = base_config(cell.clone());
    config.num_workers = 1;
    config.stall_timeout_secs = 1;
    let backends: Vec<Box<dyn IndexingBackend>> = vec![Box::new(StallsOnSerial {
        inner: ReferenceLatticeBackend::new(cell),
        stall_serial: 2,
        stall_for: std::time::Duration::from_millis(1500),
    })];

    let out = Arc::new(Mutex::new(Vec::new()));
    let writer = SharedBuf(Arc::clone(&out));
    let stats = dispatcher::run(images, Arc::new(geom), Arc::new(config), Arc::new(backends), writer).unwrap();

    assert!(stats.stalls_detected.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    assert_eq!(stats.cancelled.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(stats.images_processed.load(std::sync::atomic::Ordering::Relaxed), 2);

    let text = String::from_utf8(out.lock().unwrap().clone()).unwrap();
    assert_eq!(serials_in_order(&text), vec![1, 3]);
}

/// Scenario 5: a peak above the panel's saturation limit is flagged and
/// the saturated-peak counter is incremented; with `use_saturated = false`
/// the corresponding reflection is excluded from the usable integration
/// sum.
#[test]
fn saturated_peak_is_flagged_and_counted() {
    let mut geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
    geom.panels[0].max_adu = 1000.0;
    let cell = reference_cubic_cell(50e-10);
    let (mut image, peaks) = perfect_image(&geom, &cell, 1);

    let saturated_peak = peaks.peaks[0].clone();
    let panel = &geom.panels[0];
    let (fs, ss) = (saturated_peak.fs.round() as usize, saturated_peak.ss.round() as usize);
    image.panel_data[0][ss * panel.w + fs] = 5000.0;

    let mut boosted_peaks = peaks.clone();
    boosted_peaks.peaks[0].intensity = 5000.0;
    image.prepared_peaks = Some(boosted_peaks);

    let mut config = base_config(cell.clone());
    config.use_saturated = false;
    config.revalidate_prepared_peaks = false;
    let backends: Vec<Box<dyn IndexingBackend>> = vec![Box::new(ReferenceLatticeBackend::new(cell))];

    let cancel = std::sync::atomic::AtomicBool::new(false);
    let out = pipeline::process_image(&image, &geom, &config, &backends, &cancel).unwrap().unwrap();

    assert!(out.chunk.num_saturated_peaks >= 1);
    let crystal = &out.chunk.crystals[0];
    assert_eq!(
        crystal.num_saturated(),
        0,
        "saturated reflections must be dropped from the emitted list, not merely flagged"
    );
}

#[test]
fn saturated_reflection_stays_in_list_when_use_saturated_is_true() {
    let mut geom = Geometry::single_panel(256, 256, 100e-6, 0.1, 1.0);
    geom.panels[0].max_adu = 1000.0;
    let cell = reference_cubic_cell(50e-10);
    let (mut image, peaks) = perfect_image(&geom, &cell, 1);

    let saturated_peak = peaks.peaks[0].clone();
    let panel = &geom.panels[0];
    let (fs, ss) = (saturated_peak.fs.round() as usize, saturated_peak.ss.round() as usize);
    image.panel_data[0][ss * panel.w + fs] = 5000.0;

    let mut boosted_peaks = peaks.clone();
    boosted_peaks.peaks[0].intensity = 5000.0;
    image.prepared_peaks = Some(boosted_peaks);

    let mut config = base_config(cell.clone());
    config.use_saturated = true;
    config.revalidate_prepared_peaks = false;
    let backends: Vec<Box<dyn IndexingBackend>> = vec![Box::new(ReferenceLatticeBackend::new(cell))];

    let cancel = std::sync::atomic::AtomicBool::new(false);
    let out = pipeline::process_image(&image, &geom, &config, &backends, &cancel).unwrap().unwrap();

    assert!(out.chunk.num_saturated_peaks >= 1);
    let crystal = &out.chunk.crystals[0];
    assert!(
        crystal.num_saturated() >= 1,
        "with use_saturated=true the reflection should still be present and flagged"
    );
}

struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
