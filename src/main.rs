//! CLI entry point for crystfel-engine.
//!
//! Drives the dispatcher over a list of synthetic/line-format diffraction
//! images, writing a stream of indexed, integrated chunks.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use crystfel_engine::cell::{CellTolerance, UnitCell};
use crystfel_engine::config::{EngineConfig, FilterConfig, IndexingFlags, IntegrationMethod, Radii};
use crystfel_engine::dispatcher;
use crystfel_engine::geometry::Geometry;
use crystfel_engine::image_source::{self, LineFormatSource};
use crystfel_engine::indexing::{ExternalProcessBackend, IndexingBackend, ReferenceLatticeBackend};
use crystfel_engine::peaksearch::PeakSearchMethod;
use crystfel_engine::types::{Centering, LatticeType};

/// Serial femtosecond crystallography processing engine.
///
/// Turns a stream of diffraction images into a stream of indexed,
/// integrated chunks.
#[derive(Parser, Debug)]
#[command(name = "crystfel-engine")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Line-format image list (see `image_source::LineFormatSource`)
    #[arg(long = "input")]
    input: PathBuf,

    /// Output stream file
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Minimal line-oriented geometry description
    #[arg(long = "geometry")]
    geometry: Option<PathBuf>,

    /// Reference unit cell: a,b,c (Angstrom),alpha,beta,gamma (deg),lattice,centering
    #[arg(long = "cell")]
    cell: Option<String>,

    /// Minimum peaks required before indexing is attempted
    #[arg(long = "min-peaks", default_value = "10")]
    min_peaks: usize,

    /// Peak-search method: zaefferer, peakfinder8, peakfinder9, hdf5, cxi, payload
    #[arg(long = "peaks", default_value = "zaefferer")]
    peaks: String,

    /// Comma-separated indexing backend names
    #[arg(long = "indexing", default_value = "reference-lattice")]
    indexing: String,

    /// length_frac,angle_deg cell-matching tolerance
    #[arg(long = "tolerance", default_value = "0.05,1.5")]
    tolerance: String,

    /// inner,middle,outer peak-search validation radii (px)
    #[arg(long = "peak-radius", default_value = "3.0,4.0,5.0")]
    peak_radius: String,

    /// inner,middle,outer integration radii (px)
    #[arg(long = "int-radius", default_value = "3.0,4.0,5.0")]
    int_radius: String,

    /// Integration method: rings, profile-fit
    #[arg(long = "integration", default_value = "rings")]
    integration: String,

    /// Resolution push, m^-1
    #[arg(long = "push-res", default_value = "0.0")]
    push_res: f64,

    /// High-resolution cutoff, Angstrom
    #[arg(long = "highres")]
    highres: Option<f64>,

    /// Disable prediction refinement
    #[arg(long = "no-refine")]
    no_refine: bool,

    /// Disable the weakest-peaks-removed retry loop
    #[arg(long = "no-retry")]
    no_retry: bool,

    /// Keep indexing after the first lattice, looking for more
    #[arg(long = "multi")]
    multi: bool,

    /// Skip cell-axis/combination validation against the reference cell
    #[arg(long = "no-check-cell")]
    no_check_cell: bool,

    /// Skip the predicted-vs-observed peak fraction check
    #[arg(long = "no-check-peaks")]
    no_check_peaks: bool,

    /// How many times to retry opening a missing image file before giving up
    #[arg(long = "wait-for-file", default_value = "0")]
    wait_for_file: i32,

    /// Number of worker threads (0 = auto-detect)
    #[arg(short = 'j', long = "threads", default_value = "0")]
    threads: usize,

    /// Scratch directory for backends that shell out to external tools
    #[arg(long = "temp-dir")]
    temp_dir: Option<String>,

    /// Odd box side for a median-background filter applied before peak
    /// search only (omit to disable)
    #[arg(long = "median-filter")]
    median_filter: Option<usize>,

    /// Zero every 3x3 block containing a negative pixel before peak search
    #[arg(long = "noise-filter")]
    noise_filter: bool,

    /// Minimum SNR required for a peak to survive revalidation
    #[arg(long = "revalidate-min-snr", default_value = "5.0")]
    revalidate_min_snr: f64,

    /// Recentre each reflection's integration box onto its signal centroid
    /// (by up to one pixel) before gathering
    #[arg(long = "recenter-on-centroid")]
    recenter_on_centroid: bool,
}

fn parse_pair(s: &str, flag: &str) -> Result<(f64, f64)> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        bail!("{flag} expects 2 comma-separated values, got '{s}'");
    }
    let a: f64 = parts[0].trim().parse().with_context(|| format!("bad first value in {flag}"))?;
    let b: f64 = parts[1].trim().parse().with_context(|| format!("bad second value in {flag}"))?;
    Ok((a, b))
}

fn parse_triplet(s: &str, flag: &str) -> Result<(f64, f64, f64)> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        bail!("{flag} expects 3 comma-separated values, got '{s}'");
    }
    let a: f64 = parts[0].trim().parse().with_context(|| format!("bad first value in {flag}"))?;
    let b: f64 = parts[1].trim().parse().with_context(|| format!("bad second value in {flag}"))?;
    let c: f64 = parts[2].trim().parse().with_context(|| format!("bad third value in {flag}"))?;
    Ok((a, b, c))
}

fn parse_peaks(s: &str) -> Result<PeakSearchMethod> {
    Ok(match s {
        "zaefferer" => PeakSearchMethod::Zaefferer { grad_threshold: 100_000.0, snr_threshold: 5.0 },
        "peakfinder8" => PeakSearchMethod::Peakfinder8 {
            threshold_sigma: 5.0,
            min_pixels: 2,
            max_pixels: 200,
            min_res: 0.0,
            max_res: f64::INFINITY,
        },
        "peakfinder9" => PeakSearchMethod::Peakfinder9 { bg_sigma_threshold: 5.0, min_pixels: 2 },
        "hdf5" => PeakSearchMethod::PreparedHdf5,
        "cxi" => PeakSearchMethod::PreparedCxi,
        "payload" => PeakSearchMethod::Payload,
        other => bail!("unknown peak-search method '{other}'"),
    })
}

fn parse_integration(s: &str) -> Result<IntegrationMethod> {
    Ok(match s {
        "rings" => IntegrationMethod::Rings,
        "profile-fit" => IntegrationMethod::ProfileFit,
        other => bail!("unknown integration method '{other}'"),
    })
}

fn parse_cell(s: &str) -> Result<UnitCell> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 8 {
        bail!("--cell expects a,b,c,alpha,beta,gamma,lattice,centering; got '{s}'");
    }
    let a: f64 = parts[0].trim().parse().context("bad cell length a")?;
    let b: f64 = parts[1].trim().parse().context("bad cell length b")?;
    let c: f64 = parts[2].trim().parse().context("bad cell length c")?;
    let alpha: f64 = parts[3].trim().parse::<f64>().context("bad alpha")?.to_radians();
    let beta: f64 = parts[4].trim().parse::<f64>().context("bad beta")?.to_radians();
    let gamma: f64 = parts[5].trim().parse::<f64>().context("bad gamma")?.to_radians();
    let lattice = match parts[6].trim().to_lowercase().as_str() {
        "triclinic" => LatticeType::Triclinic,
        "monoclinic" => LatticeType::Monoclinic,
        "orthorhombic" => LatticeType::Orthorhombic,
        "tetragonal" => LatticeType::Tetragonal,
        "rhombohedral" => LatticeType::Rhombohedral,
        "hexagonal" => LatticeType::Hexagonal,
        "cubic" => LatticeType::Cubic,
        other => bail!("unknown lattice type '{other}'"),
    };
    let centering = match parts[7].trim().to_uppercase().as_str() {
        "P" => Centering::P,
        "A" => Centering::A,
        "B" => Centering::B,
        "C" => Centering::C,
        "I" => Centering::I,
        "F" => Centering::F,
        "R" => Centering::R,
        "H" => Centering::H,
        other => bail!("unknown centering '{other}'"),
    };
    Ok(UnitCell::from_parameters(a * 1e-10, b * 1e-10, c * 1e-10, alpha, beta, gamma, lattice, centering)?)
}

fn build_backends(names: &str, reference_cell: Option<&UnitCell>) -> Result<Vec<Box<dyn IndexingBackend>>> {
    let mut backends: Vec<Box<dyn IndexingBackend>> = Vec::new();
    for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match name {
            "reference-lattice" => {
                let cell = reference_cell
                    .cloned()
                    .context("reference-lattice backend requires --cell")?;
                backends.push(Box::new(ReferenceLatticeBackend::new(cell)));
            }
            other => {
                if let Some(program) = other.strip_prefix("external:") {
                    backends.push(Box::new(ExternalProcessBackend::new(
                        program,
                        Vec::new(),
                        std::time::Duration::from_secs(30),
                    )));
                } else {
                    bail!("unknown indexing backend '{other}'");
                }
            }
        }
    }
    if backends.is_empty() {
        bail!("no indexing backends configured (--indexing)");
    }
    Ok(backends)
}

#[allow(clippy::field_reassign_with_default)]
fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.input.exists() {
        bail!("input image list not found: {}", args.input.display());
    }

    let geom = match &args.geometry {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading geometry file {}", path.display()))?;
            Geometry::parse_minimal(&text)?
        }
        None => Geometry::single_panel(1024, 1024, 75e-6, 0.1, 1.0),
    };
    geom.validate()?;

    let reference_cell = args.cell.as_deref().map(parse_cell).transpose()?;

    let (tol_len, tol_ang_deg) = parse_pair(&args.tolerance, "--tolerance")?;
    let tolerance = CellTolerance { length_frac: tol_len, angle_rad: tol_ang_deg.to_radians() };

    let (pr_in, pr_mid, pr_out) = parse_triplet(&args.peak_radius, "--peak-radius")?;
    let (ir_in, ir_mid, ir_out) = parse_triplet(&args.int_radius, "--int-radius")?;

    let backends = build_backends(&args.indexing, reference_cell.as_ref())?;

    let flags = IndexingFlags {
        check_cell_axes: !args.no_check_cell,
        check_cell_combinations: false,
        refine: !args.no_refine,
        check_peaks: !args.no_check_peaks,
        retry: !args.no_retry,
        multi: args.multi,
    };

    let num_workers = if args.threads == 0 { num_cpus::get().max(1) } else { args.threads };

    let mut config = EngineConfig::default();
    config.min_peaks = args.min_peaks;
    config.peak_search = parse_peaks(&args.peaks)?;
    config.peak_radii = Radii::new(pr_in, pr_mid, pr_out);
    config.integration = parse_integration(&args.integration)?;
    config.integration_radii = Radii::new(ir_in, ir_mid, ir_out);
    config.indexing_backends = args.indexing.split(',').map(str::trim).map(str::to_string).collect();
    config.reference_cell = reference_cell;
    config.tolerance = tolerance;
    config.flags = flags;
    config.push_res = args.push_res;
    config.highres = args.highres.map(|d| d * 1e-10);
    config.wait_for_file = args.wait_for_file;
    config.num_workers = num_workers;
    config.filter = FilterConfig { median_box: args.median_filter, noise_filter: args.noise_filter };
    config.revalidate_min_snr = args.revalidate_min_snr;
    config.recenter_on_signal_centroid = args.recenter_on_centroid;
    if let Some(dir) = args.temp_dir {
        config.temp_dir = dir;
    }

    log::info!("loading images from {}", args.input.display());
    let source = LineFormatSource::open(&args.input, config.wait_for_file)?;
    let images = image_source::drain(source)?;
    log::info!("loaded {} images, dispatching across {} workers", images.len(), num_workers);

    let file = File::create(&args.output)
        .with_context(|| format!("creating output stream file {}", args.output.display()))?;
    let writer = BufWriter::new(file);

    let stats = dispatcher::run(images, Arc::new(geom), Arc::new(config), Arc::new(backends), writer)?;

    let processed = stats.images_processed.load(std::sync::atomic::Ordering::Relaxed);
    log::info!(
        "done: {} images processed, {} hits, {} errors, {} worker panics, {} stalls, {} cancelled",
        processed,
        stats.hits.load(std::sync::atomic::Ordering::Relaxed),
        stats.errors.load(std::sync::atomic::Ordering::Relaxed),
        stats.worker_panics.load(std::sync::atomic::Ordering::Relaxed),
        stats.stalls_detected.load(std::sync::atomic::Ordering::Relaxed),
        stats.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    );

    if processed == 0 {
        bail!("no images were processed");
    }

    Ok(())
}
