//! Image sources: something that hands the CLI a stream of
//! `Image`s. Real detector file formats (HDF5, CBF) are out of scope; what's
//! implemented is the trait boundary, a simple line-oriented text format
//! good enough to drive the engine end to end without one, and an
//! in-memory source for tests.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, ImageLoadError};
use crate::geometry::{Image, Spectrum};
use crate::types::{Peak, PeakList};
use std::collections::HashMap;

/// Something that yields images one at a time, in file order.
pub trait ImageSource {
    fn next_image(&mut self) -> Result<Option<Image>, EngineError>;
}

/// Parses the engine's plain-text image list format: one image per line,
/// fields separated by `|`:
///
/// `serial|filename|event|wavelength_m|fs:ss:panel:intensity;fs:ss:panel:intensity;...`
///
/// The peak field is optional; omitting it (trailing `|` with nothing after)
/// means "no prepared peak list attached", forcing the configured
/// peak-search method to run instead of `Payload`/`PreparedHdf5`/`PreparedCxi`.
pub struct LineFormatSource {
    lines: std::io::Lines<BufReader<File>>,
    next_serial: u64,
}

impl LineFormatSource {
    /// Open `path`, retrying under `wait_for_file`: `0` gives up after the
    /// first failed open, `n > 0` retries up to `n` more times at 1-second
    /// spacing (`n + 1` attempts total), and a negative value retries
    /// forever (used for a watched input that's still being written).
    pub fn open(path: &Path, wait_for_file: i32) -> Result<Self, EngineError> {
        let mut retries = 0u32;
        loop {
            match File::open(path) {
                Ok(file) => return Ok(LineFormatSource { lines: BufReader::new(file).lines(), next_serial: 0 }),
                Err(_) => {
                    if wait_for_file >= 0 && retries as i32 >= wait_for_file {
                        return Err(EngineError::ImageLoad(ImageLoadError::NotFound {
                            path: path.display().to_string(),
                            retries,
                        }));
                    }
                    std::thread::sleep(Duration::from_secs(1));
                    retries += 1;
                }
            }
        }
    }
}

fn parse_peak(field: &str) -> Option<Peak> {
    let parts: Vec<&str> = field.split(':').collect();
    if parts.len() != 4 {
        return None;
    }
    let fs: f64 = parts[0].parse().ok()?;
    let ss: f64 = parts[1].parse().ok()?;
    let panel: usize = parts[2].parse().ok()?;
    let intensity: f64 = parts[3].parse().ok()?;
    Some(Peak::new(fs, ss, panel, intensity))
}

impl ImageSource for LineFormatSource {
    fn next_image(&mut self) -> Result<Option<Image>, EngineError> {
        loop {
            let Some(line) = self.lines.next() else { return Ok(None) };
            let line = line.map_err(|e| {
                EngineError::ImageLoad(ImageLoadError::CorruptPayload(e.to_string()))
            })?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.splitn(5, '|').collect();
            if fields.len() < 4 {
                return Err(EngineError::ImageLoad(ImageLoadError::CorruptPayload(format!(
                    "expected at least 4 '|'-separated fields, got {}",
                    fields.len()
                ))));
            }
            let serial: u64 = fields[0].parse().unwrap_or(self.next_serial);
            let filename = fields[1].to_string();
            let event = if fields[2].is_empty() { None } else { Some(fields[2].to_string()) };
            let wavelength: f64 = fields[3].parse().map_err(|_| {
                EngineError::ImageLoad(ImageLoadError::CorruptPayload(format!(
                    "bad wavelength field '{}'",
                    fields[3]
                )))
            })?;
            let prepared_peaks = fields.get(4).filter(|f| !f.is_empty()).map(|f| PeakList {
                peaks: f.split(';').filter_map(parse_peak).collect(),
            });

            self.next_serial = serial + 1;
            return Ok(Some(Image {
                serial,
                filename,
                event,
                wavelength,
                spectrum: Some(Spectrum::monochromatic(wavelength)),
                panel_data: Vec::new(),
                metadata: HashMap::new(),
                prepared_peaks,
            }));
        }
    }
}

/// In-memory image source, used by tests and by the synthetic end-to-end
/// scenarios that don't need a real file on disk.
pub struct InMemorySource {
    images: std::vec::IntoIter<Image>,
}

impl InMemorySource {
    pub fn new(images: Vec<Image>) -> Self {
        InMemorySource { images: images.into_iter() }
    }
}

impl ImageSource for InMemorySource {
    fn next_image(&mut self) -> Result<Option<Image>, EngineError> {
        Ok(self.images.next())
    }
}

/// Drain every image out of `source`, for callers that need the whole list
/// up front (the dispatcher currently takes an owned `Vec<Image>`).
pub fn drain(mut source: impl ImageSource) -> Result<Vec<Image>, EngineError> {
    let mut out = Vec::new();
    while let Some(image) = source.next_image()? {
        out.push(image);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_lines_with_and_without_peaks() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "0|run1.h5|//0|1.0e-10|10:10:0:500;20:20:0:600").unwrap();
        writeln!(tmp, "1|run1.h5|//1|1.0e-10|").unwrap();
        let mut source = LineFormatSource::open(tmp.path(), 0).unwrap();

        let first = source.next_image().unwrap().unwrap();
        assert_eq!(first.serial, 0);
        assert_eq!(first.prepared_peaks.unwrap().len(), 2);

        let second = source.next_image().unwrap().unwrap();
        assert_eq!(second.serial, 1);
        assert!(second.prepared_peaks.is_none());

        assert!(source.next_image().unwrap().is_none());
    }

    #[test]
    fn wait_for_file_zero_fails_immediately() {
        let missing = Path::new("/nonexistent/definitely-not-here.txt");
        match LineFormatSource::open(missing, 0) {
            Err(EngineError::ImageLoad(ImageLoadError::NotFound { retries, .. })) => assert_eq!(retries, 0),
            other => panic!("expected NotFound, got {}", other.is_ok()),
        }
    }

    #[test]
    fn wait_for_file_retries_before_giving_up() {
        let missing = Path::new("/nonexistent/definitely-not-here-either.txt");
        match LineFormatSource::open(missing, 2) {
            Err(EngineError::ImageLoad(ImageLoadError::NotFound { retries, .. })) => assert_eq!(retries, 2),
            other => panic!("expected NotFound, got {}", other.is_ok()),
        }
    }
}
