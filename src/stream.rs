//! Stream writer: append-only, line-oriented chunk serialization
//!. Each chunk is framed by `----- Begin chunk -----` /
//! `----- End chunk -----` delimiters and emitted atomically so a reader
//! tailing the file never observes a half-written chunk.

use anyhow::Result;
use std::io::Write;

use crate::types::Chunk;

fn format_chunk(chunk: &Chunk) -> String {
    let mut out = String::new();
    out.push_str("----- Begin chunk -----\n");
    out.push_str(&format!("Image filename: {}\n", chunk.filename));
    if let Some(event) = &chunk.event {
        out.push_str(&format!("Event: {event}\n"));
    }
    out.push_str(&format!("Image serial number: {}\n", chunk.serial));
    out.push_str(&format!("photon_energy_eV = {:.3}\n", chunk.metadata.photon_energy_ev));
    for (key, value) in &chunk.metadata.copy_fields {
        out.push_str(&format!("{key} = {value}\n"));
    }
    out.push_str(&format!("hit = {}\n", u8::from(chunk.is_hit())));
    out.push_str(&format!("num_saturated_peaks = {}\n", chunk.num_saturated_peaks));
    if let Some(indexed_by) = &chunk.indexed_by {
        out.push_str(&format!("indexed_by = {indexed_by}\n"));
    }

    if let Some(peaks) = &chunk.peaks {
        out.push_str(&format!("num_peaks = {}\n", peaks.len()));
        out.push_str("  fs/px   ss/px panel     Intensity\n");
        for p in &peaks.peaks {
            out.push_str(&format!(
                "{:8.2}{:8.2} {:>5} {:14.2}\n",
                p.fs, p.ss, p.panel, p.intensity
            ));
        }
        out.push_str("End of peak list\n");
    }

    for crystal in &chunk.crystals {
        let (a, b, c, alpha, beta, gamma) = crystal.cell.parameters();
        out.push_str("--- Begin crystal\n");
        out.push_str(&format!(
            "Cell parameters {:.5} {:.5} {:.5} nm {:.5} {:.5} {:.5} deg\n",
            a * 1e9,
            b * 1e9,
            c * 1e9,
            alpha.to_degrees(),
            beta.to_degrees(),
            gamma.to_degrees()
        ));
        out.push_str(&format!("lattice_type = {:?}\n", crystal.cell.lattice_type));
        out.push_str(&format!("centering = {}\n", crystal.cell.centering));
        out.push_str(&format!("profile_radius = {:.6} nm^-1\n", crystal.profile_radius * 1e-9));
        out.push_str(&format!("diffraction_resolution_limit = {:.6} nm^-1\n", crystal.profile_radius * 1e-9));
        out.push_str(&format!("num_reflections = {}\n", crystal.reflections.len()));
        out.push_str(&format!("num_saturated_reflections = {}\n", crystal.num_saturated()));
        out.push_str("Reflections measured after indexing\n");
        out.push_str("   h    k    l          I     sigma(I)  panel\n");
        for r in &crystal.reflections {
            out.push_str(&format!(
                "{:5}{:5}{:5} {:10.2} {:10.2} {:>6}\n",
                r.hkl.h, r.hkl.k, r.hkl.l, r.intensity, r.esd, r.panel
            ));
        }
        out.push_str("End of reflections\n");
        out.push_str("--- End crystal\n");
    }

    out.push_str("----- End chunk -----\n");
    out
}

/// Append one chunk to `writer` in a single write call so concurrent
/// readers never see a partial chunk.
pub fn write_chunk<W: Write>(writer: &mut W, chunk: &Chunk) -> Result<()> {
    let text = format_chunk(chunk);
    writer.write_all(text.as_bytes())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChunkMetadata, PeakList};

    #[test]
    fn non_hit_chunk_has_no_crystal_blocks() {
        let chunk = Chunk {
            filename: "run1.h5".to_string(),
            event: None,
            serial: 1,
            wavelength: 1e-10,
            metadata: ChunkMetadata::default(),
            peaks: Some(PeakList::new()),
            crystals: Vec::new(),
            num_saturated_peaks: 0,
            indexed_by: None,
        };
        let text = format_chunk(&chunk);
        assert!(text.contains("hit = 0"));
        assert!(!text.contains("Begin crystal"));
        assert!(text.starts_with("----- Begin chunk -----"));
        assert!(text.trim_end().ends_with("----- End chunk -----"));
    }
}
