//! Shared post-step for every peak-search method: recompute local SNR for
//! each peak against the raw image and drop those below threshold. Applied
//! to prepared lists too unless the caller suppresses it.

use crate::geometry::{Geometry, Image};
use crate::types::PeakList;

const NEIGHBOUR_RADIUS: isize = 4;

fn local_snr(image: &Image, geom: &Geometry, panel_idx: usize, fs: f64, ss: f64) -> Option<f64> {
    let panel = geom.panel(panel_idx)?;
    let data = image.panel_data.get(panel_idx)?;
    let cfs = fs.round() as isize;
    let css = ss.round() as isize;
    let center = *data.get(css as usize * panel.w + cfs as usize)?;

    let mut vals = Vec::new();
    for dfs in -NEIGHBOUR_RADIUS..=NEIGHBOUR_RADIUS {
        for dss in -NEIGHBOUR_RADIUS..=NEIGHBOUR_RADIUS {
            let nfs = cfs + dfs;
            let nss = css + dss;
            if nfs < 0 || nss < 0 || nfs as usize >= panel.w || nss as usize >= panel.h {
                continue;
            }
            if dfs.abs() <= 1 && dss.abs() <= 1 {
                continue;
            }
            if panel.bad[nss as usize * panel.w + nfs as usize] {
                continue;
            }
            vals.push(data[nss as usize * panel.w + nfs as usize]);
        }
    }
    if vals.is_empty() {
        return None;
    }
    let mean = vals.iter().sum::<f64>() / vals.len() as f64;
    let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
    let sigma = var.sqrt().max(1e-9);
    Some((center - mean) / sigma)
}

/// Recompute SNR for every peak and drop those below `min_snr`.
pub fn revalidate(peaks: PeakList, image: &Image, geom: &Geometry, min_snr: f64) -> PeakList {
    let kept = peaks
        .peaks
        .into_iter()
        .filter(|p| match local_snr(image, geom, p.panel, p.fs, p.ss) {
            Some(snr) => snr >= min_snr,
            None => false,
        })
        .collect();
    PeakList { peaks: kept }
}
