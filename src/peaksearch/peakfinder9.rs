//! Peakfinder9: an explicit local-background model. A pixel is accepted as
//! a peak center only if it is the biggest pixel in its immediate
//! neighbourhood, a configurable number of neighbours also clear the
//! background-sigma threshold, and the local background sigma itself is
//! sane.

use super::PanelView;
use crate::error::EngineError;
use crate::geometry::{Geometry, Image};
use crate::types::{Peak, PeakList};

const NEIGHBOUR_RADIUS: isize = 4;
const MIN_NEIGHBOURS_OVER_THRESHOLD: usize = 2;

fn local_stats(view: &PanelView, fs: isize, ss: isize) -> (f64, f64) {
    let mut vals = Vec::new();
    for dfs in -NEIGHBOUR_RADIUS..=NEIGHBOUR_RADIUS {
        for dss in -NEIGHBOUR_RADIUS..=NEIGHBOUR_RADIUS {
            if dfs.abs() <= 1 && dss.abs() <= 1 {
                continue; // exclude the candidate peak's own core
            }
            if let Some(v) = view.get(fs + dfs, ss + dss) {
                vals.push(v);
            }
        }
    }
    if vals.is_empty() {
        return (0.0, 1.0);
    }
    let mean = vals.iter().sum::<f64>() / vals.len() as f64;
    let var = vals.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / vals.len() as f64;
    (mean, var.sqrt().max(1e-9))
}

pub fn run(
    image: &Image,
    geom: &Geometry,
    bg_sigma_threshold: f64,
    min_pixels: usize,
) -> Result<PeakList, EngineError> {
    let mut peaks = PeakList::new();

    for (panel_idx, panel) in geom.panels.iter().enumerate() {
        let data = &image.panel_data[panel_idx];
        let view = PanelView { data, bad: &panel.bad, w: panel.w, h: panel.h };
        let mut claimed = vec![false; panel.w * panel.h];

        for ss in 0..panel.h as isize {
            for fs in 0..panel.w as isize {
                let idx = ss as usize * panel.w + fs as usize;
                if claimed[idx] {
                    continue;
                }
                let Some(peak_pixel) = view.get(fs, ss) else { continue };

                // "Biggest pixel" test: must exceed every 3x3 neighbour.
                let mut biggest = true;
                for dfs in -1..=1 {
                    for dss in -1..=1 {
                        if dfs == 0 && dss == 0 {
                            continue;
                        }
                        if let Some(v) = view.get(fs + dfs, ss + dss) {
                            if v > peak_pixel {
                                biggest = false;
                            }
                        }
                    }
                }
                if !biggest {
                    continue;
                }

                let (bg, bg_sigma) = local_stats(&view, fs, ss);
                if bg_sigma <= 0.0 {
                    continue;
                }
                let snr = (peak_pixel - bg) / bg_sigma;
                if snr <= bg_sigma_threshold {
                    continue;
                }

                // Neighbour-over-threshold test.
                let mut over = 0usize;
                for dfs in -1..=1 {
                    for dss in -1..=1 {
                        if dfs == 0 && dss == 0 {
                            continue;
                        }
                        if let Some(v) = view.get(fs + dfs, ss + dss) {
                            if (v - bg) / bg_sigma > bg_sigma_threshold * 0.5 {
                                over += 1;
                            }
                        }
                    }
                }
                if over < MIN_NEIGHBOURS_OVER_THRESHOLD.min(min_pixels) {
                    continue;
                }

                claimed[idx] = true;
                let mut peak = Peak::new(fs as f64, ss as f64, panel_idx, peak_pixel);
                peak.background = Some(bg);
                peaks.peaks.push(peak);
            }
        }
    }

    Ok(peaks)
}
