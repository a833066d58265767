//! Zaefferer peak search: gradient-threshold seeding followed by an
//! iterative walk uphill to the local maximum.

use super::PanelView;
use crate::error::EngineError;
use crate::geometry::{Geometry, Image};
use crate::types::{Peak, PeakList};

fn gradient_sq(view: &PanelView, fs: isize, ss: isize) -> f64 {
    let Some(c) = view.get(fs, ss) else { return 0.0 };
    let gx = view.get(fs + 1, ss).unwrap_or(c) - view.get(fs - 1, ss).unwrap_or(c);
    let gy = view.get(fs, ss + 1).unwrap_or(c) - view.get(fs, ss - 1).unwrap_or(c);
    gx * gx + gy * gy
}

const BACKGROUND_RADIUS: isize = 4;

/// Local background estimate: mean/stddev of a box around (fs, ss) with the
/// inner 3x3 core excluded, same footprint peakfinder9 uses for its local
/// model. The inner core sits inside a peak's shoulders and would drag the
/// estimate up right where a peak actually is.
fn local_background(view: &PanelView, fs: isize, ss: isize) -> (f64, f64) {
    let mut vals = Vec::new();
    for dfs in -BACKGROUND_RADIUS..=BACKGROUND_RADIUS {
        for dss in -BACKGROUND_RADIUS..=BACKGROUND_RADIUS {
            if dfs.abs() <= 1 && dss.abs() <= 1 {
                continue;
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

/// Walk from (fs, ss) uphill to the local maximum, bounded to avoid
/// pathological loops on flat/noisy regions.
fn walk_to_maximum(view: &PanelView, mut fs: isize, mut ss: isize) -> (isize, isize) {
    for _ in 0..50 {
        let here = view.get(fs, ss).unwrap_or(f64::MIN);
        let mut best = (fs, ss, here);
        for dfs in -1..=1 {
            for dss in -1..=1 {
                if dfs == 0 && dss == 0 {
                    continue;
                }
                if let Some(v) = view.get(fs + dfs, ss + dss) {
                    if v > best.2 {
                        best = (fs + dfs, ss + dss, v);
                    }
                }
            }
        }
        if best.0 == fs && best.1 == ss {
            break;
        }
        fs = best.0;
        ss = best.1;
    }
    (fs, ss)
}

pub fn run(
    image: &Image,
    geom: &Geometry,
    grad_threshold: f64,
    snr_threshold: f64,
    reject_saturated: bool,
) -> Result<PeakList, EngineError> {
    let mut peaks = PeakList::new();

    for (panel_idx, panel) in geom.panels.iter().enumerate() {
        let data = &image.panel_data[panel_idx];
        let view = PanelView { data, bad: &panel.bad, w: panel.w, h: panel.h };
        let mut visited = vec![false; panel.w * panel.h];

        for ss in 0..panel.h as isize {
            for fs in 0..panel.w as isize {
                if visited[ss as usize * panel.w + fs as usize] {
                    continue;
                }
                let Some(value) = view.get(fs, ss) else { continue };
                if gradient_sq(&view, fs, ss) <= grad_threshold {
                    continue;
                }
                let (bg, bg_sigma) = local_background(&view, fs, ss);
                if (value - bg) / bg_sigma <= snr_threshold {
                    continue;
                }

                let (pfs, pss) = walk_to_maximum(&view, fs, ss);
                let idx = pss as usize * panel.w + pfs as usize;
                if visited[idx] {
                    continue;
                }
                visited[idx] = true;

                let peak_value = view.get(pfs, pss).unwrap_or(value);
                if reject_saturated && panel.is_saturated(pfs as usize, pss as usize, peak_value) {
                    continue;
                }

                let mut peak = Peak::new(pfs as f64, pss as f64, panel_idx, peak_value);
                peak.background = Some(bg);
                peaks.peaks.push(peak);
            }
        }
    }

    Ok(peaks)
}
