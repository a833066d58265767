//! Peakfinder8: a radial background model computed per annulus around the
//! beam center, 8-connected clustering of above-threshold pixels, and
//! resolution-band + pixel-count constraints.

use super::PanelView;
use crate::error::EngineError;
use crate::geometry::{Geometry, Image};
use crate::types::{Peak, PeakList};

/// Resolution (1/d, per metre) of a pixel given its lab-frame position and
/// wavelength.
fn resolution(pos_norm: f64, clen: f64, wavelength: f64) -> f64 {
    let two_theta = (pos_norm / clen).atan();
    2.0 * (two_theta / 2.0).sin() / wavelength
}

pub fn run(
    image: &Image,
    geom: &Geometry,
    threshold_sigma: f64,
    min_pixels: usize,
    max_pixels: usize,
    min_res: f64,
    max_res: f64,
) -> Result<PeakList, EngineError> {
    let mut peaks = PeakList::new();

    for (panel_idx, panel) in geom.panels.iter().enumerate() {
        let data = &image.panel_data[panel_idx];
        let view = PanelView { data, bad: &panel.bad, w: panel.w, h: panel.h };
        let clen = panel.resolve_clen(&image.metadata)?;

        // Bin pixels into radial annuli (by distance from panel origin in
        // the panel's own pixel space) and compute median+sigma per annulus.
        const N_ANNULI: usize = 32;
        let max_radius = ((panel.w.pow(2) + panel.h.pow(2)) as f64).sqrt() / 2.0;
        let cx = panel.w as f64 / 2.0;
        let cy = panel.h as f64 / 2.0;
        let mut annulus_values: Vec<Vec<f64>> = vec![Vec::new(); N_ANNULI];

        for ss in 0..panel.h {
            for fs in 0..panel.w {
                if panel.bad[ss * panel.w + fs] {
                    continue;
                }
                let r = ((fs as f64 - cx).powi(2) + (ss as f64 - cy).powi(2)).sqrt();
                let bin = ((r / max_radius) * N_ANNULI as f64) as usize;
                let bin = bin.min(N_ANNULI - 1);
                annulus_values[bin].push(data[ss * panel.w + fs]);
            }
        }

        let stats: Vec<(f64, f64)> = annulus_values
            .iter()
            .map(|vals| {
                if vals.is_empty() {
                    return (0.0, 1.0);
                }
                let mut sorted = vals.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let median = sorted[sorted.len() / 2];
                let var = vals.iter().map(|v| (v - median).powi(2)).sum::<f64>() / vals.len() as f64;
                (median, var.sqrt().max(1e-9))
            })
            .collect();

        let mut accepted = vec![false; panel.w * panel.h];
        let mut visited = vec![false; panel.w * panel.h];

        for ss in 0..panel.h {
            for fs in 0..panel.w {
                let idx = ss * panel.w + fs;
                if panel.bad[idx] {
                    continue;
                }
                let r = ((fs as f64 - cx).powi(2) + (ss as f64 - cy).powi(2)).sqrt();
                let bin = (((r / max_radius) * N_ANNULI as f64) as usize).min(N_ANNULI - 1);
                let (median, sigma) = stats[bin];
                if data[idx] > median + sigma * threshold_sigma {
                    accepted[idx] = true;
                }
            }
        }

        // 8-connected flood fill clustering of accepted pixels.
        for ss in 0..panel.h {
            for fs in 0..panel.w {
                let idx = ss * panel.w + fs;
                if !accepted[idx] || visited[idx] {
                    continue;
                }
                let mut stack = vec![(fs, ss)];
                let mut cluster = Vec::new();
                visited[idx] = true;
                while let Some((cfs, css)) = stack.pop() {
                    cluster.push((cfs, css));
                    for dfs in -1isize..=1 {
                        for dss in -1isize..=1 {
                            if dfs == 0 && dss == 0 {
                                continue;
                            }
                            let nfs = cfs as isize + dfs;
                            let nss = css as isize + dss;
                            if nfs < 0 || nss < 0 || nfs as usize >= panel.w || nss as usize >= panel.h {
                                continue;
                            }
                            let nidx = nss as usize * panel.w + nfs as usize;
                            if accepted[nidx] && !visited[nidx] {
                                visited[nidx] = true;
                                stack.push((nfs as usize, nss as usize));
                            }
                        }
                    }
                }

                if cluster.len() < min_pixels || cluster.len() > max_pixels {
                    continue;
                }

                let (mut sum_fs, mut sum_ss, mut sum_i, mut peak_i) = (0.0, 0.0, 0.0, f64::MIN);
                for &(cfs, css) in &cluster {
                    let v = view.get(cfs as isize, css as isize).unwrap_or(0.0);
                    sum_fs += cfs as f64 * v;
                    sum_ss += css as f64 * v;
                    sum_i += v;
                    peak_i = peak_i.max(v);
                }
                if sum_i <= 0.0 {
                    continue;
                }
                let centroid_fs = sum_fs / sum_i;
                let centroid_ss = sum_ss / sum_i;

                let pos = panel.project(centroid_fs, centroid_ss);
                let pos_radial = (pos.x * pos.x + pos.y * pos.y).sqrt();
                let res = resolution(pos_radial, clen, image.wavelength);
                if res < min_res || res > max_res {
                    continue;
                }

                let mut peak = Peak::new(centroid_fs, centroid_ss, panel_idx, peak_i);
                peak.resolution = Some(res);
                peaks.peaks.push(peak);
            }
        }
    }

    Ok(peaks)
}
