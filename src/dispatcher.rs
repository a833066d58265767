//! Work dispatcher: a worker pool reading from a bounded
//! work channel, a writer thread reordering results back into serial order
//! via a bounded `BTreeMap`, and a watchdog thread detecting stalled
//! workers.

use std::collections::BTreeMap;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::geometry::{Geometry, Image};
use crate::indexing::IndexingBackend;
use crate::pipeline::{self, PipelineOutput};
use crate::stream;
use crate::types::TimingAccount;

/// Counters tracked across the whole run. Diagnostic only.
#[derive(Default)]
pub struct DispatchStats {
    pub images_processed: AtomicU64,
    pub hits: AtomicU64,
    pub errors: AtomicU64,
    pub worker_panics: AtomicU64,
    pub stalls_detected: AtomicU64,
    pub cancelled: AtomicU64,
    pub max_pending: AtomicU64,
}

impl DispatchStats {
    fn update_max_pending(&self, size: usize) {
        let size = size as u64;
        let mut current = self.max_pending.load(Ordering::Relaxed);
        while size > current {
            match self.max_pending.compare_exchange_weak(current, size, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }
}

struct WorkItem {
    seq_id: u64,
    image: Image,
    cancel: Arc<AtomicBool>,
}

struct WorkResult {
    seq_id: u64,
    serial: u64,
    worker: usize,
    outcome: Result<Option<PipelineOutput>, EngineError>,
}

type InFlight = Arc<Mutex<BTreeMap<u64, (Instant, Arc<AtomicBool>)>>>;

/// Run the dispatcher end to end: feed `images` to `config.num_workers`
/// workers, write results to `out` in strict serial order, and return
/// aggregate stats once every image has been accounted for.
pub fn run<W: Write + Send + 'static>(
    images: Vec<Image>,
    geom: Arc<Geometry>,
    config: Arc<EngineConfig>,
    backends: Arc<Vec<Box<dyn IndexingBackend>>>,
    out: W,
) -> Result<DispatchStats, EngineError> {
    let stats = Arc::new(DispatchStats::default());
    let in_flight: InFlight = Arc::new(Mutex::new(BTreeMap::new()));

    let (work_tx, work_rx): (Sender<WorkItem>, Receiver<WorkItem>) = bounded(config.num_workers * 2);
    let (result_tx, result_rx): (Sender<WorkResult>, Receiver<WorkResult>) =
        bounded(config.reorder_buffer_bound);

    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = {
        let in_flight = Arc::clone(&in_flight);
        let stats = Arc::clone(&stats);
        let stop = Arc::clone(&watchdog_stop);
        let timeout = Duration::from_secs(config.stall_timeout_secs.max(1));
        let poll_interval = timeout.checked_div(4).unwrap_or(timeout).min(Duration::from_millis(200));
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(poll_interval);
                let guard = in_flight.lock().unwrap();
                for (seq_id, (started, cancel)) in guard.iter() {
                    if started.elapsed() > timeout && !cancel.load(Ordering::Relaxed) {
                        log::warn!("work item {seq_id} exceeded stall timeout, requesting cancellation");
                        cancel.store(true, Ordering::Relaxed);
                        stats.stalls_detected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
    };

    let writer_handle = {
        let result_rx = result_rx.clone();
        let stats = Arc::clone(&stats);
        thread::spawn(move || -> Result<(), EngineError> { write_ordered(out, result_rx, &stats) })
    };

    let mut worker_handles = Vec::with_capacity(config.num_workers);
    for worker_id in 0..config.num_workers {
        let work_rx = work_rx.clone();
        let result_tx = result_tx.clone();
        let geom = Arc::clone(&geom);
        let config = Arc::clone(&config);
        let backends = Arc::clone(&backends);
        let in_flight = Arc::clone(&in_flight);
        worker_handles.push(thread::spawn(move || {
            worker_loop(worker_id, work_rx, result_tx, &geom, &config, backends.as_slice(), &in_flight)
        }));
    }
    drop(result_tx);
    drop(work_rx);

    for (idx, image) in images.into_iter().enumerate() {
        let seq_id = idx as u64;
        let cancel = Arc::new(AtomicBool::new(false));
        if work_tx.send(WorkItem { seq_id, image, cancel }).is_err() {
            break;
        }
    }
    drop(work_tx);

    for handle in worker_handles {
        let _ = handle.join();
    }
    drop(result_rx);

    watchdog_stop.store(true, Ordering::Relaxed);
    let _ = watchdog.join();

    writer_handle.join().map_err(|_| EngineError::Output("writer thread panicked".to_string()))??;

    Ok(Arc::try_unwrap(stats).unwrap_or_default())
}

fn worker_loop(
    worker_id: usize,
    work_rx: Receiver<WorkItem>,
    result_tx: Sender<WorkResult>,
    geom: &Geometry,
    config: &EngineConfig,
    backends: &[Box<dyn IndexingBackend>],
    in_flight: &InFlight,
) {
    while let Ok(item) = work_rx.recv() {
        let serial = item.image.serial;
        in_flight.lock().unwrap().insert(item.seq_id, (Instant::now(), Arc::clone(&item.cancel)));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pipeline::process_image(&item.image, geom, config, backends, &item.cancel)
        }))
        .unwrap_or(Err(EngineError::WorkerFailed { worker: worker_id, serial }));

        in_flight.lock().unwrap().remove(&item.seq_id);

        let result = WorkResult { seq_id: item.seq_id, serial, worker: worker_id, outcome };
        if result_tx.send(result).is_err() {
            break;
        }
    }
}

fn write_ordered<W: Write>(
    mut out: W,
    result_rx: Receiver<WorkResult>,
    stats: &DispatchStats,
) -> Result<(), EngineError> {
    let mut pending: BTreeMap<u64, WorkResult> = BTreeMap::new();
    let mut next_expected: u64 = 0;
    let mut timing_totals = TimingAccount::default();

    for result in result_rx {
        pending.insert(result.seq_id, result);
        stats.update_max_pending(pending.len());

        while let Some(r) = pending.remove(&next_expected) {
            match r.outcome {
                Ok(Some(output)) => {
                    stats.images_processed.fetch_add(1, Ordering::Relaxed);
                    if output.chunk.is_hit() {
                        stats.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    accumulate(&mut timing_totals, &output.timing);
                    stream::write_chunk(&mut out, &output.chunk)
                        .map_err(|e| EngineError::Output(e.to_string()))?;
                }
                Ok(None) => {
                    stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    log::warn!("image with serial {} was cancelled, no chunk emitted", r.serial);
                }
                Err(EngineError::WorkerFailed { worker, serial }) => {
                    stats.worker_panics.fetch_add(1, Ordering::Relaxed);
                    log::error!("worker {worker} failed processing serial {serial}");
                }
                Err(e) => {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    log::warn!("image processing error for worker {}: {e}", r.worker);
                }
            }
            next_expected += 1;
        }
    }

    log::debug!(
        "cumulative stage timing (ns): filter={} peaksearch={} indexing={} refine={} integration={}",
        timing_totals.filter_ns,
        timing_totals.peaksearch_ns,
        timing_totals.indexing_ns,
        timing_totals.refine_ns,
        timing_totals.integration_ns
    );
    Ok(())
}

fn accumulate(totals: &mut TimingAccount, delta: &TimingAccount) {
    totals.acquire_ns += delta.acquire_ns;
    totals.filter_ns += delta.filter_ns;
    totals.peaksearch_ns += delta.peaksearch_ns;
    totals.indexing_ns += delta.indexing_ns;
    totals.refine_ns += delta.refine_ns;
    totals.integration_ns += delta.integration_ns;
    totals.stream_write_ns += delta.stream_write_ns;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::indexing::ReferenceLatticeBackend;
    use crate::peaksearch::PeakSearchMethod;
    use crate::test_support::{reference_cubic_cell, synthetic_image_from_cell};

    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    #[allow(clippy::field_reassign_with_default)]
    fn results_are_written_in_serial_order() {
        let geom = Geometry::single_panel(128, 128, 100e-6, 0.1, 1.0);
        let cell = reference_cubic_cell(50e-10);
        let mut images = Vec::new();
        for i in 0..6 {
            let (mut image, _) = synthetic_image_from_cell(&geom, &cell, 0.0);
            image.serial = i;
            images.push(image);
        }

        let mut config = EngineConfig::default();
        config.peak_search = PeakSearchMethod::Payload;
        config.reference_cell = Some(cell.clone());
        config.min_peaks = 4;
        config.flags.refine = false;
        config.num_workers = 3;

        let backends: Arc<Vec<Box<dyn IndexingBackend>>> =
            Arc::new(vec![Box::new(ReferenceLatticeBackend::new(cell))]);

        let shared = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedBuf(Arc::clone(&shared));
        let stats = run(images, Arc::new(geom), Arc::new(config), backends, writer).unwrap();
        assert_eq!(stats.images_processed.load(Ordering::Relaxed), 6);

        let text = String::from_utf8(shared.lock().unwrap().clone()).unwrap();
        let serials: Vec<u64> = text
            .lines()
            .filter_map(|l| l.strip_prefix("Image serial number: "))
            .map(|s| s.parse().unwrap())
            .collect();
        let mut sorted = serials.clone();
        sorted.sort();
        assert_eq!(serials, sorted);
        assert_eq!(serials.len(), 6);
    }
}
