//! Parallel batch execution with per-image fault isolation.
//!
//! Each worker of a local rayon pool builds one analyzer through the factory
//! and pulls image indices from a shared counter until the batch is drained.
//! Errors and panics inside a unit become `critical_error` rows; every input
//! identifier gets exactly one result, in input order.

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;

use super::features::Feature;
use super::{AnalysisResult, AnalysisStatus, ImageAnalyzer};

/// Fixed leading columns of the result table
pub const BASE_COLUMNS: [&str; 4] = ["image_identifier", "status", "error_detail", "face_area"];

/// Snapshot of batch progress taken when an image finishes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub elapsed: Duration,
}

impl BatchProgress {
    /// Completed share of the batch (0.0 to 1.0); an empty batch is complete
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    /// Remaining time at the average pace so far
    pub fn eta(&self) -> Option<Duration> {
        if self.completed == 0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.completed);
        Some(self.elapsed.mul_f64(remaining as f64 / self.completed as f64))
    }

    /// Images per second
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if self.completed == 0 || secs == 0.0 {
            0.0
        } else {
            self.completed as f64 / secs
        }
    }
}

/// Shared completion counter for one batch run
struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    started: Instant,
}

impl ProgressTracker {
    fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    /// Count one finished image
    fn record(&self) -> BatchProgress {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        BatchProgress {
            completed,
            total: self.total,
            elapsed: self.started.elapsed(),
        }
    }

    fn snapshot(&self) -> BatchProgress {
        BatchProgress {
            completed: self.completed.load(Ordering::Relaxed),
            total: self.total,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Available cores minus one, at least one
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub workers: usize,
    /// Upper bound for a single image; the stuck analyzer is abandoned and rebuilt
    pub unit_timeout: Option<Duration>,
    /// Keep aligned and final images in the results
    pub keep_images: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            unit_timeout: None,
            keep_images: false,
        }
    }
}

/// A `critical_error` row and why it happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub identifier: String,
    pub detail: String,
}

/// One table cell; undefined numbers are `Empty`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Integer(u64),
    Number(f64),
    Empty,
}

impl Cell {
    fn number(value: f64) -> Self {
        if value.is_finite() {
            Cell::Number(value)
        } else {
            Cell::Empty
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Text(s) => write!(f, "{}", s),
            Cell::Integer(n) => write!(f, "{}", n),
            Cell::Number(v) => write!(f, "{:.4}", v),
            Cell::Empty => Ok(()),
        }
    }
}

/// Column names plus one row per input identifier
#[derive(Debug, Clone, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ResultTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

pub struct BatchResult {
    results: Vec<AnalysisResult>,
    failures: Vec<BatchFailure>,
    elapsed: Duration,
}

impl BatchResult {
    fn new(results: Vec<AnalysisResult>, elapsed: Duration) -> Self {
        let failures = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == AnalysisStatus::CriticalError)
            .map(|(index, r)| BatchFailure {
                index,
                identifier: r.image_identifier.clone(),
                detail: r
                    .error_detail
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            })
            .collect();
        Self {
            results,
            failures,
            elapsed,
        }
    }

    /// Results in input order
    pub fn results(&self) -> &[AnalysisResult] {
        &self.results
    }

    pub fn failures(&self) -> &[BatchFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// First result for an input identifier
    pub fn get(&self, identifier: &str) -> Option<&AnalysisResult> {
        self.results.iter().find(|r| r.image_identifier == identifier)
    }

    /// Count per status, in status declaration order, omitting zero counts
    pub fn status_counts(&self) -> Vec<(AnalysisStatus, usize)> {
        AnalysisStatus::iter()
            .map(|status| (status, self.results.iter().filter(|r| r.status == status).count()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn count(&self, status: AnalysisStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn columns() -> Vec<String> {
        BASE_COLUMNS
            .iter()
            .copied()
            .chain(Feature::names())
            .map(str::to_string)
            .collect()
    }

    pub fn to_table(&self) -> ResultTable {
        let rows = self
            .results
            .iter()
            .map(|r| {
                let mut row = Vec::with_capacity(BASE_COLUMNS.len() + Feature::iter().len());
                row.push(Cell::Text(r.image_identifier.clone()));
                row.push(Cell::Text(r.status.to_string()));
                row.push(r.error_detail.clone().map(Cell::Text).unwrap_or(Cell::Empty));
                row.push(r.face_area.map(Cell::Integer).unwrap_or(Cell::Empty));
                row.extend(r.features.iter().map(|(_, v)| Cell::number(v)));
                row
            })
            .collect();
        ResultTable {
            columns: Self::columns(),
            rows,
        }
    }
}

impl Default for BatchResult {
    fn default() -> Self {
        Self::new(Vec::new(), Duration::ZERO)
    }
}

type ProgressCallback<'a> = Box<dyn Fn(&AnalysisResult, &BatchProgress) + Sync + 'a>;

/// Batch executor configured with [`BatchOptions`] and an optional progress callback
pub struct BatchRunner<'a> {
    options: BatchOptions,
    progress: Option<ProgressCallback<'a>>,
}

struct WorkerOutcome {
    results: Vec<(usize, AnalysisResult)>,
    init_error: Option<String>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(options: BatchOptions) -> Self {
        Self {
            options,
            progress: None,
        }
    }

    /// Called once per finished image with its result and the batch progress
    pub fn with_progress<C>(mut self, callback: C) -> Self
    where
        C: Fn(&AnalysisResult, &BatchProgress) + Sync + 'a,
    {
        self.progress = Some(Box::new(callback));
        self
    }

    pub fn run<A, F>(&self, identifiers: &[String], factory: F) -> Result<BatchResult>
    where
        A: ImageAnalyzer + Send + 'static,
        F: Fn() -> Result<A> + Sync,
    {
        if self.options.workers == 0 {
            bail!("worker count must be at least 1");
        }
        let tracker = ProgressTracker::new(identifiers.len());
        if identifiers.is_empty() {
            return Ok(BatchResult::new(Vec::new(), Duration::ZERO));
        }

        // No point building analyzers that would never get work
        let workers = self.options.workers.min(identifiers.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("face-worker-{}", i))
            .build()
            .context("Failed to initialize worker pool")?;
        debug!("Processing {} images on {} workers", identifiers.len(), workers);

        let next = AtomicUsize::new(0);
        let outcomes: Vec<WorkerOutcome> = pool.broadcast(|ctx| {
            self.worker_loop(ctx.index(), identifiers, &factory, &next, &tracker)
        });

        let mut slots: Vec<Option<AnalysisResult>> = identifiers.iter().map(|_| None).collect();
        let mut init_error = None;
        for outcome in outcomes {
            for (index, result) in outcome.results {
                slots[index] = Some(result);
            }
            if init_error.is_none() {
                init_error = outcome.init_error;
            }
        }

        let results = slots
            .into_iter()
            .zip(identifiers)
            .map(|(slot, identifier)| {
                slot.unwrap_or_else(|| {
                    let reason = init_error.as_deref().unwrap_or("worker stopped early");
                    AnalysisResult::critical(
                        identifier.as_str(),
                        format!("no analyzer available: {}", reason),
                    )
                })
            })
            .collect();

        let progress = tracker.snapshot();
        let batch = BatchResult::new(results, progress.elapsed);
        debug!(
            "Batch finished in {:?} ({:.1} images/s)",
            batch.elapsed(),
            progress.rate()
        );
        Ok(batch)
    }

    fn worker_loop<A, F>(
        &self,
        worker: usize,
        identifiers: &[String],
        factory: &F,
        next: &AtomicUsize,
        tracker: &ProgressTracker,
    ) -> WorkerOutcome
    where
        A: ImageAnalyzer + Send + 'static,
        F: Fn() -> Result<A> + Sync,
    {
        let mut outcome = WorkerOutcome {
            results: Vec::new(),
            init_error: None,
        };

        let mut analyzer = match build_analyzer(factory) {
            Ok(analyzer) => Some(analyzer),
            Err(e) => {
                error!("Worker {}: analyzer initialization failed: {}", worker, e);
                outcome.init_error = Some(e);
                return outcome;
            }
        };

        loop {
            let index = next.fetch_add(1, Ordering::SeqCst);
            let Some(identifier) = identifiers.get(index) else {
                break;
            };

            let current = match analyzer.take() {
                Some(current) => current,
                None => match build_analyzer(factory) {
                    Ok(rebuilt) => rebuilt,
                    Err(e) => {
                        error!("Worker {}: analyzer rebuild failed: {}", worker, e);
                        let result = AnalysisResult::critical(
                            identifier.as_str(),
                            format!("no analyzer available: {}", e),
                        );
                        self.record(&mut outcome, index, result, tracker);
                        outcome.init_error = Some(e);
                        return outcome;
                    }
                },
            };

            let (returned, unit) = match self.options.unit_timeout {
                Some(timeout) => run_with_timeout(current, identifier, timeout),
                None => {
                    let mut current = current;
                    let unit = run_guarded(&mut current, identifier);
                    (Some(current), unit)
                }
            };
            analyzer = returned.filter(|current| {
                let usable = current.is_usable();
                if !usable {
                    warn!("Worker {}: analyzer backend stopped, rebuilding", worker);
                }
                usable
            });

            let result = match unit {
                Ok(result) if self.options.keep_images => result,
                Ok(result) => result.without_images(),
                Err(detail) => {
                    warn!("[{}] critical error: {}", identifier, detail);
                    AnalysisResult::critical(identifier.as_str(), detail)
                }
            };
            self.record(&mut outcome, index, result, tracker);
        }

        outcome
    }

    fn record(
        &self,
        outcome: &mut WorkerOutcome,
        index: usize,
        result: AnalysisResult,
        tracker: &ProgressTracker,
    ) {
        let progress = tracker.record();
        if let Some(callback) = &self.progress {
            callback(&result, &progress);
        }
        outcome.results.push((index, result));
    }
}

/// Run a batch with default options and the given worker count
pub fn run_batch<A, F>(identifiers: &[String], factory: F, workers: usize) -> Result<BatchResult>
where
    A: ImageAnalyzer + Send + 'static,
    F: Fn() -> Result<A> + Sync,
{
    BatchRunner::new(BatchOptions {
        workers,
        ..Default::default()
    })
    .run(identifiers, factory)
}

fn build_analyzer<A, F>(factory: &F) -> Result<A, String>
where
    F: Fn() -> Result<A>,
{
    match catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Ok(analyzer)) => Ok(analyzer),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

/// Process one identifier, turning errors and panics into a detail string
fn run_guarded<A: ImageAnalyzer>(
    analyzer: &mut A,
    identifier: &str,
) -> Result<AnalysisResult, String> {
    match catch_unwind(AssertUnwindSafe(|| analyzer.process(identifier))) {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("panic: {}", panic_message(payload.as_ref()))),
    }
}

/// Run one unit on a helper thread; the analyzer comes back unless the unit overran
///
/// An overrunning unit is cancelled through the analyzer's cancel handle so a
/// blocked model process does not outlive the batch.
fn run_with_timeout<A>(
    analyzer: A,
    identifier: &str,
    timeout: Duration,
) -> (Option<A>, Result<AnalysisResult, String>)
where
    A: ImageAnalyzer + Send + 'static,
{
    let cancel = analyzer.cancel_handle();
    let (tx, rx) = mpsc::channel();
    let owned_id = identifier.to_string();
    let spawned = thread::Builder::new()
        .name("face-unit".to_string())
        .spawn(move || {
            let mut analyzer = analyzer;
            let unit = run_guarded(&mut analyzer, &owned_id);
            // The receiver is gone if the unit already timed out
            let _ = tx.send((analyzer, unit));
        });
    if let Err(e) = spawned {
        return (None, Err(format!("failed to start unit thread: {}", e)));
    }

    match rx.recv_timeout(timeout) {
        Ok((analyzer, unit)) => (Some(analyzer), unit),
        Err(RecvTimeoutError::Timeout) => {
            warn!("[{}] abandoned after {:?}", identifier, timeout);
            if let Some(cancel) = cancel {
                cancel();
            }
            (None, Err(format!("timed out after {:?}", timeout)))
        }
        Err(RecvTimeoutError::Disconnected) => {
            (None, Err("unit thread exited without a result".to_string()))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face_analysis::config::EnhancementConfig;
    use crate::face_analysis::test_support::*;
    use crate::face_analysis::FaceAnalyzer;
    use crate::face_analysis::detection::CancelHandle;
    use image::{DynamicImage, GrayImage};
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Succeeds on every identifier except the scripted failures
    struct ScriptedAnalyzer;

    impl ImageAnalyzer for ScriptedAnalyzer {
        fn process(&mut self, identifier: &str) -> Result<AnalysisResult> {
            if identifier.contains("panic") {
                panic!("synthetic fault in {}", identifier);
            }
            if identifier.contains("error") {
                anyhow::bail!("synthetic error in {}", identifier);
            }
            if identifier.contains("slow") {
                thread::sleep(Duration::from_secs(2));
            }
            let mut result = AnalysisResult::new(identifier);
            result.status = AnalysisStatus::Success;
            result.face_area = Some(identifier.len() as u64);
            result.final_image = Some(DynamicImage::ImageLuma8(GrayImage::new(2, 2)));
            Ok(result)
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Fails every unit once its shared backend flag is cleared
    struct FlakyBackendAnalyzer {
        alive: Arc<AtomicBool>,
    }

    impl ImageAnalyzer for FlakyBackendAnalyzer {
        fn process(&mut self, identifier: &str) -> Result<AnalysisResult> {
            if identifier.contains("crash") {
                self.alive.store(false, Ordering::SeqCst);
                anyhow::bail!("model backend stopped while analyzing {}", identifier);
            }
            if !self.alive.load(Ordering::SeqCst) {
                anyhow::bail!("sidecar is no longer running");
            }
            let mut result = AnalysisResult::new(identifier);
            result.status = AnalysisStatus::Success;
            Ok(result)
        }

        fn is_usable(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    /// Blocks until cancelled, like a unit waiting on a hung model process
    struct HangingAnalyzer {
        released: Arc<AtomicBool>,
        cancels: Arc<AtomicUsize>,
    }

    impl ImageAnalyzer for HangingAnalyzer {
        fn process(&mut self, identifier: &str) -> Result<AnalysisResult> {
            if identifier.contains("hang") {
                while !self.released.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                anyhow::bail!("sidecar closed its output");
            }
            let mut result = AnalysisResult::new(identifier);
            result.status = AnalysisStatus::Success;
            Ok(result)
        }

        fn cancel_handle(&self) -> Option<CancelHandle> {
            let released = self.released.clone();
            let cancels = self.cancels.clone();
            Some(Arc::new(move || {
                cancels.fetch_add(1, Ordering::SeqCst);
                released.store(true, Ordering::SeqCst);
            }))
        }
    }

    #[test]
    fn test_progress_fraction_and_eta() {
        let progress = BatchProgress {
            completed: 2,
            total: 6,
            elapsed: Duration::from_secs(10),
        };
        assert!((progress.fraction() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(progress.eta(), Some(Duration::from_secs(20)));
        assert!((progress.rate() - 0.2).abs() < 1e-9);

        let done = BatchProgress {
            completed: 6,
            ..progress
        };
        assert_eq!(done.eta(), Some(Duration::ZERO));
        assert_eq!(done.fraction(), 1.0);

        let fresh = BatchProgress {
            completed: 0,
            total: 6,
            elapsed: Duration::ZERO,
        };
        assert!(fresh.eta().is_none());
        assert_eq!(fresh.rate(), 0.0);
        assert_eq!(fresh.fraction(), 0.0);

        let empty = BatchProgress {
            completed: 0,
            total: 0,
            elapsed: Duration::ZERO,
        };
        assert_eq!(empty.fraction(), 1.0);
    }

    #[test]
    fn test_tracker_counts_each_finished_image() {
        let tracker = ProgressTracker::new(3);
        assert_eq!(tracker.snapshot().completed, 0);
        assert_eq!(tracker.record().completed, 1);
        let second = tracker.record();
        assert_eq!((second.completed, second.total), (2, 3));
        assert_eq!(tracker.snapshot().completed, 2);
    }

    #[test]
    fn test_fault_isolation() {
        let identifiers = ids(&["a.jpg", "b.jpg", "panic.jpg", "c.jpg", "d.jpg", "e.jpg"]);
        let batch = run_batch(&identifiers, || Ok(ScriptedAnalyzer), 3).unwrap();

        assert_eq!(batch.len(), identifiers.len());
        for (result, id) in batch.results().iter().zip(&identifiers) {
            assert_eq!(&result.image_identifier, id);
        }
        let faulty = batch.get("panic.jpg").unwrap();
        assert_eq!(faulty.status, AnalysisStatus::CriticalError);
        assert!(faulty.error_detail.as_ref().unwrap().contains("synthetic fault"));
        assert!(faulty.features.is_all_undefined());
        assert_eq!(batch.count(AnalysisStatus::Success), 5);

        assert_eq!(batch.failures().len(), 1);
        assert_eq!(batch.failures()[0].index, 2);
        assert_eq!(batch.failures()[0].identifier, "panic.jpg");
    }

    #[test]
    fn test_analyzer_errors_become_critical() {
        let identifiers = ids(&["error.jpg", "ok.jpg"]);
        let batch = run_batch(&identifiers, || Ok(ScriptedAnalyzer), 1).unwrap();
        let failed = batch.get("error.jpg").unwrap();
        assert_eq!(failed.status, AnalysisStatus::CriticalError);
        assert!(failed.error_detail.as_ref().unwrap().contains("synthetic error"));
        // the same worker keeps going with its analyzer
        assert!(batch.get("ok.jpg").unwrap().is_success());
    }

    #[test]
    fn test_factory_failure_still_yields_every_row() {
        let identifiers = ids(&["a.jpg", "b.jpg", "c.jpg"]);
        let batch = run_batch(
            &identifiers,
            || -> Result<ScriptedAnalyzer> { anyhow::bail!("model file not found") },
            2,
        )
        .unwrap();

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.failures().len(), 3);
        for result in batch.results() {
            assert_eq!(result.status, AnalysisStatus::CriticalError);
            assert!(result.error_detail.as_ref().unwrap().contains("model file not found"));
        }
    }

    #[test]
    fn test_one_failing_worker_leaves_work_to_others() {
        let calls = AtomicUsize::new(0);
        let identifiers = ids(&["a.jpg", "b.jpg", "c.jpg", "d.jpg"]);
        let batch = run_batch(
            &identifiers,
            || {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("first worker cannot load the model");
                }
                Ok(ScriptedAnalyzer)
            },
            2,
        )
        .unwrap();
        assert_eq!(batch.count(AnalysisStatus::Success), 4);
    }

    #[test]
    fn test_timeout_abandons_stuck_unit() {
        let builds = AtomicUsize::new(0);
        let identifiers = ids(&["a.jpg", "slow.jpg", "b.jpg"]);
        let runner = BatchRunner::new(BatchOptions {
            workers: 1,
            unit_timeout: Some(Duration::from_millis(200)),
            keep_images: false,
        });
        let batch = runner
            .run(&identifiers, || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedAnalyzer)
            })
            .unwrap();

        let slow = batch.get("slow.jpg").unwrap();
        assert_eq!(slow.status, AnalysisStatus::CriticalError);
        assert!(slow.error_detail.as_ref().unwrap().contains("timed out"));
        assert!(batch.get("a.jpg").unwrap().is_success());
        assert!(batch.get("b.jpg").unwrap().is_success());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_stopped_backend_is_rebuilt() {
        let builds = AtomicUsize::new(0);
        let identifiers = ids(&["a.jpg", "crash.jpg", "b.jpg", "c.jpg"]);
        let batch = run_batch(
            &identifiers,
            || {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(FlakyBackendAnalyzer {
                    alive: Arc::new(AtomicBool::new(true)),
                })
            },
            1,
        )
        .unwrap();

        let crashed = batch.get("crash.jpg").unwrap();
        assert_eq!(crashed.status, AnalysisStatus::CriticalError);
        assert!(batch.get("b.jpg").unwrap().is_success());
        assert!(batch.get("c.jpg").unwrap().is_success());
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timeout_cancels_blocked_unit() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let identifiers = ids(&["a.jpg", "hang.jpg", "b.jpg"]);
        let runner = BatchRunner::new(BatchOptions {
            workers: 1,
            unit_timeout: Some(Duration::from_millis(100)),
            keep_images: false,
        });
        let batch = runner
            .run(&identifiers, || {
                Ok(HangingAnalyzer {
                    released: released.clone(),
                    cancels: cancels.clone(),
                })
            })
            .unwrap();

        let hung = batch.get("hang.jpg").unwrap();
        assert_eq!(hung.status, AnalysisStatus::CriticalError);
        assert!(hung.error_detail.as_ref().unwrap().contains("timed out"));
        assert!(batch.get("b.jpg").unwrap().is_success());
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_progress_and_image_retention() {
        let seen = Mutex::new(Vec::new());
        let identifiers = ids(&["a.jpg", "b.jpg", "c.jpg"]);
        let batch = BatchRunner::new(BatchOptions {
            workers: 2,
            ..Default::default()
        })
        .with_progress(|result, progress| {
            assert_eq!(progress.total, 3);
            seen.lock().unwrap().push((result.image_identifier.clone(), progress.completed));
        })
        .run(&identifiers, || Ok(ScriptedAnalyzer))
        .unwrap();

        let mut counts: Vec<usize> = seen.lock().unwrap().iter().map(|(_, c)| *c).collect();
        counts.sort();
        assert_eq!(counts, vec![1, 2, 3]);
        assert!(batch.results().iter().all(|r| r.final_image.is_none()));

        let kept = BatchRunner::new(BatchOptions {
            workers: 1,
            unit_timeout: None,
            keep_images: true,
        })
        .run(&identifiers, || Ok(ScriptedAnalyzer))
        .unwrap();
        assert!(kept.results().iter().all(|r| r.final_image.is_some()));
    }

    #[test]
    fn test_result_table_shape() {
        let identifiers = ids(&["a.jpg", "panic.jpg"]);
        let batch = run_batch(&identifiers, || Ok(ScriptedAnalyzer), 2).unwrap();
        let table = batch.to_table();

        assert_eq!(table.columns.len(), 4 + Feature::names().count());
        assert_eq!(&table.columns[..4], &BASE_COLUMNS.map(String::from));
        assert_eq!(table.columns[4], "anger_lip_corner_pull_down_avg_y");
        assert_eq!(table.rows.len(), 2);
        assert!(table.rows.iter().all(|row| row.len() == table.columns.len()));

        assert_eq!(table.rows[0][0], Cell::Text("a.jpg".to_string()));
        assert_eq!(table.rows[0][1], Cell::Text("success".to_string()));
        assert_eq!(table.rows[0][2], Cell::Empty);
        assert_eq!(table.rows[0][3], Cell::Integer(5));
        assert_eq!(table.rows[1][1], Cell::Text("critical_error".to_string()));
        assert_eq!(table.column_index("avg_ear"), Some(5));

        let json = serde_json::to_value(&table).unwrap();
        assert!(json["rows"][1][4].is_null());

        assert_eq!(
            batch.status_counts(),
            vec![(AnalysisStatus::Success, 1), (AnalysisStatus::CriticalError, 1)]
        );
    }

    #[test]
    fn test_empty_batch_and_zero_workers() {
        let batch = run_batch(&[], || Ok(ScriptedAnalyzer), 4).unwrap();
        assert!(batch.is_empty());
        assert!(run_batch(&ids(&["a.jpg"]), || Ok(ScriptedAnalyzer), 0).is_err());
    }

    #[test]
    fn test_face_analyzer_batch_over_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut identifiers = Vec::new();
        for name in ["one.png", "two.png"] {
            let path = dir.path().join(name);
            frontal_image().save(&path).unwrap();
            identifiers.push(path.display().to_string());
        }
        identifiers.push(dir.path().join("missing.png").display().to_string());

        let batch = run_batch(
            &identifiers,
            || {
                Ok(FaceAnalyzer::new(
                    FixedDetector(vec![face_region()]),
                    FixedPredictor(Some(frontal_landmarks())),
                    EnhancementConfig::default(),
                )?)
            },
            2,
        )
        .unwrap();

        assert_eq!(batch.count(AnalysisStatus::Success), 2);
        assert_eq!(batch.results()[2].status, AnalysisStatus::LoadFailed);
        assert!(batch.failures().is_empty());
        let row = &batch.to_table().rows[0];
        assert!(row[4..].iter().all(|cell| matches!(cell, Cell::Number(_))));
    }
}
