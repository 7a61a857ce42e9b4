use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::domain::convolution::ConvFilter;
use crate::domain::partition::{run_extraction, ExtractionResult};
use crate::domain::wcs::WcsSolution;
use crate::error::SolveError;
use crate::model::{
    ImageView, MultiAlgo, Parameters, Parity, ScaleUnits, Solution, Star, SubFrame,
};
use crate::utils::sysinfo;
use crate::utils::throttle::Throttle;

/// How often the orchestrator rechecks the caller's abort flag while
/// waiting on children.
const ABORT_POLL: Duration = Duration::from_millis(25);

/// What an extraction run should measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMode {
    Standard,
    WithHfr,
}

/// Source-extraction capability. The orchestration layer depends only on
/// this seam, so alternative back-ends can slot in.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        view: &ImageView<'_>,
        params: &Parameters,
        filter: &ConvFilter,
        mode: ExtractionMode,
        subframe: Option<SubFrame>,
        cancel: &AtomicBool,
    ) -> ExtractionResult;
}

/// The built-in partitioned extractor.
pub struct InternalExtractor;

impl Extractor for InternalExtractor {
    fn extract(
        &self,
        view: &ImageView<'_>,
        params: &Parameters,
        filter: &ConvFilter,
        mode: ExtractionMode,
        subframe: Option<SubFrame>,
        cancel: &AtomicBool,
    ) -> ExtractionResult {
        run_extraction(
            view,
            params,
            filter,
            mode == ExtractionMode::WithHfr,
            subframe,
            cancel,
        )
    }
}

/// Field-scale estimate in one of the supported units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePrior {
    pub low: f64,
    pub high: f64,
    pub units: ScaleUnits,
}

/// Sky-position estimate with a search radius, all in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionPrior {
    pub ra: f64,
    pub dec: f64,
    pub radius: f64,
}

/// Log-odds acceptance thresholds handed to the kernel.
#[derive(Debug, Clone, Copy)]
pub struct OddsThresholds {
    pub to_solve: f64,
    pub to_keep: f64,
    pub to_tune: f64,
}

impl OddsThresholds {
    /// A solution must be kept to be solvable, so `to_keep` is clamped.
    pub fn from_params(params: &Parameters) -> Self {
        Self {
            to_solve: params.logratio_tosolve,
            to_keep: params.logratio_tokeep.min(params.logratio_tosolve),
            to_tune: params.logratio_totune,
        }
    }
}

/// The extracted field handed to every child solver.
#[derive(Debug, Clone)]
pub struct FieldStars {
    /// Star centroids, 1-based pixels of the solved image.
    pub positions: Vec<(f64, f64)>,
    pub width: u32,
    pub height: u32,
}

/// One child solver's work order.
#[derive(Debug, Clone)]
pub struct SearchJob {
    pub field: Arc<FieldStars>,
    /// Pixel-scale bounds in arcseconds per pixel of the solved image.
    pub scale_low: f64,
    pub scale_high: f64,
    /// Star-depth window, 1-based inclusive-exclusive, if sliced.
    pub depth: Option<(u32, u32)>,
    pub position: Option<PositionPrior>,
    pub parity: Parity,
    pub odds: OddsThresholds,
    pub in_parallel: bool,
    pub index_files: Arc<Vec<PathBuf>>,
}

/// Cooperative cancellation handle polled by kernels at checkpoints.
#[derive(Debug, Clone)]
pub struct SearchControl {
    stop: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl SearchControl {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// A successful match from the kernel.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub solution: Solution,
    pub wcs: WcsSolution,
    pub index_id: i32,
    pub healpix: i32,
    /// The per-solve refined star list, if the kernel produced one.
    pub matched_stars: Vec<Star>,
    pub log_odds: f64,
}

/// The black-box index-search primitive. Implementations match the field
/// against pre-built sky index files; `Ok(None)` means the search
/// completed (or was stopped) without reaching the solve threshold.
pub trait IndexSearch: Send + Sync {
    fn search(&self, job: &SearchJob, ctl: &SearchControl)
        -> Result<Option<SearchHit>, SolveError>;
}

/// Picks the concrete algorithm for `MultiAuto` from the available priors.
pub fn resolve_multi_algorithm(
    algo: MultiAlgo,
    has_scale: bool,
    has_position: bool,
) -> MultiAlgo {
    if algo != MultiAlgo::MultiAuto {
        return algo;
    }
    if has_scale && has_position {
        MultiAlgo::NotMulti
    } else if has_position {
        MultiAlgo::MultiScales
    } else if has_scale {
        MultiAlgo::MultiDepths
    } else {
        MultiAlgo::MultiScales
    }
}

/// The scale or depth slice assigned to one child solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildPlan {
    pub scale: Option<ScalePrior>,
    pub depth: Option<(u32, u32)>,
}

/// Splits the search space into disjoint child slices.
pub fn plan_children(
    algo: MultiAlgo,
    threads: usize,
    scale: Option<ScalePrior>,
    params: &Parameters,
) -> Vec<ChildPlan> {
    let threads = threads.max(1);
    match algo {
        MultiAlgo::NotMulti => vec![ChildPlan { scale, depth: None }],
        MultiAlgo::MultiScales => {
            // Solves are faster on bigger scales, so the quadratic schedule
            // hands the larger-scale children proportionally wider bins.
            let (low, high, units) = match scale {
                Some(p) => (p.low, p.high, p.units),
                None => (params.minwidth, params.maxwidth, ScaleUnits::DegWidth),
            };
            let k = (high - low) / (threads * threads) as f64;
            (0..threads)
                .map(|i| ChildPlan {
                    scale: Some(ScalePrior {
                        low: low + k * (i * i) as f64,
                        high: low + k * ((i + 1) * (i + 1)) as f64,
                        units,
                    }),
                    depth: None,
                })
                .collect()
        }
        MultiAlgo::MultiDepths => {
            let budget = params.keep_num.max(200) as u32;
            let step = (budget / threads as u32).max(10);
            let mut plans = Vec::new();
            let mut lo = 1u32;
            while lo < budget {
                plans.push(ChildPlan { scale, depth: Some((lo, lo + step)) });
                lo += step;
            }
            plans
        }
        MultiAlgo::MultiAuto => {
            debug_assert!(false, "MultiAuto must be resolved before planning");
            vec![ChildPlan { scale, depth: None }]
        }
    }
}

/// Converts a scale prior into arcsec-per-pixel bounds for the kernel.
/// Width-style units divide by the image width; the focal-length form
/// uses the 36 mm film width and inverts the ordering.
pub fn scale_to_arcsec_per_pixel(prior: &ScalePrior, image_width: u32) -> (f64, f64) {
    let w = image_width.max(1) as f64;
    match prior.units {
        ScaleUnits::DegWidth => (prior.low * 3600.0 / w, prior.high * 3600.0 / w),
        ScaleUnits::ArcminWidth => (prior.low * 60.0 / w, prior.high * 60.0 / w),
        ScaleUnits::ArcsecPerPix => (prior.low, prior.high),
        ScaleUnits::FocalMm => (
            (36.0 / (2.0 * prior.high)).atan().to_degrees() * 3600.0 / w,
            (36.0 / (2.0 * prior.low)).atan().to_degrees() * 3600.0 / w,
        ),
    }
}

/// Fallback arcsec-per-pixel bounds from the configured width limits.
pub fn default_scale_bounds(params: &Parameters, width: u32, height: u32) -> (f64, f64) {
    (
        params.minwidth * 3600.0 / width.max(1) as f64,
        params.maxwidth * 3600.0 / height.max(1) as f64,
    )
}

/// Checks whether the index set fits in free RAM, the admission test for
/// loading indexes in parallel.
pub fn enough_ram_for_indexes(index_files: &[PathBuf]) -> bool {
    let total: u64 = index_files
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();
    match sysinfo::available_ram() {
        Some(available) => {
            debug!(
                "index files: {} MB, free RAM: {} MB",
                total / (1024 * 1024),
                available / (1024 * 1024)
            );
            available > total
        }
        None => {
            warn!("unable to determine system RAM, taking the conservative path");
            false
        }
    }
}

/// Terminal state of one solve race.
#[derive(Debug)]
pub enum SolveOutcome {
    Solved(Box<SearchHit>),
    Unsolved,
    TimedOut,
    Aborted,
}

/// Scale and position estimates supplied by the caller, already adjusted
/// for any downsampling of the working image.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolvePriors {
    pub scale: Option<ScalePrior>,
    pub position: Option<PositionPrior>,
}

/// Plate-solving capability over an extracted star field. The session
/// depends only on this seam.
pub trait Solver: Send + Sync {
    fn solve(
        &self,
        field: Arc<FieldStars>,
        priors: &SolvePriors,
        params: &Parameters,
        abort: Arc<AtomicBool>,
    ) -> SolveOutcome;
}

/// The multi-strategy orchestrator: slices the search space across child
/// solvers and races them over the index-search kernel.
pub struct ParallelSolver {
    kernel: Arc<dyn IndexSearch>,
    index_files: Arc<Vec<PathBuf>>,
    threads: usize,
}

impl ParallelSolver {
    pub fn new(kernel: Arc<dyn IndexSearch>, index_files: Vec<PathBuf>) -> Self {
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { kernel, index_files: Arc::new(index_files), threads }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }
}

impl Solver for ParallelSolver {
    fn solve(
        &self,
        field: Arc<FieldStars>,
        priors: &SolvePriors,
        params: &Parameters,
        abort: Arc<AtomicBool>,
    ) -> SolveOutcome {
        let algo = resolve_multi_algorithm(
            params.multi_algorithm,
            priors.scale.is_some(),
            priors.position.is_some(),
        );
        let plans = plan_children(algo, self.threads, priors.scale, params);
        info!("starting {} child solver(s) ({:?})", plans.len(), algo);

        let odds = OddsThresholds::from_params(params);
        let jobs: Vec<SearchJob> = plans
            .iter()
            .map(|plan| {
                let (scale_low, scale_high) = match &plan.scale {
                    Some(prior) => scale_to_arcsec_per_pixel(prior, field.width),
                    None => default_scale_bounds(params, field.width, field.height),
                };
                debug!(
                    "child solver scale range {:.4} to {:.4} arcsec/pixel, depth {:?}",
                    scale_low, scale_high, plan.depth
                );
                SearchJob {
                    field: Arc::clone(&field),
                    scale_low,
                    scale_high,
                    depth: plan.depth,
                    position: priors.position,
                    parity: params.search_parity,
                    odds,
                    in_parallel: params.in_parallel,
                    index_files: Arc::clone(&self.index_files),
                }
            })
            .collect();

        run_race(
            Arc::clone(&self.kernel),
            jobs,
            abort,
            Duration::from_secs(params.solver_time_limit),
        )
    }
}

/// Races the child jobs against each other; the first hit wins and the
/// remaining children are stopped. Children run in their own threads and
/// report through a channel; results are drained in completion order.
pub fn run_race(
    kernel: Arc<dyn IndexSearch>,
    jobs: Vec<SearchJob>,
    user_abort: Arc<AtomicBool>,
    time_limit: Duration,
) -> SolveOutcome {
    if user_abort.load(Ordering::Relaxed) {
        return SolveOutcome::Aborted;
    }
    if jobs.is_empty() {
        return SolveOutcome::Unsolved;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let winner: Arc<Mutex<Option<SearchHit>>> = Arc::new(Mutex::new(None));
    let deadline = Instant::now() + time_limit;
    let (tx, rx) = channel::<usize>();

    let total = jobs.len();
    let mut handles = Vec::with_capacity(total);
    for (idx, job) in jobs.into_iter().enumerate() {
        let kernel = Arc::clone(&kernel);
        let stop = Arc::clone(&stop);
        let winner = Arc::clone(&winner);
        let tx = tx.clone();
        handles.push(thread::spawn(move || {
            let ctl = SearchControl { stop: Arc::clone(&stop), deadline: Some(deadline) };
            match kernel.search(&job, &ctl) {
                Ok(Some(hit)) => {
                    let mut slot = winner.lock().expect("winner slot lock");
                    if slot.is_none() {
                        info!("child solver {} solved the field", idx + 1);
                        *slot = Some(hit);
                        stop.store(true, Ordering::Relaxed);
                    }
                    // A second hit is redundant; drop it.
                }
                Ok(None) => debug!("child solver {} did not solve or was stopped", idx + 1),
                Err(e) => warn!("child solver {} failed: {}", idx + 1, e),
            }
            let _ = tx.send(idx);
        }));
    }
    drop(tx);

    let mut finished = 0usize;
    let mut aborted = false;
    let mut timed_out = false;
    let progress = Throttle::for_progress();
    while finished < total {
        if !aborted && user_abort.load(Ordering::Relaxed) {
            aborted = true;
            stop.store(true, Ordering::Relaxed);
        }
        if !timed_out && Instant::now() >= deadline {
            timed_out = true;
            stop.store(true, Ordering::Relaxed);
        }
        match rx.recv_timeout(ABORT_POLL) {
            Ok(_) => finished += 1,
            Err(RecvTimeoutError::Timeout) => {
                if progress.ready() {
                    debug!("waiting on {} child solver(s)", total - finished);
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for handle in handles {
        let _ = handle.join();
    }

    let hit = winner.lock().expect("winner slot lock").take();
    match hit {
        Some(hit) => SolveOutcome::Solved(Box::new(hit)),
        None if aborted => SolveOutcome::Aborted,
        None if timed_out => SolveOutcome::TimedOut,
        None => SolveOutcome::Unsolved,
    }
}
