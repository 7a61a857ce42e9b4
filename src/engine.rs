use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::domain::convolution::ConvFilter;
use crate::domain::solver::{
    enough_ram_for_indexes, ExtractionMode, Extractor, FieldStars, IndexSearch,
    InternalExtractor, ParallelSolver, PositionPrior, ScalePrior, SolveOutcome, SolvePriors,
    Solver,
};
use crate::domain::wcs::WcsSolution;
use crate::model::{
    Background, CelestialCoord, ColorChannel, ConvFilterType, ImageStat, ImageView, Parameters,
    Profile, ScaleUnits, Solution, Star, SubFrame,
};

/// Engine verbosity for its own narration; kernel logging is separate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    Normal,
    Verbose,
}

/// The single completion notification of a top-level operation.
#[derive(Debug)]
pub enum Completion {
    ExtractReady {
        stars: Vec<Star>,
        background: Background,
    },
    SolveReady {
        solution: Solution,
        wcs: WcsSolution,
        stars: Vec<Star>,
        index_id: i32,
        healpix: i32,
    },
    Failed {
        reason: String,
    },
}

/// Cloneable handle that requests cancellation of the session's current
/// operation. Monotonic: once set it stays set for that operation.
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One extraction/solving session bound to a caller-owned image buffer.
/// Each top-level operation runs to a terminal state and returns exactly
/// one [`Completion`]; partial results stay readable afterwards.
pub struct Session<'a> {
    view: ImageView<'a>,
    params: Parameters,
    custom_filter: Option<Vec<f32>>,
    scale: Option<ScalePrior>,
    position: Option<PositionPrior>,
    index_files: Vec<PathBuf>,
    abort: Arc<AtomicBool>,
    log_level: LogLevel,

    stars: Vec<Star>,
    background: Background,
    solution: Option<Solution>,
    wcs: Option<WcsSolution>,
}

impl<'a> Session<'a> {
    pub fn new(
        stat: &ImageStat,
        buffer: &'a [u8],
        channel: ColorChannel,
    ) -> Result<Self, crate::error::SolveError> {
        let view = ImageView::new(stat, buffer, channel)?;
        Ok(Self {
            view,
            params: Parameters::default(),
            custom_filter: None,
            scale: None,
            position: None,
            index_files: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
            log_level: LogLevel::Normal,
            stars: Vec::new(),
            background: Background::default(),
            solution: None,
            wcs: None,
        })
    }

    pub fn set_parameters(&mut self, params: Parameters) {
        self.params = params;
    }

    pub fn set_profile(&mut self, profile: Profile) {
        self.params = Parameters::profile(profile);
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn set_log_level(&mut self, level: LogLevel) {
        self.log_level = level;
    }

    /// Caller-supplied convolution kernel used with
    /// [`ConvFilterType::Custom`]; must be square with an odd side.
    pub fn set_custom_filter(&mut self, data: Vec<f32>) {
        self.custom_filter = Some(data);
    }

    pub fn set_search_scale(&mut self, low: f64, high: f64, units: ScaleUnits) {
        self.scale = Some(ScalePrior { low, high, units });
    }

    /// Seed position in decimal degrees; the search radius comes from the
    /// active parameters.
    pub fn set_search_position(&mut self, ra: f64, dec: f64) {
        self.position = Some(PositionPrior { ra, dec, radius: self.params.search_radius });
    }

    pub fn set_index_files(&mut self, files: Vec<PathBuf>) {
        self.index_files = files;
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort))
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn background(&self) -> &Background {
        &self.background
    }

    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    pub fn wcs(&self) -> Option<&WcsSolution> {
        self.wcs.as_ref()
    }

    pub fn pixel_to_world(&self, x: f64, y: f64) -> Option<CelestialCoord> {
        self.wcs.as_ref().map(|w| w.pixel_to_world(x, y))
    }

    pub fn world_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.wcs.as_ref().map(|w| w.world_to_pixel(ra, dec))
    }

    fn build_filter(&self) -> Result<ConvFilter, String> {
        if self.params.conv_filter_type == ConvFilterType::Custom {
            let data = self
                .custom_filter
                .clone()
                .ok_or_else(|| "custom filter selected but none was supplied".to_string())?;
            ConvFilter::custom(data).map_err(|e| e.to_string())
        } else {
            Ok(ConvFilter::generate(self.params.conv_filter_type, self.params.fwhm))
        }
    }

    /// Extracts stars, optionally within a subframe. One completion.
    pub fn extract(&mut self, mode: ExtractionMode, subframe: Option<SubFrame>) -> Completion {
        self.abort.store(false, Ordering::Relaxed);
        self.stars.clear();
        self.background = Background::default();

        let filter = match self.build_filter() {
            Ok(f) => f,
            Err(reason) => return Completion::Failed { reason },
        };

        if self.log_level >= LogLevel::Normal {
            info!("starting star extraction with the {} profile", self.params.name);
        }

        let result =
            InternalExtractor.extract(&self.view, &self.params, &filter, mode, subframe, &self.abort);

        if self.abort.load(Ordering::Relaxed) {
            return Completion::Failed { reason: "aborted".into() };
        }

        self.stars = result.stars.clone();
        self.background = result.background;
        if let Some(wcs) = &self.wcs {
            wcs.annotate_stars(&mut self.stars);
        }
        Completion::ExtractReady { stars: result.stars, background: result.background }
    }

    fn check_solve_parameters(&self) -> Result<(), String> {
        if self.params.minwidth <= 0.0 || self.params.maxwidth <= 0.0 {
            return Err("minwidth and maxwidth must be positive".into());
        }
        if self.params.maxwidth < self.params.minwidth {
            return Err("maxwidth must not be smaller than minwidth".into());
        }
        if let Some(scale) = &self.scale {
            if scale.low <= 0.0 || scale.high < scale.low {
                return Err("scale prior bounds must be positive and ordered".into());
            }
        }
        Ok(())
    }

    /// Solves the field against the supplied index-search kernel. One
    /// completion; on failure any previously extracted stars remain
    /// available through [`Session::stars`].
    pub fn solve(&mut self, kernel: Arc<dyn IndexSearch>) -> Completion {
        self.abort.store(false, Ordering::Relaxed);
        self.solution = None;
        self.wcs = None;

        if let Err(reason) = self.check_solve_parameters() {
            return Completion::Failed { reason };
        }
        let filter = match self.build_filter() {
            Ok(f) => f,
            Err(reason) => return Completion::Failed { reason },
        };

        let mut params = self.params.clone();
        if params.auto_downsample {
            let largest = self.view.width().max(self.view.height());
            params.downsample = largest / 2048 + 1;
            if self.log_level >= LogLevel::Normal {
                info!("automatically downsampling the image by {}", params.downsample);
            }
        }
        let d = params.downsample.max(1);

        if params.in_parallel && !enough_ram_for_indexes(&self.index_files) {
            info!("not enough free RAM to load the index files together, disabling in-parallel loading");
            params.in_parallel = false;
        }

        // Scale priors stated in arcsec/pixel follow the working image.
        let scale = self.scale.map(|mut s| {
            if s.units == ScaleUnits::ArcsecPerPix && d > 1 {
                s.low *= d as f64;
                s.high *= d as f64;
            }
            s
        });

        let working = self.view.downsampled(d);
        let result = InternalExtractor.extract(
            &working,
            &params,
            &filter,
            ExtractionMode::Standard,
            None,
            &self.abort,
        );
        if self.abort.load(Ordering::Relaxed) {
            return Completion::Failed { reason: "aborted".into() };
        }
        if result.stars.is_empty() {
            return Completion::Failed {
                reason: "no stars were found, so the image cannot be solved".into(),
            };
        }
        self.background = result.background;

        let field = Arc::new(FieldStars {
            positions: result.stars.iter().map(|s| (s.x as f64, s.y as f64)).collect(),
            width: working.width(),
            height: working.height(),
        });
        let priors = SolvePriors { scale, position: self.position };

        let solver = ParallelSolver::new(kernel, self.index_files.clone());
        let outcome = solver.solve(field, &priors, &params, Arc::clone(&self.abort));

        match outcome {
            SolveOutcome::Solved(hit) => {
                let mut solution = hit.solution;
                // Report the scale of the original image, not the
                // downsampled working copy.
                solution.pixscale /= d as f64;
                if let Some(pos) = &self.position {
                    solution.ra_error = (pos.ra - solution.ra) * 3600.0;
                    solution.dec_error = (pos.dec - solution.dec) * 3600.0;
                }

                let wcs = hit.wcs.with_downsample(d);
                let mut stars = result.stars;
                for star in &mut stars {
                    // Back to original-image pixels before annotation.
                    star.x = (star.x - 0.5) * d as f32 + 0.5;
                    star.y = (star.y - 0.5) * d as f32 + 0.5;
                }
                wcs.annotate_stars(&mut stars);

                if self.log_level >= LogLevel::Normal {
                    let center = CelestialCoord { ra: solution.ra, dec: solution.dec };
                    info!(
                        "field center {} ({:.6}, {:.6} deg), scale {:.3}\"/px, log odds {:.1}",
                        center, solution.ra, solution.dec, solution.pixscale, hit.log_odds
                    );
                }

                self.solution = Some(solution.clone());
                self.wcs = Some(wcs.clone());
                self.stars = stars.clone();
                Completion::SolveReady {
                    solution,
                    wcs,
                    stars,
                    index_id: hit.index_id,
                    healpix: hit.healpix,
                }
            }
            SolveOutcome::Aborted => {
                self.stars = result.stars;
                Completion::Failed { reason: "aborted".into() }
            }
            SolveOutcome::TimedOut => {
                self.stars = result.stars;
                Completion::Failed { reason: "no solution found before the time limit".into() }
            }
            SolveOutcome::Unsolved => {
                self.stars = result.stars;
                Completion::Failed { reason: "no solution found after exhausting the search".into() }
            }
        }
    }
}
