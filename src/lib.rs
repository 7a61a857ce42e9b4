//! Star extraction and plate solving for astronomical images.
//!
//! The crate takes a caller-owned intensity image, detects point-like
//! sources with a partitioned, parallel extraction pipeline, and can then
//! determine the image's World Coordinate System by racing child solvers
//! over an index-search kernel. See [`Session`] for the entry point.

pub mod domain;
pub mod engine;
pub mod error;
pub mod model;
mod utils;

pub use domain::batch::{extract_batch, solve_batch, BatchInput, BatchItem, BatchReport};
pub use domain::convolution::ConvFilter;
pub use domain::partition::ExtractionResult;
pub use domain::solver::{
    ExtractionMode, Extractor, FieldStars, IndexSearch, InternalExtractor, OddsThresholds,
    ParallelSolver, PositionPrior, ScalePrior, SearchControl, SearchHit, SearchJob,
    SolveOutcome, SolvePriors, Solver,
};
pub use domain::wcs::WcsSolution;
pub use engine::{AbortHandle, Completion, LogLevel, Session};
pub use error::{ExtractError, SolveError};
pub use utils::index_files::{default_index_folders, find_index_files};
pub use model::{
    snr, ApertureShape, Background, CelestialCoord, ColorChannel, ConvFilterType, ImageStat,
    ImageView, MultiAlgo, Parameters, Parity, PixelFormat, Profile, ScaleUnits, Solution, Star,
    SubFrame,
};
