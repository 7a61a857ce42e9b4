use thiserror::Error;

/// Failure taxonomy of the extraction kernel. Each variant carries a stable
/// numeric status code so callers can log and compare results across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("memory allocation failed")]
    Memory,
    #[error("pixel stack overflow during labeling")]
    PixelStackFull,
    #[error("unsupported pixel format for this operation")]
    IllegalPixelFormat,
    #[error("sub-pixel sampling depth must be at least 1")]
    IllegalSubpix,
    #[error("ill-conditioned ellipse fit")]
    IllConditionedFit,
    #[error("illegal aperture parameters")]
    IllegalAperture,
    #[error("too many deblended sub-objects")]
    DeblendOverflow,
    #[error("unknown noise model")]
    UnknownNoise,
}

impl ExtractError {
    pub fn code(self) -> i32 {
        match self {
            ExtractError::Memory => 1,
            ExtractError::PixelStackFull => 2,
            ExtractError::IllegalPixelFormat => 3,
            ExtractError::IllegalSubpix => 4,
            ExtractError::IllConditionedFit => 5,
            ExtractError::IllegalAperture => 6,
            ExtractError::DeblendOverflow => 7,
            ExtractError::UnknownNoise => 10,
        }
    }
}

/// Failures of the solving layer. Partition-level extraction errors never
/// surface here; they are logged and the partition contributes nothing.
#[derive(Debug, Clone, Error)]
pub enum SolveError {
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("no solution found before the time limit")]
    TimedOut,
    #[error("no solution found after exhausting the search")]
    NoSolution,
    #[error("solve was aborted")]
    Cancelled,
    #[error("index search failed: {0}")]
    Kernel(String),
}
