pub mod background;
pub mod batch;
pub mod convolution;
pub mod deblend;
pub mod extract;
pub mod filters;
pub mod labeling;
pub mod partition;
pub mod photometry;
pub mod solver;
pub mod stats;
pub mod wcs;
