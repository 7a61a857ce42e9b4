pub mod image;
pub mod params;
pub mod star;

pub use image::{ColorChannel, ImageStat, ImageView, PixelFormat, SubFrame};
pub use params::{
    ApertureShape, ConvFilterType, MultiAlgo, Parameters, Profile, ScaleUnits,
};
pub use star::{snr, Background, CelestialCoord, Parity, Solution, Star};
