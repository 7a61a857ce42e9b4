use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::star::Parity;

/// Aperture used for flux measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApertureShape {
    Auto,
    Circle,
    Ellipse,
}

/// Shape of the generated matched filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvFilterType {
    Default,
    Custom,
    Gaussian,
    MexicanHat,
    TopHat,
    Ring,
}

/// Units of a field-scale prior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleUnits {
    DegWidth,
    ArcminWidth,
    ArcsecPerPix,
    FocalMm,
}

/// How the solve is split across parallel child solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultiAlgo {
    /// Single child over the full parameter range.
    NotMulti,
    /// Children search disjoint slices of the scale range.
    MultiScales,
    /// Children search disjoint star-depth windows.
    MultiDepths,
    /// Pick one of the above from the available priors.
    MultiAuto,
}

/// Built-in parameter profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Default,
    SingleThreadSolving,
    ParallelLargeScale,
    ParallelSmallScale,
    AllStars,
    SmallStars,
    MidStars,
    BigStars,
}

/// The full option set for extraction and solving. Defaults are usable
/// as-is; profiles tune them for common cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Profile name and description; not part of equality.
    pub name: String,
    pub description: String,

    // Photometry
    pub aperture_shape: ApertureShape,
    /// Multiplier on the Kron radius for elliptical apertures.
    pub kron_fact: f64,
    /// Sub-pixel sampling depth for aperture sums.
    pub subpix: u32,
    /// Minimum aperture radius in pixels.
    pub r_min: f64,

    // Extraction
    /// Zero point of the relative magnitude scale.
    pub magzero: f64,
    /// Minimum source area in pixels.
    pub minarea: usize,
    /// Number of deblending sub-thresholds.
    pub deblend_thresh: u32,
    /// Flux fraction a sub-peak needs to split off as its own object.
    pub deblend_contrast: f64,
    pub clean: bool,
    pub clean_param: f64,

    // Matched filter
    pub conv_filter_type: ConvFilterType,
    pub fwhm: f64,

    /// Split the image into partitions processed in parallel.
    pub partition: bool,

    pub threshold_offset: f64,
    pub threshold_bg_multiple: f64,

    // Star filters; sizes refer to the ellipse semi-axes.
    pub max_size: f64,
    pub min_size: f64,
    pub max_ellipse: f64,
    /// Cap on detections kept per extraction, split across partitions.
    pub initial_keep: usize,
    /// Brightest-N cap applied at the end of the filter chain.
    pub keep_num: usize,
    pub remove_brightest: f64,
    pub remove_dimmest: f64,
    pub saturation_limit: f64,

    // Solver
    pub multi_algorithm: MultiAlgo,
    /// Load index files in parallel when RAM allows.
    pub in_parallel: bool,
    /// Wall-clock limit for a solve, in seconds.
    pub solver_time_limit: u64,
    /// Field width bounds in degrees used when no scale prior is given.
    pub minwidth: f64,
    pub maxwidth: f64,
    pub auto_downsample: bool,
    pub downsample: u32,
    pub resort: bool,
    pub search_parity: Parity,
    /// Search radius around the position prior, in degrees.
    pub search_radius: f64,

    // Odds thresholds, natural log.
    pub logratio_tosolve: f64,
    pub logratio_tokeep: f64,
    pub logratio_totune: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            name: "Default".into(),
            description: "Generic profile, not optimized for any specific purpose.".into(),
            aperture_shape: ApertureShape::Circle,
            kron_fact: 2.5,
            subpix: 5,
            r_min: 3.5,
            magzero: 20.0,
            minarea: 10,
            deblend_thresh: 32,
            deblend_contrast: 0.005,
            clean: true,
            clean_param: 1.0,
            conv_filter_type: ConvFilterType::Default,
            fwhm: 2.0,
            partition: true,
            threshold_offset: 0.0,
            threshold_bg_multiple: 2.0,
            max_size: 0.0,
            min_size: 0.0,
            max_ellipse: 0.0,
            initial_keep: 1_000_000,
            keep_num: 0,
            remove_brightest: 0.0,
            remove_dimmest: 0.0,
            saturation_limit: 0.0,
            multi_algorithm: MultiAlgo::MultiAuto,
            in_parallel: true,
            solver_time_limit: 600,
            minwidth: 0.1,
            maxwidth: 180.0,
            auto_downsample: true,
            downsample: 1,
            resort: true,
            search_parity: Parity::Both,
            search_radius: 15.0,
            logratio_tosolve: 1e9f64.ln(),
            logratio_tokeep: 1e9f64.ln(),
            logratio_totune: 1e6f64.ln(),
        }
    }
}

impl PartialEq for Parameters {
    fn eq(&self, other: &Self) -> bool {
        // The profile name and description are labels, not behavior.
        self.aperture_shape == other.aperture_shape
            && self.kron_fact == other.kron_fact
            && self.subpix == other.subpix
            && self.r_min == other.r_min
            && self.magzero == other.magzero
            && self.minarea == other.minarea
            && self.deblend_thresh == other.deblend_thresh
            && self.deblend_contrast == other.deblend_contrast
            && self.clean == other.clean
            && self.clean_param == other.clean_param
            && self.conv_filter_type == other.conv_filter_type
            && self.fwhm == other.fwhm
            && self.partition == other.partition
            && self.threshold_offset == other.threshold_offset
            && self.threshold_bg_multiple == other.threshold_bg_multiple
            && self.max_size == other.max_size
            && self.min_size == other.min_size
            && self.max_ellipse == other.max_ellipse
            && self.initial_keep == other.initial_keep
            && self.keep_num == other.keep_num
            && self.remove_brightest == other.remove_brightest
            && self.remove_dimmest == other.remove_dimmest
            && self.saturation_limit == other.saturation_limit
            && self.multi_algorithm == other.multi_algorithm
            && self.in_parallel == other.in_parallel
            && self.solver_time_limit == other.solver_time_limit
            && self.minwidth == other.minwidth
            && self.maxwidth == other.maxwidth
            && self.auto_downsample == other.auto_downsample
            && self.downsample == other.downsample
            && self.resort == other.resort
            && self.search_parity == other.search_parity
            && self.search_radius == other.search_radius
            && self.logratio_tosolve == other.logratio_tosolve
            && self.logratio_tokeep == other.logratio_tokeep
            && self.logratio_totune == other.logratio_totune
    }
}

impl Parameters {
    pub fn profile(profile: Profile) -> Parameters {
        match profile {
            Profile::Default => Parameters::default(),
            Profile::SingleThreadSolving => Parameters {
                name: "SingleThreadSolving".into(),
                description: "Plate solving telescopic sized images in a single thread.".into(),
                multi_algorithm: MultiAlgo::NotMulti,
                minwidth: 0.1,
                maxwidth: 10.0,
                keep_num: 50,
                initial_keep: 500,
                max_ellipse: 1.5,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 4.0,
                ..Parameters::default()
            },
            Profile::ParallelLargeScale => Parameters {
                name: "ParallelLargeScale".into(),
                description: "Plate solving camera-lens sized fields.".into(),
                minwidth: 10.0,
                maxwidth: 180.0,
                keep_num: 50,
                initial_keep: 500,
                max_ellipse: 1.5,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 4.0,
                ..Parameters::default()
            },
            Profile::ParallelSmallScale => Parameters {
                name: "ParallelSmallScale".into(),
                description: "Plate solving telescopic sized fields.".into(),
                minwidth: 0.1,
                maxwidth: 10.0,
                keep_num: 50,
                initial_keep: 500,
                max_ellipse: 1.5,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 4.0,
                ..Parameters::default()
            },
            Profile::AllStars => Parameters {
                name: "AllStars".into(),
                description: "Extraction of all the stars in an image.".into(),
                max_ellipse: 1.5,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 2.0,
                r_min: 2.0,
                ..Parameters::default()
            },
            Profile::SmallStars => Parameters {
                name: "SmallStars".into(),
                description: "Extraction optimized for smaller stars.".into(),
                max_ellipse: 1.5,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 2.0,
                r_min: 2.0,
                max_size: 5.0,
                initial_keep: 500,
                saturation_limit: 80.0,
                ..Parameters::default()
            },
            Profile::MidStars => Parameters {
                name: "MidStars".into(),
                description: "Extraction optimized for medium sized stars.".into(),
                max_ellipse: 1.5,
                minarea: 20,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 4.0,
                r_min: 5.0,
                remove_dimmest: 20.0,
                min_size: 2.0,
                max_size: 10.0,
                initial_keep: 500,
                saturation_limit: 80.0,
                ..Parameters::default()
            },
            Profile::BigStars => Parameters {
                name: "BigStars".into(),
                description: "Extraction optimized for larger stars.".into(),
                max_ellipse: 1.5,
                minarea: 40,
                conv_filter_type: ConvFilterType::Gaussian,
                fwhm: 8.0,
                r_min: 20.0,
                min_size: 5.0,
                initial_keep: 500,
                remove_dimmest: 50.0,
                ..Parameters::default()
            },
        }
    }

    pub fn built_in_profiles() -> Vec<Parameters> {
        [
            Profile::Default,
            Profile::SingleThreadSolving,
            Profile::ParallelLargeScale,
            Profile::ParallelSmallScale,
            Profile::AllStars,
            Profile::SmallStars,
            Profile::MidStars,
            Profile::BigStars,
        ]
        .into_iter()
        .map(Parameters::profile)
        .collect()
    }
}

/// Saves a profile list as pretty JSON.
pub fn save_profiles(path: &Path, profiles: &[Parameters]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create profile dir {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(profiles).context("Failed to serialize profiles")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write profiles to {:?}", path))
}

/// Loads a saved profile list, falling back to the built-ins when the file
/// is missing or unreadable.
pub fn load_profiles(path: &Path) -> Vec<Parameters> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            serde_json::from_str(&contents).unwrap_or_else(|_| Parameters::built_in_profiles())
        }
        Err(_) => Parameters::built_in_profiles(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = Parameters::default();
        assert_eq!(p.subpix, 5);
        assert_eq!(p.minarea, 10);
        assert_eq!(p.deblend_thresh, 32);
        assert!((p.deblend_contrast - 0.005).abs() < 1e-12);
        assert!((p.threshold_bg_multiple - 2.0).abs() < 1e-12);
        assert_eq!(p.initial_keep, 1_000_000);
        assert!((p.logratio_tosolve - 1e9f64.ln()).abs() < 1e-9);
        assert!((p.logratio_totune - 1e6f64.ln()).abs() < 1e-9);
    }

    #[test]
    fn test_equality_ignores_name() {
        let a = Parameters::default();
        let mut b = Parameters::default();
        b.name = "Renamed".into();
        b.description = "Something else".into();
        assert_eq!(a, b);

        b.fwhm = 3.0;
        assert_ne!(a, b);
    }

    #[test]
    fn test_profiles_cover_spec_table() {
        let large = Parameters::profile(Profile::ParallelLargeScale);
        assert_eq!(large.minwidth, 10.0);
        assert_eq!(large.maxwidth, 180.0);

        let small = Parameters::profile(Profile::ParallelSmallScale);
        assert_eq!(small.minwidth, 0.1);
        assert_eq!(small.maxwidth, 10.0);

        let single = Parameters::profile(Profile::SingleThreadSolving);
        assert_eq!(single.multi_algorithm, MultiAlgo::NotMulti);

        let mid = Parameters::profile(Profile::MidStars);
        assert_eq!(mid.min_size, 2.0);
        assert_eq!(mid.max_size, 10.0);
        assert_eq!(mid.remove_dimmest, 20.0);

        let big = Parameters::profile(Profile::BigStars);
        assert_eq!(big.min_size, 5.0);
        assert_eq!(big.remove_dimmest, 50.0);

        assert_eq!(Parameters::built_in_profiles().len(), 8);
    }

    #[test]
    fn test_profile_roundtrip_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("profiles.json");

        let mut custom = Parameters::profile(Profile::AllStars);
        custom.name = "MyProfile".into();
        custom.fwhm = 3.25;
        save_profiles(&path, &[custom.clone()]).unwrap();

        let loaded = load_profiles(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], custom);
        assert_eq!(loaded[0].name, "MyProfile");
    }

    #[test]
    fn test_load_missing_file_yields_builtins() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = load_profiles(&tmp.path().join("nope.json"));
        assert_eq!(loaded.len(), 8);
    }
}
