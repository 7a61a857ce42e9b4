use log::debug;
use ndarray::Array2;

use crate::domain::background::{self, TILE};
use crate::domain::convolution::ConvFilter;
use crate::domain::deblend::deblend;
use crate::domain::labeling::{label_components, Component};
use crate::domain::photometry::{self, ShapeFit};
use crate::error::ExtractError;
use crate::model::{ApertureShape, Background, Parameters, Star};

/// Maximum radius, in pixels, searched for the half-flux radius.
const HFR_MAX_RADIUS: f64 = 50.0;

/// Detections and background report from one partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionOutput {
    pub stars: Vec<Star>,
    pub background: Background,
}

/// Runs the extraction kernel over one background-subtracted working copy.
/// `keep` caps how many detections (largest ovals first) survive the
/// partition; `want_hfr` adds the half-flux radius measurement.
pub fn extract_region(
    mut region: Array2<f32>,
    filter: &ConvFilter,
    params: &Parameters,
    keep: usize,
    want_hfr: bool,
) -> Result<PartitionOutput, ExtractError> {
    let mesh = background::estimate(&region, TILE, TILE);
    mesh.subtract_from(&mut region);

    let tau = (params.threshold_bg_multiple * mesh.global_rms as f64
        + params.threshold_offset) as f32;
    if tau <= 0.0 {
        // Nothing rises above a flat background; report it and move on.
        return Ok(PartitionOutput { stars: Vec::new(), background: mesh.report(0) });
    }

    let filtered = filter.apply(&region);
    let components = label_components(&region, &filtered, tau, params.minarea, region.len())?;

    let mut objects: Vec<Component> = Vec::new();
    for comp in components {
        let children = deblend(comp, tau, params.deblend_thresh, params.deblend_contrast)?;
        objects.extend(children.into_iter().filter(|c| c.pixels.len() >= params.minarea));
    }
    let num_detected = objects.len();

    let mut fits: Vec<(Component, ShapeFit)> = Vec::with_capacity(objects.len());
    for obj in objects {
        let shape = photometry::fit_shape(&obj)?;
        fits.push((obj, shape));
    }

    // Oval size correlates well with HFR and magnitude; process the
    // largest detections first and stop at the partition budget.
    fits.sort_by(|l, r| {
        let lo = l.1.a * l.1.a + l.1.b * l.1.b;
        let ro = r.1.a * r.1.a + r.1.b * r.1.b;
        ro.partial_cmp(&lo).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut stars = Vec::new();
    for (obj, shape) in fits.into_iter().take(keep.max(1)) {
        if obj.truncated {
            // Detections running over the region boundary belong to a
            // neighboring partition's window.
            continue;
        }

        let kronrad = if params.aperture_shape != ApertureShape::Circle {
            photometry::kron_radius(&region, &shape)
        } else {
            0.0
        };

        let use_circle = match params.aperture_shape {
            ApertureShape::Auto => kronrad * (shape.a * shape.b).sqrt() < params.r_min,
            ApertureShape::Circle => true,
            ApertureShape::Ellipse => false,
        };

        let flux = if use_circle {
            photometry::sum_circle(&region, shape.x, shape.y, params.r_min, params.subpix)?
        } else {
            photometry::sum_ellipse(
                &region,
                shape.x,
                shape.y,
                &shape,
                params.kron_fact * kronrad,
                params.subpix,
            )?
        };
        if flux <= 0.0 {
            continue;
        }

        let hfr = if want_hfr {
            photometry::flux_radius(&region, shape.x, shape.y, HFR_MAX_RADIUS, 0.5) as f32
        } else {
            0.0
        };

        stars.push(Star {
            // The center of the first pixel is (1.0, 1.0).
            x: shape.x as f32 + 1.0,
            y: shape.y as f32 + 1.0,
            a: shape.a as f32,
            b: shape.b as f32,
            theta: shape.theta_deg as f32,
            mag: (params.magzero - 2.5 * flux.log10()) as f32,
            flux: flux as f32,
            peak: obj.peak_raw(),
            hfr,
            ra: 0.0,
            dec: 0.0,
            num_pixels: obj.pixels.len(),
        });
    }

    debug!(
        "partition: {} objects detected, {} kept",
        num_detected,
        stars.len()
    );

    Ok(PartitionOutput { stars, background: mesh.report(num_detected) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConvFilterType, Profile};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn add_gaussian(region: &mut Array2<f32>, cx: f64, cy: f64, sigma: f64, peak: f32) {
        let (h, w) = region.dim();
        for y in 0..h {
            for x in 0..w {
                let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                region[[y, x]] += peak * (-d2 / (2.0 * sigma * sigma)).exp() as f32;
            }
        }
    }

    fn noise_field(w: usize, h: usize, mean: f32, sigma: f32, seed: u64) -> Array2<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((h, w), |_| {
            // Box-Muller pair, one sample used.
            let u1: f64 = rng.gen_range(1e-9..1.0);
            let u2: f64 = rng.gen_range(0.0..1.0);
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            mean + sigma * z as f32
        })
    }

    fn extraction_params() -> Parameters {
        Parameters::profile(Profile::AllStars)
    }

    #[test]
    fn test_flat_image_yields_no_stars() {
        let region = Array2::from_elem((256, 256), 100.0f32);
        let params = extraction_params();
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);
        let out = extract_region(region, &filter, &params, 1000, false).unwrap();
        assert!(out.stars.is_empty());
        assert!((out.background.global - 100.0).abs() < 0.5);
        assert!(out.background.global_rms < 0.5);
    }

    #[test]
    fn test_single_gaussian_on_noise() {
        let mut region = noise_field(512, 512, 0.0, 5.0, 7);
        add_gaussian(&mut region, 128.0, 128.0, 3.0, 1000.0);
        let params = extraction_params();
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);
        let out = extract_region(region, &filter, &params, 1000, true).unwrap();
        assert_eq!(out.stars.len(), 1, "detected {:?}", out.stars.len());

        let star = &out.stars[0];
        assert!((star.x - 129.0).abs() < 0.5, "x={}", star.x);
        assert!((star.y - 129.0).abs() < 0.5, "y={}", star.y);
        assert!((star.a - 3.0).abs() < 0.6, "a={}", star.a);
        assert!(star.flux > 0.0);
        assert!(star.hfr > 2.0 && star.hfr < 5.0, "hfr={}", star.hfr);
        assert!(star.num_pixels >= params.minarea);
    }

    #[test]
    fn test_magnitude_formula() {
        let mut region = noise_field(128, 128, 0.0, 2.0, 11);
        add_gaussian(&mut region, 64.0, 64.0, 2.5, 2000.0);
        let params = extraction_params();
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);
        let out = extract_region(region, &filter, &params, 1000, false).unwrap();
        assert_eq!(out.stars.len(), 1);
        let star = &out.stars[0];
        let expected = params.magzero - 2.5 * (star.flux as f64).log10();
        assert!((star.mag as f64 - expected).abs() < 1e-4);
    }

    #[test]
    fn test_deblending_splits_close_pair() {
        let mut region = noise_field(256, 256, 0.0, 1.0, 3);
        add_gaussian(&mut region, 100.0, 100.0, 1.0, 800.0);
        add_gaussian(&mut region, 105.0, 100.0, 1.0, 800.0);
        let mut params = extraction_params();
        params.minarea = 5;
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);

        let out = extract_region(region.clone(), &filter, &params, 1000, false).unwrap();
        assert_eq!(out.stars.len(), 2, "expected a split pair");

        params.deblend_contrast = 1.0;
        let out = extract_region(region, &filter, &params, 1000, false).unwrap();
        assert_eq!(out.stars.len(), 1, "contrast 1.0 must disable deblending");
    }

    #[test]
    fn test_keep_budget_prefers_larger_ovals() {
        let mut region = noise_field(256, 256, 0.0, 1.0, 19);
        add_gaussian(&mut region, 60.0, 60.0, 4.0, 900.0);
        add_gaussian(&mut region, 180.0, 180.0, 1.5, 900.0);
        let mut params = extraction_params();
        params.minarea = 5;
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);
        let out = extract_region(region, &filter, &params, 1, false).unwrap();
        assert_eq!(out.stars.len(), 1);
        // The wider star wins the budget slot.
        assert!((out.stars[0].x - 61.0).abs() < 2.0);
    }

    #[test]
    fn test_truncated_detection_dropped() {
        let mut region = noise_field(128, 128, 0.0, 1.0, 5);
        add_gaussian(&mut region, 1.0, 64.0, 2.5, 2000.0);
        let params = extraction_params();
        let filter = ConvFilter::generate(params.conv_filter_type, params.fwhm);
        let out = extract_region(region, &filter, &params, 1000, false).unwrap();
        assert!(out.stars.is_empty());
        assert!(out.background.num_stars_detected >= 1);
    }
}
