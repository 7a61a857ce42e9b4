use log::debug;

use crate::model::{Parameters, PixelFormat, Star};

/// Applies the star filter chain to an aggregated detection list, in
/// order: resort by magnitude, size cuts, percentage cuts, ellipticity,
/// saturation, keep-N. Brightness-based steps only run when `resort` is
/// enabled, since they assume a magnitude-ordered list.
pub fn apply_star_filters(stars: &mut Vec<Star>, params: &Parameters, format: PixelFormat) {
    if stars.len() <= 1 {
        return;
    }
    debug!("stars found before filtering: {}", stars.len());

    if params.resort {
        // A star is dimmer when its mag is greater; brightest first.
        stars.sort_by(|s1, s2| s1.mag.partial_cmp(&s2.mag).unwrap_or(std::cmp::Ordering::Equal));
    }

    if params.max_size > 0.0 {
        let max = params.max_size as f32;
        stars.retain(|s| s.a <= max && s.b <= max);
    }

    if params.min_size > 0.0 {
        let min = params.min_size as f32;
        stars.retain(|s| s.a >= min && s.b >= min);
    }

    if params.resort && params.remove_brightest > 0.0 && params.remove_brightest < 100.0 {
        let num = (stars.len() as f64 * params.remove_brightest / 100.0) as usize;
        if num > 1 {
            stars.drain(..num);
        }
    }

    if params.resort && params.remove_dimmest > 0.0 && params.remove_dimmest < 100.0 {
        let num = (stars.len() as f64 * params.remove_dimmest / 100.0) as usize;
        if num > 1 {
            stars.truncate(stars.len() - num);
        }
    }

    if params.max_ellipse > 1.0 {
        let max = params.max_ellipse as f32;
        stars.retain(|s| !(s.b != 0.0 && s.a / s.b > max));
    }

    if params.saturation_limit > 0.0 && params.saturation_limit < 100.0 {
        match format.saturation_ceiling() {
            Some(ceiling) => {
                let cutoff = (params.saturation_limit / 100.0 * ceiling) as f32;
                stars.retain(|s| s.peak <= cutoff);
            }
            // Float data has no meaningful saturation point.
            None => debug!("skipping saturation filter"),
        }
    }

    if params.resort && params.keep_num > 0 {
        let num = stars.len().saturating_sub(params.keep_num);
        if num > 1 {
            stars.truncate(stars.len() - num);
        }
    }

    debug!("stars found after filtering: {}", stars.len());
}
