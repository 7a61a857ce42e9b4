use ndarray::Array2;

use crate::domain::labeling::Component;
use crate::error::ExtractError;

/// Fixed integration cutoff, in ellipse radii, for the Kron radius.
const KRON_CUTOFF: f64 = 6.0;

/// Best-fit ellipse of a component from its second moments.
#[derive(Debug, Clone, Copy)]
pub struct ShapeFit {
    /// Flux-weighted centroid, 0-based.
    pub x: f64,
    pub y: f64,
    /// Semi-major / semi-minor axes in pixels.
    pub a: f64,
    pub b: f64,
    /// Orientation in degrees.
    pub theta_deg: f64,
    /// Ellipse quadratic-form coefficients.
    pub cxx: f64,
    pub cyy: f64,
    pub cxy: f64,
}

/// Fits an ellipse to the component via flux-weighted second moments of
/// the filtered values.
pub fn fit_shape(comp: &Component) -> Result<ShapeFit, ExtractError> {
    let mut wsum = 0.0f64;
    let mut mx = 0.0f64;
    let mut my = 0.0f64;
    for p in &comp.pixels {
        let w = p.filtered.max(0.0) as f64;
        wsum += w;
        mx += w * p.x as f64;
        my += w * p.y as f64;
    }
    if wsum <= 0.0 {
        return Err(ExtractError::IllConditionedFit);
    }
    mx /= wsum;
    my /= wsum;

    let mut mx2 = 0.0f64;
    let mut my2 = 0.0f64;
    let mut mxy = 0.0f64;
    for p in &comp.pixels {
        let w = p.filtered.max(0.0) as f64;
        let dx = p.x as f64 - mx;
        let dy = p.y as f64 - my;
        mx2 += w * dx * dx;
        my2 += w * dy * dy;
        mxy += w * dx * dy;
    }
    mx2 /= wsum;
    my2 /= wsum;
    mxy /= wsum;

    // Regularize nearly singular moment matrices the way single-pixel
    // sources require: spread each axis by the variance of a uniform pixel.
    if (mx2 * my2 - mxy * mxy) < 0.00694 {
        mx2 += 1.0 / 12.0;
        my2 += 1.0 / 12.0;
    }

    let half_sum = (mx2 + my2) / 2.0;
    let half_diff = (mx2 - my2) / 2.0;
    let disc = (half_diff * half_diff + mxy * mxy).sqrt();
    let a2 = half_sum + disc;
    let b2 = (half_sum - disc).max(0.0);
    let a = a2.sqrt();
    let b = b2.sqrt();
    let theta = 0.5 * (2.0 * mxy).atan2(mx2 - my2);

    if !a.is_finite() || !b.is_finite() {
        return Err(ExtractError::IllConditionedFit);
    }

    let denom = mx2 * my2 - mxy * mxy;
    if denom <= 0.0 {
        return Err(ExtractError::IllConditionedFit);
    }
    Ok(ShapeFit {
        x: mx,
        y: my,
        a,
        b,
        theta_deg: theta.to_degrees(),
        cxx: my2 / denom,
        cyy: mx2 / denom,
        cxy: -2.0 * mxy / denom,
    })
}

/// Flux-weighted Kron radius by moment integration inside the fixed
/// 6-radius ellipse.
pub fn kron_radius(region: &Array2<f32>, shape: &ShapeFit) -> f64 {
    let (h, w) = region.dim();
    let extent = KRON_CUTOFF * shape.a.max(1.0);
    let x0 = ((shape.x - extent).floor().max(0.0)) as usize;
    let y0 = ((shape.y - extent).floor().max(0.0)) as usize;
    let x1 = ((shape.x + extent).ceil() as usize).min(w.saturating_sub(1));
    let y1 = ((shape.y + extent).ceil() as usize).min(h.saturating_sub(1));

    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f64 - shape.x;
            let dy = y as f64 - shape.y;
            let r2 = shape.cxx * dx * dx + shape.cyy * dy * dy + shape.cxy * dx * dy;
            if r2 > KRON_CUTOFF * KRON_CUTOFF {
                continue;
            }
            let v = region[[y, x]] as f64;
            if v <= 0.0 {
                continue;
            }
            num += v * r2.max(0.0).sqrt();
            den += v;
        }
    }
    if den <= 0.0 {
        0.0
    } else {
        num / den
    }
}

fn aperture_sum(
    region: &Array2<f32>,
    cx: f64,
    cy: f64,
    extent: f64,
    subpix: u32,
    inside: impl Fn(f64, f64) -> bool,
) -> Result<f64, ExtractError> {
    if subpix < 1 {
        return Err(ExtractError::IllegalSubpix);
    }
    let (h, w) = region.dim();
    let x0 = ((cx - extent).floor().max(0.0)) as usize;
    let y0 = ((cy - extent).floor().max(0.0)) as usize;
    let x1 = ((cx + extent).ceil() as usize).min(w.saturating_sub(1));
    let y1 = ((cy + extent).ceil() as usize).min(h.saturating_sub(1));

    let step = 1.0 / subpix as f64;
    let samples = (subpix * subpix) as f64;
    let mut sum = 0.0f64;

    for y in y0..=y1 {
        for x in x0..=x1 {
            let mut covered = 0u32;
            for sy in 0..subpix {
                let py = y as f64 + (sy as f64 + 0.5) * step - 0.5 - cy;
                for sx in 0..subpix {
                    let px = x as f64 + (sx as f64 + 0.5) * step - 0.5 - cx;
                    if inside(px, py) {
                        covered += 1;
                    }
                }
            }
            if covered > 0 {
                sum += region[[y, x]] as f64 * covered as f64 / samples;
            }
        }
    }
    Ok(sum)
}

/// Sub-pixel sampled circular aperture sum.
pub fn sum_circle(
    region: &Array2<f32>,
    cx: f64,
    cy: f64,
    r: f64,
    subpix: u32,
) -> Result<f64, ExtractError> {
    if r <= 0.0 {
        return Err(ExtractError::IllegalAperture);
    }
    let r2 = r * r;
    aperture_sum(region, cx, cy, r, subpix, |dx, dy| dx * dx + dy * dy <= r2)
}

/// Sub-pixel sampled elliptical aperture sum, with semi-axes scaled by `r`.
pub fn sum_ellipse(
    region: &Array2<f32>,
    cx: f64,
    cy: f64,
    shape: &ShapeFit,
    r: f64,
    subpix: u32,
) -> Result<f64, ExtractError> {
    if r <= 0.0 || shape.a <= 0.0 || shape.b < 0.0 {
        return Err(ExtractError::IllegalAperture);
    }
    let extent = shape.a * r;
    let r2 = r * r;
    aperture_sum(region, cx, cy, extent, subpix, |dx, dy| {
        shape.cxx * dx * dx + shape.cyy * dy * dy + shape.cxy * dx * dy <= r2
    })
}

/// Radius of the circle around `(cx, cy)` containing `frac` of the flux
/// found within `max_radius`.
pub fn flux_radius(
    region: &Array2<f32>,
    cx: f64,
    cy: f64,
    max_radius: f64,
    frac: f64,
) -> f64 {
    let (h, w) = region.dim();
    let x0 = ((cx - max_radius).floor().max(0.0)) as usize;
    let y0 = ((cy - max_radius).floor().max(0.0)) as usize;
    let x1 = ((cx + max_radius).ceil() as usize).min(w.saturating_sub(1));
    let y1 = ((cy + max_radius).ceil() as usize).min(h.saturating_sub(1));

    let mut samples: Vec<(f64, f64)> = Vec::new();
    let mut total = 0.0f64;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            let r = (dx * dx + dy * dy).sqrt();
            if r > max_radius {
                continue;
            }
            let v = (region[[y, x]] as f64).max(0.0);
            if v > 0.0 {
                samples.push((r, v));
                total += v;
            }
        }
    }
    if total <= 0.0 {
        return 0.0;
    }

    samples.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let target = frac * total;
    let mut acc = 0.0f64;
    let mut prev_r = 0.0f64;
    for (r, v) in samples {
        if acc + v >= target {
            // Interpolate within this sample's flux.
            let need = target - acc;
            return prev_r + (r - prev_r) * (need / v).clamp(0.0, 1.0);
        }
        acc += v;
        prev_r = r;
    }
    prev_r
}
