use ndarray::Array2;

use crate::error::ExtractError;
use crate::model::ConvFilterType;

/// A small square matched filter, generated once per operation and shared
/// by every partition.
#[derive(Debug, Clone)]
pub struct ConvFilter {
    data: Vec<f32>,
    side: usize,
}

impl ConvFilter {
    /// Generates a filter of the given shape, sized from the FWHM: the
    /// half-width is `ceil(fwhm)` and the side `2 * ceil(fwhm) + 1`.
    pub fn generate(kind: ConvFilterType, fwhm: f64) -> ConvFilter {
        let size = fwhm.abs().ceil().max(1.0) as i32;
        let amplitude = 1.0f64;

        match kind {
            ConvFilterType::Default | ConvFilterType::Custom => ConvFilter::normalized(
                vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0],
                3,
            ),
            ConvFilterType::Gaussian => Self::from_fn(size, |x, y| {
                let r2 = (x * x + y * y) as f64;
                amplitude * (-4.0 * 2.0f64.ln() * r2 / (size as f64 * 1.5).powi(2)).exp()
            }),
            ConvFilterType::MexicanHat => Self::from_fn(size, |x, y| {
                let rr_ww = (x * x + y * y) as f64 / (2.0 * (size as f64).powi(2));
                amplitude * (1.0 - rr_ww) * (-rr_ww).exp()
            }),
            ConvFilterType::TopHat => Self::from_fn(size, |x, y| {
                let reach = 1.2 * (x.abs() + y.abs()) as f64 / size as f64;
                if reach <= 1.0 {
                    amplitude
                } else {
                    0.0
                }
            }),
            ConvFilterType::Ring => Self::from_fn(size, |x, y| {
                let r2 = (x * x + y * y) as f64;
                let outer =
                    amplitude * (-4.0 * 2.0f64.ln() * r2 / (size as f64).powi(2)).exp();
                let inner =
                    amplitude * (-4.0 * 2.0f64.ln() * r2 / (size as f64 / 2.0).powi(2)).exp();
                outer - inner
            }),
        }
    }

    fn from_fn(size: i32, f: impl Fn(i32, i32) -> f64) -> ConvFilter {
        let side = (2 * size + 1) as usize;
        let mut data = Vec::with_capacity(side * side);
        for y in -size..=size {
            for x in -size..=size {
                data.push(f(x, y) as f32);
            }
        }
        ConvFilter::normalized(data, side)
    }

    // Unit-sum normalization keeps the convolved image on the background
    // amplitude scale, so the absolute detection threshold stays valid.
    // Bandpass shapes (mexican hat, tight rings) sum to roughly zero;
    // rescaling those would amplify the noise floor instead, so they are
    // left untouched.
    fn normalized(mut data: Vec<f32>, side: usize) -> ConvFilter {
        let sum: f32 = data.iter().sum();
        if sum > 0.5 {
            for v in &mut data {
                *v /= sum;
            }
        }
        ConvFilter { data, side }
    }

    /// Wraps a caller-supplied square filter of odd side length.
    pub fn custom(data: Vec<f32>) -> Result<ConvFilter, ExtractError> {
        let side = (data.len() as f64).sqrt() as usize;
        if side * side != data.len() || side % 2 == 0 || side == 0 {
            return Err(ExtractError::IllegalAperture);
        }
        Ok(ConvFilter::normalized(data, side))
    }

    pub fn side(&self) -> usize {
        self.side
    }

    /// Matched-filter convolution. Taps falling outside the region are
    /// skipped, matching the detection convention near edges.
    pub fn apply(&self, region: &Array2<f32>) -> Array2<f32> {
        let (h, w) = region.dim();
        let c = (self.side / 2) as isize;
        let mut out = Array2::<f32>::zeros((h, w));

        for y in 0..h as isize {
            for x in 0..w as isize {
                let mut acc = 0.0f32;
                for j in 0..self.side as isize {
                    let sy = y + j - c;
                    if sy < 0 || sy >= h as isize {
                        continue;
                    }
                    for i in 0..self.side as isize {
                        let sx = x + i - c;
                        if sx < 0 || sx >= w as isize {
                            continue;
                        }
                        acc += self.data[(j * self.side as isize + i) as usize]
                            * region[[sy as usize, sx as usize]];
                    }
                }
                out[[y as usize, x as usize]] = acc;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_shape() {
        let f = ConvFilter::generate(ConvFilterType::Default, 2.0);
        assert_eq!(f.side(), 3);
        // Normalized from {1,2,1; 2,4,2; 1,2,1}.
        assert!((f.data[4] - 0.25).abs() < 1e-6);
        let sum: f32 = f.data.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_gaussian_filter_size_follows_fwhm() {
        let f = ConvFilter::generate(ConvFilterType::Gaussian, 2.0);
        assert_eq!(f.side(), 5);
        let f = ConvFilter::generate(ConvFilterType::Gaussian, 4.0);
        assert_eq!(f.side(), 9);
        // Peak at the center, falling off outward, unit total weight.
        let center = f.data[f.data.len() / 2];
        assert!(f.data[0] < center);
        let sum: f32 = f.data.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_ring_filter_depressed_center() {
        let f = ConvFilter::generate(ConvFilterType::Ring, 4.0);
        let center = f.data[f.data.len() / 2];
        assert!(center.abs() < 1e-6);
        // Positive annulus somewhere off-center.
        assert!(f.data.iter().any(|&v| v > 0.01));
    }

    #[test]
    fn test_custom_filter_validation() {
        assert!(ConvFilter::custom(vec![1.0; 9]).is_ok());
        assert!(ConvFilter::custom(vec![1.0; 16]).is_err());
        assert!(ConvFilter::custom(vec![1.0; 8]).is_err());
        assert!(ConvFilter::custom(Vec::new()).is_err());
    }

    #[test]
    fn test_convolution_spreads_peak() {
        let mut region = Array2::<f32>::zeros((9, 9));
        region[[4, 4]] = 16.0;
        let f = ConvFilter::generate(ConvFilterType::Default, 2.0);
        let out = f.apply(&region);
        assert!((out[[4, 4]] - 4.0).abs() < 1e-5);
        assert!((out[[4, 3]] - 2.0).abs() < 1e-5);
        assert!((out[[3, 3]] - 1.0).abs() < 1e-5);
        assert_eq!(out[[0, 0]], 0.0);
    }

    #[test]
    fn test_convolution_edge_truncation() {
        let region = Array2::<f32>::ones((5, 5));
        let f = ConvFilter::generate(ConvFilterType::Default, 2.0);
        let out = f.apply(&region);
        // Interior: unit weight; corner: only the 2x2 taps that fit.
        assert!((out[[2, 2]] - 1.0).abs() < 1e-5);
        assert!((out[[0, 0]] - 9.0 / 16.0).abs() < 1e-5);
    }
}
