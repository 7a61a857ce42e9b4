use std::sync::Arc;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::SolveError;

/// Element type of a raw image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl PixelFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelFormat::U8 => 1,
            PixelFormat::I16 | PixelFormat::U16 => 2,
            PixelFormat::I32 | PixelFormat::U32 | PixelFormat::F32 => 4,
            PixelFormat::F64 => 8,
        }
    }

    /// Largest representable value, for the saturation filter.
    /// Float formats have no meaningful ceiling and return `None`.
    pub fn saturation_ceiling(self) -> Option<f64> {
        match self {
            PixelFormat::U8 => Some(u8::MAX as f64),
            PixelFormat::I16 => Some(i16::MAX as f64),
            PixelFormat::U16 => Some(u16::MAX as f64),
            PixelFormat::I32 => Some(i32::MAX as f64),
            PixelFormat::U32 => Some(u32::MAX as f64),
            PixelFormat::F32 | PixelFormat::F64 => None,
        }
    }
}

/// Which channel of an RGB image feeds extraction. `AverageRgb` and
/// `IntegratedRgb` materialize a merged single-channel buffer up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorChannel {
    Red,
    Green,
    Blue,
    AverageRgb,
    IntegratedRgb,
}

/// Description of a caller-owned image buffer. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageStat {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: PixelFormat,
}

impl ImageStat {
    pub fn new(width: u32, height: u32, channels: u8, format: PixelFormat) -> Self {
        Self { width, height, channels, format }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_sample()
    }

    pub fn samples_per_channel(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn total_samples(&self) -> usize {
        self.samples_per_channel() * self.channels as usize
    }

    pub fn expected_len(&self) -> usize {
        self.total_samples() * self.bytes_per_pixel()
    }
}

/// A sub-rectangle of the image, in original-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubFrame {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl SubFrame {
    /// Clamps the frame to the image bounds, normalizing negative extents away.
    pub fn clamped(&self, image_w: u32, image_h: u32) -> SubFrame {
        let x = self.x.min(image_w);
        let y = self.y.min(image_h);
        SubFrame {
            x,
            y,
            width: self.width.min(image_w - x),
            height: self.height.min(image_h - y),
        }
    }
}

#[derive(Clone)]
enum Pixels<'a> {
    /// Borrowed caller buffer; `plane` is the sample offset of the selected
    /// channel plane (plane-interleaved layout).
    Raw { buffer: &'a [u8], plane: usize },
    /// Merged-channel or downsampled working buffer, written once.
    Derived(Arc<Vec<f32>>),
}

/// Read-only, strided access to pixel data as a logical single-channel
/// `f32` grid. Channel selection is resolved once at construction.
#[derive(Clone)]
pub struct ImageView<'a> {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Pixels<'a>,
    downsample: u32,
}

impl<'a> ImageView<'a> {
    pub fn new(stat: &ImageStat, buffer: &'a [u8], channel: ColorChannel) -> Result<Self, SolveError> {
        if buffer.len() < stat.expected_len() {
            return Err(SolveError::Precondition(format!(
                "image buffer holds {} bytes, expected {}",
                buffer.len(),
                stat.expected_len()
            )));
        }
        if stat.channels != 1 && stat.channels != 3 {
            return Err(SolveError::Precondition(format!(
                "unsupported channel count {}",
                stat.channels
            )));
        }

        let mono = Self {
            width: stat.width,
            height: stat.height,
            format: stat.format,
            pixels: Pixels::Raw { buffer, plane: 0 },
            downsample: 1,
        };

        if stat.channels == 1 {
            return Ok(mono);
        }
        match channel {
            ColorChannel::Red => Ok(mono),
            ColorChannel::Green => Ok(Self {
                pixels: Pixels::Raw { buffer, plane: stat.samples_per_channel() },
                ..mono
            }),
            ColorChannel::Blue => Ok(Self {
                pixels: Pixels::Raw { buffer, plane: 2 * stat.samples_per_channel() },
                ..mono
            }),
            ColorChannel::AverageRgb | ColorChannel::IntegratedRgb => {
                mono.merge_rgb(stat, buffer, channel)
            }
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Cumulative downsample factor relative to the original buffer.
    pub fn downsample_factor(&self) -> u32 {
        self.downsample
    }

    fn sample(&self, index: usize) -> f32 {
        match &self.pixels {
            Pixels::Derived(data) => data[index],
            Pixels::Raw { buffer, plane } => {
                let i = (plane + index) * self.format.bytes_per_sample();
                let b = *buffer;
                match self.format {
                    PixelFormat::U8 => b[i] as f32,
                    PixelFormat::I16 => {
                        i16::from_ne_bytes([b[i], b[i + 1]]) as f32
                    }
                    PixelFormat::U16 => {
                        u16::from_ne_bytes([b[i], b[i + 1]]) as f32
                    }
                    PixelFormat::I32 => {
                        i32::from_ne_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as f32
                    }
                    PixelFormat::U32 => {
                        u32::from_ne_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]) as f32
                    }
                    PixelFormat::F32 => {
                        f32::from_ne_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]])
                    }
                    PixelFormat::F64 => f64::from_ne_bytes([
                        b[i],
                        b[i + 1],
                        b[i + 2],
                        b[i + 3],
                        b[i + 4],
                        b[i + 5],
                        b[i + 6],
                        b[i + 7],
                    ]) as f32,
                }
            }
        }
    }

    /// Reads one pixel. Out-of-range coordinates are a caller error.
    pub fn read_pixel(&self, x: u32, y: u32) -> f32 {
        debug_assert!(x < self.width && y < self.height);
        self.sample(y as usize * self.width as usize + x as usize)
    }

    /// Copies a `w x h` window into a freshly allocated `f32` region.
    pub fn read_region(&self, x: u32, y: u32, w: u32, h: u32) -> Array2<f32> {
        debug_assert!(x + w <= self.width && y + h <= self.height);
        let mut out = Vec::with_capacity(w as usize * h as usize);
        for row in y..y + h {
            let base = row as usize * self.width as usize;
            for col in x..x + w {
                out.push(self.sample(base + col as usize));
            }
        }
        Array2::from_shape_vec((h as usize, w as usize), out)
            .expect("region buffer matches requested shape")
    }

    fn merge_rgb(
        &self,
        stat: &ImageStat,
        buffer: &'a [u8],
        channel: ColorChannel,
    ) -> Result<Self, SolveError> {
        if stat.channels != 3 {
            return Err(SolveError::Precondition(
                "channel merge requires a 3-channel image".into(),
            ));
        }
        let npix = stat.samples_per_channel();
        let plane_view = |plane: usize| Self {
            width: stat.width,
            height: stat.height,
            format: stat.format,
            pixels: Pixels::Raw { buffer, plane },
            downsample: 1,
        };
        let (r, g, b) = (plane_view(0), plane_view(npix), plane_view(2 * npix));

        let mut merged = Vec::with_capacity(npix);
        for i in 0..npix {
            let total = r.sample(i) + g.sample(i) + b.sample(i);
            merged.push(match channel {
                ColorChannel::AverageRgb => total / 3.0,
                _ => total,
            });
        }

        Ok(Self {
            width: stat.width,
            height: stat.height,
            format: stat.format,
            pixels: Pixels::Derived(Arc::new(merged)),
            downsample: 1,
        })
    }

    /// Mean-pools non-overlapping `d x d` tiles into a new view. Partial
    /// tiles at the right/bottom edges average over their actual pixels.
    /// The original view remains valid; `downsampled(1)` is the identity.
    pub fn downsampled(&self, d: u32) -> ImageView<'a> {
        if d <= 1 {
            return self.clone();
        }
        let new_w = self.width.div_ceil(d);
        let new_h = self.height.div_ceil(d);
        let mut data = Vec::with_capacity(new_w as usize * new_h as usize);

        for ny in 0..new_h {
            for nx in 0..new_w {
                let x0 = nx * d;
                let y0 = ny * d;
                let x1 = (x0 + d).min(self.width);
                let y1 = (y0 + d).min(self.height);

                let mut sum = 0.0f64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += self.read_pixel(x, y) as f64;
                    }
                }
                let count = ((x1 - x0) * (y1 - y0)) as f64;
                data.push((sum / count) as f32);
            }
        }

        ImageView {
            width: new_w,
            height: new_h,
            format: self.format,
            pixels: Pixels::Derived(Arc::new(data)),
            downsample: self.downsample * d,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono_u16(width: u32, height: u32, values: &[u16]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(values.len() * 2);
        for v in values {
            buf.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(values.len(), (width * height) as usize);
        buf
    }

    #[test]
    fn test_read_pixel_u16() {
        let stat = ImageStat::new(3, 2, 1, PixelFormat::U16);
        let buf = mono_u16(3, 2, &[1, 2, 3, 4, 5, 6]);
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        assert_eq!(view.read_pixel(0, 0), 1.0);
        assert_eq!(view.read_pixel(2, 1), 6.0);
    }

    #[test]
    fn test_read_pixel_f64() {
        let stat = ImageStat::new(2, 1, 1, PixelFormat::F64);
        let mut buf = Vec::new();
        buf.extend_from_slice(&1.5f64.to_ne_bytes());
        buf.extend_from_slice(&(-2.25f64).to_ne_bytes());
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        assert_eq!(view.read_pixel(0, 0), 1.5);
        assert_eq!(view.read_pixel(1, 0), -2.25);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let stat = ImageStat::new(4, 4, 1, PixelFormat::U16);
        let buf = vec![0u8; 10];
        assert!(ImageView::new(&stat, &buf, ColorChannel::Red).is_err());
    }

    #[test]
    fn test_channel_plane_selection() {
        let stat = ImageStat::new(2, 1, 3, PixelFormat::U8);
        // Planes: R = [10, 20], G = [30, 40], B = [50, 60]
        let buf = vec![10u8, 20, 30, 40, 50, 60];
        let g = ImageView::new(&stat, &buf, ColorChannel::Green).unwrap();
        assert_eq!(g.read_pixel(0, 0), 30.0);
        assert_eq!(g.read_pixel(1, 0), 40.0);
        let b = ImageView::new(&stat, &buf, ColorChannel::Blue).unwrap();
        assert_eq!(b.read_pixel(1, 0), 60.0);
    }

    #[test]
    fn test_merge_rgb_average_and_integrated() {
        let stat = ImageStat::new(2, 1, 3, PixelFormat::U8);
        let buf = vec![10u8, 20, 30, 40, 50, 60];
        let avg = ImageView::new(&stat, &buf, ColorChannel::AverageRgb).unwrap();
        assert!((avg.read_pixel(0, 0) - 30.0).abs() < 1e-6);
        let sum = ImageView::new(&stat, &buf, ColorChannel::IntegratedRgb).unwrap();
        assert!((sum.read_pixel(1, 0) - 120.0).abs() < 1e-6);
    }

    #[test]
    fn test_downsample_identity() {
        let stat = ImageStat::new(4, 4, 1, PixelFormat::U16);
        let values: Vec<u16> = (0..16).collect();
        let buf = mono_u16(4, 4, &values);
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        let same = view.downsampled(1);
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(view.read_pixel(x, y), same.read_pixel(x, y));
            }
        }
    }

    #[test]
    fn test_downsample_2x_means() {
        let stat = ImageStat::new(4, 4, 1, PixelFormat::U16);
        let values: Vec<u16> = (1..=16).collect();
        let buf = mono_u16(4, 4, &values);
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        let half = view.downsampled(2);
        assert_eq!(half.width(), 2);
        assert_eq!(half.height(), 2);
        // Top-left tile: 1, 2, 5, 6 -> 3.5
        assert!((half.read_pixel(0, 0) - 3.5).abs() < 1e-6);
        // Bottom-right tile: 11, 12, 15, 16 -> 13.5
        assert!((half.read_pixel(1, 1) - 13.5).abs() < 1e-6);
        assert_eq!(half.downsample_factor(), 2);
    }

    #[test]
    fn test_downsample_constant_stays_constant() {
        let stat = ImageStat::new(5, 5, 1, PixelFormat::U16);
        let buf = mono_u16(5, 5, &[7u16; 25]);
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        let ds = view.downsampled(2);
        assert_eq!(ds.width(), 3);
        assert_eq!(ds.height(), 3);
        for y in 0..3 {
            for x in 0..3 {
                assert!((ds.read_pixel(x, y) - 7.0).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_read_region_matches_pixels() {
        let stat = ImageStat::new(4, 3, 1, PixelFormat::U16);
        let values: Vec<u16> = (0..12).collect();
        let buf = mono_u16(4, 3, &values);
        let view = ImageView::new(&stat, &buf, ColorChannel::Red).unwrap();
        let region = view.read_region(1, 1, 2, 2);
        assert_eq!(region[[0, 0]], 5.0);
        assert_eq!(region[[1, 1]], 10.0);
    }

    #[test]
    fn test_subframe_clamp() {
        let f = SubFrame { x: 100, y: 100, width: 300, height: 300 };
        let c = f.clamped(256, 256);
        assert_eq!(c.width, 156);
        assert_eq!(c.height, 156);
    }
}
