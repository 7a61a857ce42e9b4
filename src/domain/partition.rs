use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use rayon::prelude::*;

use crate::domain::convolution::ConvFilter;
use crate::domain::extract::{extract_region, PartitionOutput};
use crate::domain::filters::apply_star_filters;
use crate::model::{Background, ImageView, Parameters, Star, SubFrame};

/// Target partition edge length in pixels.
pub const PARTITION_SIZE: u32 = 200;

/// Stars and aggregated background from a full extraction run.
#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub stars: Vec<Star>,
    pub background: Background,
}

/// Margin added around each partition so stars straddling a boundary are
/// fully contained in one processing window. Half the largest expected
/// star, bounded to [20, 50].
pub fn margin_for(max_size: f64) -> u32 {
    ((max_size / 2.0) as u32).clamp(20, 50)
}

#[derive(Debug, Clone, Copy)]
struct PartitionRect {
    start_x: u32,
    start_y: u32,
    width: u32,
    height: u32,
    // Margin-less rectangle in image coordinates, inclusive.
    inner_x1: u32,
    inner_y1: u32,
    inner_x2: u32,
    inner_y2: u32,
}

/// Grows `[x1, x2] x [y1, y2]` (inclusive) by `margin` on all sides,
/// clipped to the image bounds.
fn with_margin(
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
    image_w: u32,
    image_h: u32,
    margin: u32,
) -> PartitionRect {
    let start_x = x1.saturating_sub(margin);
    let start_y = y1.saturating_sub(margin);
    let end_x = (x2 + margin).min(image_w - 1);
    let end_y = (y2 + margin).min(image_h - 1);
    PartitionRect {
        start_x,
        start_y,
        width: end_x - start_x + 1,
        height: end_y - start_y + 1,
        inner_x1: x1,
        inner_y1: y1,
        inner_x2: x2,
        inner_y2: y2,
    }
}

fn partition_grid(
    frame: SubFrame,
    image_w: u32,
    image_h: u32,
    threads: u32,
    margin: u32,
    enabled: bool,
) -> Vec<PartitionRect> {
    let SubFrame { x, y, width: w, height: h } = frame;

    if !enabled || w <= PARTITION_SIZE || h <= PARTITION_SIZE || threads % 2 != 0 {
        return vec![with_margin(x, y, x + w - 1, y + h - 1, image_w, image_h, margin)];
    }

    let mut pw = PARTITION_SIZE;
    let mut ph = PARTITION_SIZE;
    // Larger cells when the default grid would oversubscribe the pool.
    if (w * h) / (pw * ph) > threads {
        pw = (w / (threads / 2)).max(1);
        ph = (h / 2).max(1);
    }

    let hparts = w / pw;
    let vparts = h / ph;
    let hleft = w - pw * hparts;
    let vleft = h - ph * vparts;

    let mut rects = Vec::with_capacity((hparts * vparts) as usize);
    for i in 0..vparts {
        for j in 0..hparts {
            let extra_w = if j == hparts - 1 { hleft } else { 0 };
            let extra_h = if i == vparts - 1 { vleft } else { 0 };
            let x1 = x + j * pw;
            let y1 = y + i * ph;
            let x2 = x1 + pw + extra_w - 1;
            let y2 = y1 + ph + extra_h - 1;
            rects.push(with_margin(x1, y1, x2, y2, image_w, image_h, margin));
        }
    }
    rects
}

/// Extracts stars across margin-overlapped partitions processed by the
/// rayon pool, re-stitches the per-partition lists, and applies the star
/// filter chain. Failed partitions are logged and contribute nothing.
pub fn run_extraction(
    view: &ImageView<'_>,
    params: &Parameters,
    filter: &ConvFilter,
    want_hfr: bool,
    subframe: Option<SubFrame>,
    cancel: &AtomicBool,
) -> ExtractionResult {
    let image_w = view.width();
    let image_h = view.height();
    let frame = subframe
        .map(|f| f.clamped(image_w, image_h))
        .unwrap_or(SubFrame { x: 0, y: 0, width: image_w, height: image_h });
    if frame.width == 0 || frame.height == 0 {
        return ExtractionResult::default();
    }

    let threads = rayon::current_num_threads().max(1) as u32;
    let margin = margin_for(params.max_size);
    let rects = partition_grid(frame, image_w, image_h, threads, margin, params.partition);
    let keep = if rects.len() > 1 {
        (params.initial_keep / threads as usize).max(1)
    } else {
        params.initial_keep
    };
    debug!("extracting over {} partition(s), margin {}", rects.len(), margin);

    let outputs: Vec<(PartitionRect, Option<PartitionOutput>)> = rects
        .into_par_iter()
        .map(|rect| {
            // Cancellation takes effect before the next partition starts;
            // a running partition finishes on its own.
            if cancel.load(Ordering::Relaxed) {
                return (rect, None);
            }
            let region = view.read_region(rect.start_x, rect.start_y, rect.width, rect.height);
            match extract_region(region, filter, params, keep, want_hfr) {
                Ok(out) => (rect, Some(out)),
                Err(e) => {
                    warn!("partition at ({}, {}) failed: {} (status {})",
                        rect.start_x, rect.start_y, e, e.code());
                    (rect, None)
                }
            }
        })
        .collect();

    let mut stars: Vec<Star> = Vec::new();
    let mut reports: Vec<Background> = Vec::new();
    for (rect, output) in outputs {
        let Some(out) = output else { continue };
        reports.push(out.background);
        for mut star in out.stars {
            // Margin detections belong to the neighboring partition.
            let gx = rect.start_x as f64 + star.x as f64 - 1.0;
            let gy = rect.start_y as f64 + star.y as f64 - 1.0;
            if gx < rect.inner_x1 as f64
                || gx >= rect.inner_x2 as f64 + 1.0
                || gy < rect.inner_y1 as f64
                || gy >= rect.inner_y2 as f64 + 1.0
            {
                continue;
            }
            star.x += rect.start_x as f32;
            star.y += rect.start_y as f32;
            stars.push(star);
        }
    }

    let mut background = Background::default();
    if !reports.is_empty() {
        background.bw = reports[0].bw;
        background.bh = reports[0].bh;
        background.global =
            reports.iter().map(|b| b.global).sum::<f32>() / reports.len() as f32;
        background.global_rms = (reports.iter().map(|b| b.global_rms * b.global_rms).sum::<f32>()
            / reports.len() as f32)
            .sqrt();
        background.num_stars_detected = reports.iter().map(|b| b.num_stars_detected).sum();
    }

    apply_star_filters(&mut stars, params, view.format());

    ExtractionResult { stars, background }
}
