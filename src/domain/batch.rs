use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::domain::solver::{ExtractionMode, IndexSearch};
use crate::engine::{Completion, Session};
use crate::model::{Background, ColorChannel, ImageStat, Parameters, Solution, Star};

/// One image of a batch run.
pub struct BatchInput<'a> {
    pub name: String,
    pub stat: ImageStat,
    pub buffer: &'a [u8],
    pub channel: ColorChannel,
}

/// Per-image outcome of a batch run.
#[derive(Debug, Clone)]
pub enum BatchItem {
    Extracted {
        name: String,
        stars: Vec<Star>,
        background: Background,
        elapsed_ms: u64,
    },
    Solved {
        name: String,
        solution: Solution,
        num_stars: usize,
        elapsed_ms: u64,
    },
    Failed {
        name: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
    pub results: Vec<BatchItem>,
}

fn summarize(results: Vec<BatchItem>, start: Instant) -> BatchReport {
    let failed = results.iter().filter(|r| matches!(r, BatchItem::Failed { .. })).count();
    BatchReport {
        total: results.len(),
        succeeded: results.len() - failed,
        failed,
        elapsed_ms: start.elapsed().as_millis() as u64,
        results,
    }
}

/// Extracts stars from every input. Images are processed by the rayon
/// pool; a failure on one image never stops the rest.
pub fn extract_batch(
    inputs: &[BatchInput<'_>],
    params: &Parameters,
    mode: ExtractionMode,
) -> BatchReport {
    let start = Instant::now();
    let results: Vec<BatchItem> = inputs
        .par_iter()
        .map(|input| {
            let item_start = Instant::now();
            let mut session = match Session::new(&input.stat, input.buffer, input.channel) {
                Ok(s) => s,
                Err(e) => {
                    return BatchItem::Failed { name: input.name.clone(), reason: e.to_string() }
                }
            };
            session.set_parameters(params.clone());
            match session.extract(mode, None) {
                Completion::ExtractReady { stars, background } => BatchItem::Extracted {
                    name: input.name.clone(),
                    stars,
                    background,
                    elapsed_ms: item_start.elapsed().as_millis() as u64,
                },
                Completion::Failed { reason } => {
                    BatchItem::Failed { name: input.name.clone(), reason }
                }
                Completion::SolveReady { .. } => unreachable!("extract never solves"),
            }
        })
        .collect();
    summarize(results, start)
}

/// Solves every input in turn. Each solve already saturates the machine
/// with extraction partitions and child solvers, so images run one at a
/// time rather than stacked on top of each other.
pub fn solve_batch(
    inputs: &[BatchInput<'_>],
    params: &Parameters,
    kernel: Arc<dyn IndexSearch>,
    index_files: &[PathBuf],
) -> BatchReport {
    let start = Instant::now();
    let mut results = Vec::with_capacity(inputs.len());
    for input in inputs {
        let item_start = Instant::now();
        let mut session = match Session::new(&input.stat, input.buffer, input.channel) {
            Ok(s) => s,
            Err(e) => {
                results.push(BatchItem::Failed { name: input.name.clone(), reason: e.to_string() });
                continue;
            }
        };
        session.set_parameters(params.clone());
        session.set_index_files(index_files.to_vec());
        results.push(match session.solve(Arc::clone(&kernel)) {
            Completion::SolveReady { solution, stars, .. } => BatchItem::Solved {
                name: input.name.clone(),
                solution,
                num_stars: stars.len(),
                elapsed_ms: item_start.elapsed().as_millis() as u64,
            },
            Completion::Failed { reason } => {
                BatchItem::Failed { name: input.name.clone(), reason }
            }
            Completion::ExtractReady { .. } => unreachable!("solve never stops at extraction"),
        });
    }
    summarize(results, start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::solver::{SearchControl, SearchHit, SearchJob};
    use crate::domain::wcs::WcsSolution;
    use crate::error::SolveError;
    use crate::model::{Parity, PixelFormat, Profile};

    fn synth_buffer(w: u32, h: u32, stars: &[(f64, f64, f64, f64)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity((w * h) as usize * 2);
        for y in 0..h {
            for x in 0..w {
                let mut v = 100.0f64;
                for &(cx, cy, sigma, peak) in stars {
                    let d2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
                    if d2 < (8.0 * sigma).powi(2) {
                        v += peak * (-d2 / (2.0 * sigma * sigma)).exp();
                    }
                }
                v += ((x * 7 + y * 13) % 17) as f64 * 0.3;
                buf.extend_from_slice(&(v as u16).to_ne_bytes());
            }
        }
        buf
    }

    fn test_params() -> Parameters {
        let mut p = Parameters::profile(Profile::AllStars);
        p.minarea = 8;
        p.auto_downsample = false;
        p.partition = false;
        p
    }

    struct AlwaysSolves;
    impl IndexSearch for AlwaysSolves {
        fn search(
            &self,
            job: &SearchJob,
            _ctl: &SearchControl,
        ) -> Result<Option<SearchHit>, SolveError> {
            let scale_deg = 3.0 / 3600.0;
            Ok(Some(SearchHit {
                solution: Solution {
                    field_width: job.field.width as f64 * 3.0 / 60.0,
                    field_height: job.field.height as f64 * 3.0 / 60.0,
                    ra: 120.0,
                    dec: 30.0,
                    orientation: 0.0,
                    pixscale: 3.0,
                    parity: Parity::Positive,
                    ra_error: 0.0,
                    dec_error: 0.0,
                },
                wcs: WcsSolution::new(
                    (job.field.width as f64 / 2.0, job.field.height as f64 / 2.0),
                    (120.0, 30.0),
                    [[-scale_deg, 0.0], [0.0, scale_deg]],
                    1,
                ),
                index_id: 4207,
                healpix: 3,
                matched_stars: Vec::new(),
                log_odds: 21.0,
            }))
        }
    }

    #[test]
    fn test_extract_batch_mixes_success_and_failure() {
        let good = synth_buffer(256, 256, &[(128.0, 128.0, 2.0, 18000.0)]);
        let short = vec![0u8; 16];
        let inputs = vec![
            BatchInput {
                name: "good".into(),
                stat: ImageStat::new(256, 256, 1, PixelFormat::U16),
                buffer: &good,
                channel: ColorChannel::Red,
            },
            BatchInput {
                name: "truncated".into(),
                stat: ImageStat::new(256, 256, 1, PixelFormat::U16),
                buffer: &short,
                channel: ColorChannel::Red,
            },
        ];

        let report = extract_batch(&inputs, &test_params(), ExtractionMode::Standard);
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let extracted = report
            .results
            .iter()
            .find_map(|r| match r {
                BatchItem::Extracted { name, stars, .. } => Some((name, stars.len())),
                _ => None,
            })
            .unwrap();
        assert_eq!(extracted.0, "good");
        assert_eq!(extracted.1, 1);
    }

    #[test]
    fn test_solve_batch_reports_solutions() {
        let a = synth_buffer(256, 256, &[(80.0, 90.0, 2.0, 18000.0), (180.0, 60.0, 2.0, 15000.0)]);
        let b = synth_buffer(256, 256, &[(128.0, 128.0, 2.0, 18000.0)]);
        let inputs = vec![
            BatchInput {
                name: "a".into(),
                stat: ImageStat::new(256, 256, 1, PixelFormat::U16),
                buffer: &a,
                channel: ColorChannel::Red,
            },
            BatchInput {
                name: "b".into(),
                stat: ImageStat::new(256, 256, 1, PixelFormat::U16),
                buffer: &b,
                channel: ColorChannel::Red,
            },
        ];

        let report = solve_batch(&inputs, &test_params(), Arc::new(AlwaysSolves), &[]);
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 2);
        for item in &report.results {
            match item {
                BatchItem::Solved { solution, num_stars, .. } => {
                    assert!((solution.ra - 120.0).abs() < 1e-9);
                    assert!(*num_stars >= 1);
                }
                other => panic!("expected Solved, got {:?}", other),
            }
        }
    }
}
