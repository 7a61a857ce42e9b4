use ndarray::Array2;

use crate::domain::stats::sigma_clipped_stats;
use crate::model::Background;

/// Default estimation tile size in pixels.
pub const TILE: usize = 64;

const CLIP_KAPPA: f32 = 3.0;
const CLIP_ITERATIONS: usize = 2;

/// Tile-mesh background model for one region. Only the two global scalars
/// outlive the subtraction step; the mesh itself is working state.
#[derive(Debug, Clone)]
pub struct BackgroundMesh {
    tile_w: usize,
    tile_h: usize,
    cols: usize,
    rows: usize,
    mean_mesh: Array2<f32>,
    pub global: f32,
    pub global_rms: f32,
}

/// Estimates the background of `region` on a grid of `tile_w x tile_h`
/// cells, each reduced to a sigma-clipped median and sigma.
pub fn estimate(region: &Array2<f32>, tile_w: usize, tile_h: usize) -> BackgroundMesh {
    let (h, w) = region.dim();
    let tile_w = tile_w.max(1);
    let tile_h = tile_h.max(1);
    let cols = w.div_ceil(tile_w).max(1);
    let rows = h.div_ceil(tile_h).max(1);

    let mut mean_mesh = Array2::<f32>::zeros((rows, cols));
    let mut sum_mean = 0.0f64;
    let mut sum_var = 0.0f64;

    for ty in 0..rows {
        for tx in 0..cols {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut vals: Vec<f32> = Vec::with_capacity((x1 - x0) * (y1 - y0));
            for y in y0..y1 {
                for x in x0..x1 {
                    let v = region[[y, x]];
                    if v.is_finite() {
                        vals.push(v);
                    }
                }
            }

            let (med, sig) = sigma_clipped_stats(&mut vals, CLIP_KAPPA, CLIP_ITERATIONS);
            mean_mesh[[ty, tx]] = med as f32;
            sum_mean += med;
            sum_var += sig * sig;
        }
    }

    let ntiles = (rows * cols) as f64;
    BackgroundMesh {
        tile_w,
        tile_h,
        cols,
        rows,
        mean_mesh,
        global: (sum_mean / ntiles) as f32,
        global_rms: (sum_var / ntiles).sqrt() as f32,
    }
}

fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

impl BackgroundMesh {
    fn mesh_at(&self, tx: isize, ty: isize) -> f32 {
        let tx = tx.clamp(0, self.cols as isize - 1) as usize;
        let ty = ty.clamp(0, self.rows as isize - 1) as usize;
        self.mean_mesh[[ty, tx]]
    }

    /// Bicubic interpolation of the tile means at a pixel position.
    pub fn value_at(&self, x: f64, y: f64) -> f32 {
        if self.rows == 1 && self.cols == 1 {
            return self.mean_mesh[[0, 0]];
        }

        // Fractional tile coordinates, measured from tile centers.
        let gx = (x + 0.5) / self.tile_w as f64 - 0.5;
        let gy = (y + 0.5) / self.tile_h as f64 - 0.5;
        let ix = gx.floor() as isize;
        let iy = gy.floor() as isize;
        let fx = (gx - ix as f64) as f32;
        let fy = (gy - iy as f64) as f32;

        let mut col_values = [0.0f32; 4];
        for (j, cv) in col_values.iter_mut().enumerate() {
            let ty = iy - 1 + j as isize;
            *cv = catmull_rom(
                self.mesh_at(ix - 1, ty),
                self.mesh_at(ix, ty),
                self.mesh_at(ix + 1, ty),
                self.mesh_at(ix + 2, ty),
                fx,
            );
        }
        catmull_rom(col_values[0], col_values[1], col_values[2], col_values[3], fy)
    }

    /// Subtracts the interpolated background from the region in place.
    pub fn subtract_from(&self, region: &mut Array2<f32>) {
        let (h, w) = region.dim();
        for y in 0..h {
            for x in 0..w {
                region[[y, x]] -= self.value_at(x as f64, y as f64);
            }
        }
    }

    pub fn report(&self, num_stars_detected: usize) -> Background {
        Background {
            bw: self.tile_w,
            bh: self.tile_h,
            global: self.global,
            global_rms: self.global_rms,
            num_stars_detected,
        }
    }
}
