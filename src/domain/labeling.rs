use ndarray::Array2;

use crate::error::ExtractError;

/// One pixel of a detected component, carrying both the raw
/// (background-subtracted) value used for photometry and the filtered
/// value used for detection and deblending.
#[derive(Debug, Clone, Copy)]
pub struct PixelRecord {
    pub x: u32,
    pub y: u32,
    pub raw: f32,
    pub filtered: f32,
}

/// An 8-connected group of above-threshold pixels.
#[derive(Debug, Clone, Default)]
pub struct Component {
    pub pixels: Vec<PixelRecord>,
    /// Set when the bounding box touches the region edge.
    pub truncated: bool,
}

impl Component {
    pub fn peak_filtered(&self) -> f32 {
        self.pixels.iter().map(|p| p.filtered).fold(f32::MIN, f32::max)
    }

    pub fn peak_raw(&self) -> f32 {
        self.pixels.iter().map(|p| p.raw).fold(f32::MIN, f32::max)
    }

    pub fn bounds(&self) -> (u32, u32, u32, u32) {
        let mut x0 = u32::MAX;
        let mut y0 = u32::MAX;
        let mut x1 = 0;
        let mut y1 = 0;
        for p in &self.pixels {
            x0 = x0.min(p.x);
            y0 = y0.min(p.y);
            x1 = x1.max(p.x);
            y1 = y1.max(p.y);
        }
        (x0, y0, x1, y1)
    }
}

// Union-find over scanline runs.
fn find(parents: &mut Vec<usize>, mut i: usize) -> usize {
    while parents[i] != i {
        parents[i] = parents[parents[i]];
        i = parents[i];
    }
    i
}

fn union(parents: &mut Vec<usize>, a: usize, b: usize) {
    let ra = find(parents, a);
    let rb = find(parents, b);
    if ra != rb {
        parents[rb.max(ra)] = rb.min(ra);
    }
}

/// Labels 8-connected groups of pixels whose filtered value exceeds `tau`
/// in a single scanline pass, merging runs that touch the previous row.
/// Components smaller than `minarea` are rejected. `pixel_budget` bounds
/// the total number of above-threshold pixels that may be recorded.
pub fn label_components(
    raw: &Array2<f32>,
    filtered: &Array2<f32>,
    tau: f32,
    minarea: usize,
    pixel_budget: usize,
) -> Result<Vec<Component>, ExtractError> {
    let (h, w) = raw.dim();

    #[derive(Clone, Copy)]
    struct Run {
        x0: usize,
        x1: usize, // inclusive
        row: usize,
        label: usize,
    }

    let mut parents: Vec<usize> = Vec::new();
    let mut runs: Vec<Run> = Vec::new();
    let mut prev_row: Vec<usize> = Vec::new(); // indices into `runs`
    let mut total_pixels = 0usize;

    for y in 0..h {
        let mut this_row: Vec<usize> = Vec::new();
        let mut x = 0usize;
        while x < w {
            if filtered[[y, x]] <= tau {
                x += 1;
                continue;
            }
            let x0 = x;
            while x < w && filtered[[y, x]] > tau {
                x += 1;
            }
            let x1 = x - 1;

            total_pixels += x1 - x0 + 1;
            if total_pixels > pixel_budget {
                return Err(ExtractError::PixelStackFull);
            }

            let label = parents.len();
            parents.push(label);
            let run_idx = runs.len();
            runs.push(Run { x0, x1, row: y, label });
            this_row.push(run_idx);

            // 8-connectivity: a run touches a previous-row run when their
            // spans overlap after widening by one pixel.
            for &pi in &prev_row {
                let p = runs[pi];
                if p.x0 <= x1 + 1 && x0 <= p.x1 + 1 {
                    union(&mut parents, p.label, label);
                }
            }
        }
        prev_row = this_row;
    }

    // Gather runs into components keyed by their root label.
    let mut root_of = vec![usize::MAX; parents.len()];
    let mut components: Vec<Component> = Vec::new();
    for run in &runs {
        let root = find(&mut parents, run.label);
        let slot = if root_of[root] == usize::MAX {
            root_of[root] = components.len();
            components.push(Component::default());
            components.len() - 1
        } else {
            root_of[root]
        };
        let comp = &mut components[slot];
        for x in run.x0..=run.x1 {
            comp.pixels.push(PixelRecord {
                x: x as u32,
                y: run.row as u32,
                raw: raw[[run.row, x]],
                filtered: filtered[[run.row, x]],
            });
            if x == 0 || x == w - 1 || run.row == 0 || run.row == h - 1 {
                comp.truncated = true;
            }
        }
    }

    components.retain(|c| c.pixels.len() >= minarea);
    Ok(components)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label_simple(region: &Array2<f32>, tau: f32, minarea: usize) -> Vec<Component> {
        label_components(region, region, tau, minarea, region.len()).unwrap()
    }

    fn blob(region: &mut Array2<f32>, cx: usize, cy: usize, r: usize, value: f32) {
        for y in cy.saturating_sub(r)..=(cy + r) {
            for x in cx.saturating_sub(r)..=(cx + r) {
                if y < region.dim().0 && x < region.dim().1 {
                    region[[y, x]] = value;
                }
            }
        }
    }

    #[test]
    fn test_single_blob() {
        let mut region = Array2::<f32>::zeros((32, 32));
        blob(&mut region, 16, 16, 2, 10.0);
        let comps = label_simple(&region, 1.0, 1);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].pixels.len(), 25);
        assert!(!comps[0].truncated);
    }

    #[test]
    fn test_two_separate_blobs() {
        let mut region = Array2::<f32>::zeros((32, 32));
        blob(&mut region, 8, 8, 1, 10.0);
        blob(&mut region, 24, 24, 1, 10.0);
        let comps = label_simple(&region, 1.0, 1);
        assert_eq!(comps.len(), 2);
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let mut region = Array2::<f32>::zeros((8, 8));
        region[[2, 2]] = 5.0;
        region[[3, 3]] = 5.0;
        region[[4, 4]] = 5.0;
        let comps = label_simple(&region, 1.0, 1);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].pixels.len(), 3);
    }

    #[test]
    fn test_u_shape_merges_into_one() {
        // Two descending arms joined at the bottom; the union step must
        // merge the separate upper labels.
        let mut region = Array2::<f32>::zeros((8, 8));
        for y in 1..5 {
            region[[y, 1]] = 5.0;
            region[[y, 5]] = 5.0;
        }
        for x in 1..=5 {
            region[[5, x]] = 5.0;
        }
        let comps = label_simple(&region, 1.0, 1);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].pixels.len(), 13);
    }

    #[test]
    fn test_minarea_rejection() {
        let mut region = Array2::<f32>::zeros((16, 16));
        region[[4, 4]] = 10.0;
        blob(&mut region, 10, 10, 1, 10.0);
        let comps = label_simple(&region, 1.0, 5);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].pixels.len(), 9);
    }

    #[test]
    fn test_truncation_flag_at_edges() {
        let mut region = Array2::<f32>::zeros((16, 16));
        blob(&mut region, 0, 8, 1, 10.0);
        let comps = label_simple(&region, 1.0, 1);
        assert_eq!(comps.len(), 1);
        assert!(comps[0].truncated);
    }

    #[test]
    fn test_pixel_budget_overflow() {
        let region = Array2::<f32>::ones((16, 16));
        let err = label_components(&region, &region, 0.5, 1, 100).unwrap_err();
        assert_eq!(err, ExtractError::PixelStackFull);
    }
}
