use crate::domain::labeling::Component;
use crate::error::ExtractError;

/// Upper bound on sub-objects produced from one component.
const MAX_SUB_OBJECTS: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    level: usize,
    /// Indices into the parent component's pixel list.
    members: Vec<usize>,
    flux: f64,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// Splits a component into separate objects at `nthresh` logarithmically
/// spaced sub-thresholds between `tau` and the component peak. A branch is
/// promoted when its flux above the branching threshold reaches
/// `contrast` times the component's total flux and at least one sibling
/// qualifies too. Pixels outside every promoted branch join the branch
/// with the nearest peak.
pub fn deblend(
    comp: Component,
    tau: f32,
    nthresh: u32,
    contrast: f64,
) -> Result<Vec<Component>, ExtractError> {
    let peak = comp.peak_filtered();
    if nthresh < 2 || contrast >= 1.0 || tau <= 0.0 || peak <= tau {
        return Ok(vec![comp]);
    }

    let n = comp.pixels.len();
    let total_flux: f64 = comp.pixels.iter().map(|p| p.filtered as f64).sum();
    if total_flux <= 0.0 {
        return Ok(vec![comp]);
    }

    // Local grid over the bounding box for neighbor lookups.
    let (x0, y0, x1, y1) = comp.bounds();
    let gw = (x1 - x0 + 1) as usize;
    let gh = (y1 - y0 + 1) as usize;
    let mut grid = vec![usize::MAX; gw * gh];
    for (i, p) in comp.pixels.iter().enumerate() {
        grid[(p.y - y0) as usize * gw + (p.x - x0) as usize] = i;
    }

    let ratio = (peak / tau) as f64;
    let mut nodes: Vec<Node> = vec![Node {
        level: 0,
        members: (0..n).collect(),
        flux: total_flux,
        parent: None,
        children: Vec::new(),
    }];

    // Pixel -> node index at the previous level.
    let mut prev_assignment = vec![0usize; n];

    for level in 1..nthresh as usize {
        let thresh = tau as f64 * ratio.powf(level as f64 / nthresh as f64);
        let mut assignment = vec![usize::MAX; n];

        for start in 0..n {
            if assignment[start] != usize::MAX
                || (comp.pixels[start].filtered as f64) <= thresh
            {
                continue;
            }

            // Flood-fill one sub-component above this threshold.
            let node_idx = nodes.len();
            let mut members = Vec::new();
            let mut stack = vec![start];
            assignment[start] = node_idx;
            while let Some(i) = stack.pop() {
                members.push(i);
                let px = (comp.pixels[i].x - x0) as i64;
                let py = (comp.pixels[i].y - y0) as i64;
                for dy in -1..=1i64 {
                    for dx in -1..=1i64 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = px + dx;
                        let ny = py + dy;
                        if nx < 0 || ny < 0 || nx >= gw as i64 || ny >= gh as i64 {
                            continue;
                        }
                        let j = grid[ny as usize * gw + nx as usize];
                        if j == usize::MAX
                            || assignment[j] != usize::MAX
                            || (comp.pixels[j].filtered as f64) <= thresh
                        {
                            continue;
                        }
                        assignment[j] = node_idx;
                        stack.push(j);
                    }
                }
            }

            if nodes.len() >= MAX_SUB_OBJECTS * nthresh as usize {
                return Err(ExtractError::DeblendOverflow);
            }

            let flux = members.iter().map(|&i| comp.pixels[i].filtered as f64).sum();
            let parent = prev_assignment[members[0]];
            nodes.push(Node { level, members, flux, parent: Some(parent), children: Vec::new() });
            nodes[parent].children.push(node_idx);
        }

        for i in 0..n {
            if assignment[i] != usize::MAX {
                prev_assignment[i] = assignment[i];
            }
        }
    }

    // Walk the threshold tree, splitting wherever two or more branches
    // carry enough flux.
    let min_flux = contrast * total_flux;
    let mut seeds: Vec<usize> = Vec::new();
    let mut queue = vec![0usize];
    while let Some(idx) = queue.pop() {
        let strong: Vec<usize> = nodes[idx]
            .children
            .iter()
            .copied()
            .filter(|&c| nodes[c].flux >= min_flux)
            .collect();
        match strong.len() {
            0 => seeds.push(idx),
            1 => queue.push(strong[0]),
            _ => queue.extend(strong),
        }
        if seeds.len() + queue.len() > MAX_SUB_OBJECTS {
            return Err(ExtractError::DeblendOverflow);
        }
    }

    if seeds.len() <= 1 {
        return Ok(vec![comp]);
    }

    // Peak position per seed, for assigning the leftover pixels.
    let seed_peaks: Vec<(f64, f64)> = seeds
        .iter()
        .map(|&s| {
            let best = nodes[s]
                .members
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    comp.pixels[a]
                        .filtered
                        .partial_cmp(&comp.pixels[b].filtered)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("seed nodes are non-empty");
            (comp.pixels[best].x as f64, comp.pixels[best].y as f64)
        })
        .collect();

    let mut owner = vec![usize::MAX; n];
    for (si, &s) in seeds.iter().enumerate() {
        for &i in &nodes[s].members {
            owner[i] = si;
        }
    }
    for (i, o) in owner.iter_mut().enumerate() {
        if *o == usize::MAX {
            let px = comp.pixels[i].x as f64;
            let py = comp.pixels[i].y as f64;
            let mut best = 0;
            let mut best_d = f64::MAX;
            for (si, &(sx, sy)) in seed_peaks.iter().enumerate() {
                let d = (px - sx).powi(2) + (py - sy).powi(2);
                if d < best_d {
                    best_d = d;
                    best = si;
                }
            }
            *o = best;
        }
    }

    let mut objects: Vec<Component> = vec![
        Component { pixels: Vec::new(), truncated: comp.truncated };
        seeds.len()
    ];
    for (i, &o) in owner.iter().enumerate() {
        objects[o].pixels.push(comp.pixels[i]);
    }
    Ok(objects)
}
