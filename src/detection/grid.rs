//! Orders unstructured corner candidates into a chessboard lattice.
//!
//! Growth starts at a seed near the centroid of the candidates. The two lattice
//! directions are taken from the seed's nearest non-collinear neighbours, and
//! the grid is then grown breadth-first: each accepted node predicts its four
//! neighbours from lattice vectors measured locally, so moderate perspective
//! and lens distortion are tolerated.

use crate::geometry::PatternSize;
use log::trace;
use nalgebra::{Point2, Vector2};
use std::collections::{HashMap, VecDeque};

/// Search radius around a predicted node, relative to the lattice step.
const STEP_TOLERANCE: f64 = 0.35;
/// Seeds tried before giving up.
const MAX_SEEDS: usize = 5;
/// Neighbours inspected when picking the second lattice direction.
const AXIS_CANDIDATES: usize = 8;
/// Largest |cos| between the two initial lattice directions.
const MAX_AXIS_COSINE: f64 = 0.5;

type Cell = (i32, i32);

struct Lattice {
    cells: HashMap<Cell, usize>,
    min: Cell,
    max: Cell,
}

impl Lattice {
    fn dims(&self) -> (usize, usize) {
        (
            (self.max.0 - self.min.0 + 1) as usize,
            (self.max.1 - self.min.1 + 1) as usize,
        )
    }

    fn get(&self, i: usize, j: usize) -> Option<usize> {
        self.cells
            .get(&(self.min.0 + i as i32, self.min.1 + j as i32))
            .copied()
    }

    /// Mean step between neighbouring nodes along `(di, dj)`.
    fn mean_step(&self, points: &[Point2<f64>], di: i32, dj: i32) -> Vector2<f64> {
        let mut sum = Vector2::zeros();
        let mut count = 0usize;
        for (&(i, j), &idx) in &self.cells {
            if let Some(&next) = self.cells.get(&(i + di, j + dj)) {
                sum += points[next] - points[idx];
                count += 1;
            }
        }
        if count > 0 {
            sum / count as f64
        } else {
            sum
        }
    }
}

/// Returns the `corners_x * corners_y` candidates in canonical row-major order,
/// or a human-readable reason why no lattice of that size was found.
pub fn order_corners(
    points: &[Point2<f64>],
    size: PatternSize,
) -> Result<Vec<Point2<f64>>, String> {
    let expected = size.num_corners();
    if points.len() < expected {
        return Err(format!(
            "found {} corner candidates, the pattern has {expected}",
            points.len()
        ));
    }

    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p.coords) / n;
    let mut seeds: Vec<usize> = (0..points.len()).collect();
    seeds.sort_by(|&a, &b| {
        let da = (points[a].coords - centroid).norm_squared();
        let db = (points[b].coords - centroid).norm_squared();
        da.total_cmp(&db)
    });

    let mut first_failure = None;
    for &seed in seeds.iter().take(MAX_SEEDS) {
        let attempt =
            grow(points, seed).and_then(|lattice| canonical_order(points, &lattice, size));
        match attempt {
            Ok(ordered) => return Ok(ordered),
            Err(reason) => {
                trace!("Grid growth from candidate {seed} failed: {reason}");
                first_failure.get_or_insert(reason);
            }
        }
    }
    Err(first_failure.unwrap_or_else(|| "no corner candidates".to_string()))
}

fn initial_axes(points: &[Point2<f64>], seed: usize) -> Option<(Vector2<f64>, Vector2<f64>)> {
    let origin = points[seed];
    let mut neighbours: Vec<Vector2<f64>> = points
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != seed)
        .map(|(_, p)| p - origin)
        .filter(|d| d.norm_squared() > f64::EPSILON)
        .collect();
    neighbours.sort_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()));

    let first = *neighbours.first()?;
    let second = neighbours
        .iter()
        .skip(1)
        .take(AXIS_CANDIDATES)
        .find(|d| (first.dot(*d) / (first.norm() * d.norm())).abs() < MAX_AXIS_COSINE)?;
    Some((first, *second))
}

fn nearest_unused(
    points: &[Point2<f64>],
    used: &[bool],
    predicted: &Point2<f64>,
    radius: f64,
) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .filter(|(idx, _)| !used[*idx])
        .map(|(idx, p)| (idx, (p - predicted).norm()))
        .filter(|(_, dist)| *dist <= radius)
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(idx, _)| idx)
}

fn grow(points: &[Point2<f64>], seed: usize) -> Result<Lattice, String> {
    let (u, v) = initial_axes(points, seed)
        .ok_or_else(|| "seed candidate has no non-collinear neighbours".to_string())?;

    let mut cells = HashMap::new();
    let mut used = vec![false; points.len()];
    let mut queue = VecDeque::new();
    cells.insert((0, 0), seed);
    used[seed] = true;
    queue.push_back(((0, 0), seed, u, v));

    while let Some(((i, j), idx, u, v)) = queue.pop_front() {
        let origin = points[idx];
        for (di, dj) in [(1, 0), (-1, 0), (0, 1), (0, -1)] {
            let cell = (i + di, j + dj);
            if cells.contains_key(&cell) {
                continue;
            }
            let step = u * di as f64 + v * dj as f64;
            let predicted = origin + step;
            let radius = STEP_TOLERANCE * step.norm();
            let Some(found) = nearest_unused(points, &used, &predicted, radius) else {
                continue;
            };
            used[found] = true;
            cells.insert(cell, found);
            let measured = points[found] - origin;
            let (next_u, next_v) = if di != 0 {
                (measured * di as f64, v)
            } else {
                (u, measured * dj as f64)
            };
            queue.push_back((cell, found, next_u, next_v));
        }
    }

    let min = cells
        .keys()
        .fold((i32::MAX, i32::MAX), |m, c| (m.0.min(c.0), m.1.min(c.1)));
    let max = cells
        .keys()
        .fold((i32::MIN, i32::MIN), |m, c| (m.0.max(c.0), m.1.max(c.1)));
    let lattice = Lattice { cells, min, max };

    let (w, h) = lattice.dims();
    if lattice.cells.len() != w * h {
        return Err(format!(
            "corner lattice is incomplete ({} nodes in a {w}x{h} grid)",
            lattice.cells.len()
        ));
    }
    Ok(lattice)
}

/// Columns run along the axis with `corners_x` nodes (the more horizontal axis
/// for square patterns), left to right; rows are oriented so the grid is
/// right-handed in image coordinates.
fn canonical_order(
    points: &[Point2<f64>],
    lattice: &Lattice,
    size: PatternSize,
) -> Result<Vec<Point2<f64>>, String> {
    let (cols, rows) = (size.corners_x, size.corners_y);
    let (w, h) = lattice.dims();
    let du = lattice.mean_step(points, 1, 0);
    let dv = lattice.mean_step(points, 0, 1);

    let transpose = if (w, h) != (cols, rows) && (w, h) != (rows, cols) {
        return Err(format!("found a {w}x{h} corner grid, expected {cols}x{rows}"));
    } else if cols == rows {
        let horizontalness = |d: &Vector2<f64>| d.x.abs() / d.norm().max(f64::EPSILON);
        horizontalness(&du) < horizontalness(&dv)
    } else {
        (w, h) != (cols, rows)
    };

    let (mut col_dir, row_dir) = if transpose { (dv, du) } else { (du, dv) };
    let flip_cols = col_dir.x < 0.0;
    if flip_cols {
        col_dir = -col_dir;
    }
    let flip_rows = col_dir.x * row_dir.y - col_dir.y * row_dir.x < 0.0;

    let mut ordered = Vec::with_capacity(cols * rows);
    for r in 0..rows {
        for c in 0..cols {
            let c_src = if flip_cols { cols - 1 - c } else { c };
            let r_src = if flip_rows { rows - 1 - r } else { r };
            let (i, j) = if transpose { (r_src, c_src) } else { (c_src, r_src) };
            let idx = lattice
                .get(i, j)
                .ok_or_else(|| format!("corner lattice is missing node ({i}, {j})"))?;
            ordered.push(points[idx]);
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_points(
        cols: usize,
        rows: usize,
        origin: Vector2<f64>,
        u: Vector2<f64>,
        v: Vector2<f64>,
    ) -> Vec<Point2<f64>> {
        let mut points = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                points.push(Point2::from(origin + u * c as f64 + v * r as f64));
            }
        }
        points
    }

    fn shuffled(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
        // deterministic permutation, n must be coprime with 11
        let n = points.len();
        (0..n).map(|k| points[(k * 11 + 3) % n]).collect()
    }

    #[test]
    fn test_orders_shuffled_grid() {
        let truth = lattice_points(
            7,
            5,
            Vector2::new(50.0, 40.0),
            Vector2::new(30.0, 2.0),
            Vector2::new(-1.5, 29.0),
        );
        let ordered = order_corners(&shuffled(&truth), PatternSize::new(7, 5)).unwrap();
        assert_eq!(ordered, truth);
    }

    #[test]
    fn test_canonical_order_is_rotation_invariant() {
        // Same board rotated by 180 degrees and listed in reverse.
        let origin = Vector2::new(20.0, 20.0);
        let (u, v) = (Vector2::new(25.0, 0.0), Vector2::new(0.0, 25.0));
        let truth = lattice_points(6, 4, origin, u, v);
        let rotated: Vec<Point2<f64>> = truth.iter().rev().copied().collect();
        let ordered = order_corners(&rotated, PatternSize::new(6, 4)).unwrap();
        assert_eq!(ordered, truth);

        // Board lying on its side: the axis with 6 nodes is vertical.
        let sideways = lattice_points(4, 6, origin, u, v);
        let ordered = order_corners(&shuffled(&sideways), PatternSize::new(6, 4)).unwrap();
        assert_eq!(ordered.len(), 24);
        let col_step = ordered[1] - ordered[0];
        let row_step = ordered[6] - ordered[0];
        assert!(col_step.y.abs() > 20.0);
        assert!(col_step.x * row_step.y - col_step.y * row_step.x > 0.0);
    }

    #[test]
    fn test_tolerates_perspective() {
        let mut points = Vec::new();
        for r in 0..5 {
            for c in 0..8 {
                let scale = 1.0 + 0.04 * r as f64;
                let x = 100.0 + (c as f64 - 3.5) * 30.0 * scale;
                let y = 50.0 + r as f64 * 28.0 * (1.0 + 0.02 * r as f64);
                points.push(Point2::new(x, y));
            }
        }
        let ordered = order_corners(&shuffled(&points), PatternSize::new(8, 5)).unwrap();
        assert_eq!(ordered, points);
    }

    #[test]
    fn test_rejects_wrong_size_and_holes() {
        let truth = lattice_points(
            7,
            5,
            Vector2::new(50.0, 40.0),
            Vector2::new(30.0, 0.0),
            Vector2::new(0.0, 30.0),
        );
        let err = order_corners(&truth, PatternSize::new(6, 5)).unwrap_err();
        assert!(err.contains("7x5") || err.contains("5x7"), "{err}");

        let mut holed = truth.clone();
        holed.remove(0);
        assert!(order_corners(&holed, PatternSize::new(7, 5)).is_err());

        assert!(order_corners(&truth[..10], PatternSize::new(7, 5)).is_err());
    }
}
