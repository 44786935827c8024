//! DBSCAN over the 2D ground-plane projection with a regular grid index.

use std::collections::HashMap;

use nalgebra::{Matrix2, SymmetricEigen};
use tracing::debug;

use verge_config_data::TuningParams;
use verge_types::{Obb, WorldCluster, WorldPoint};

/// Below this short-axis length the aspect-ratio rejection is skipped so
/// edge-on detections (a wall of points one beam wide) survive.
const ASPECT_NOISE_FLOOR_M: f64 = 0.03;

#[inline]
fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// Szudzik pairing over zigzag-encoded cell coordinates, so negative grid
/// coordinates produce well-distributed ids.
#[inline]
fn cell_id(cx: i64, cy: i64) -> u64 {
    let a = zigzag(cx);
    let b = zigzag(cy);
    if a >= b {
        a.wrapping_mul(a).wrapping_add(a).wrapping_add(b)
    } else {
        b.wrapping_mul(b).wrapping_add(a)
    }
}

struct GridIndex {
    eps: f64,
    cells: HashMap<u64, Vec<usize>>,
}

impl GridIndex {
    fn build(points: &[WorldPoint], eps: f64) -> Self {
        let mut cells: HashMap<u64, Vec<usize>> = HashMap::with_capacity(points.len());
        for (idx, pt) in points.iter().enumerate() {
            let cx = (pt.x / eps).floor() as i64;
            let cy = (pt.y / eps).floor() as i64;
            cells.entry(cell_id(cx, cy)).or_default().push(idx);
        }
        GridIndex { eps, cells }
    }

    /// Indices within `eps` of `points[idx]`, from the 3x3 cell
    /// neighbourhood. Includes `idx` itself.
    fn neighbours(&self, points: &[WorldPoint], idx: usize, out: &mut Vec<usize>) {
        out.clear();
        let pt = &points[idx];
        let cx = (pt.x / self.eps).floor() as i64;
        let cy = (pt.y / self.eps).floor() as i64;
        let eps2 = self.eps * self.eps;
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(bucket) = self.cells.get(&cell_id(cx + dx, cy + dy)) {
                    for &other in bucket {
                        let o = &points[other];
                        let ddx = o.x - pt.x;
                        let ddy = o.y - pt.y;
                        if ddx * ddx + ddy * ddy <= eps2 {
                            out.push(other);
                        }
                    }
                }
            }
        }
    }
}

/// Run DBSCAN and compute per-cluster metrics.
///
/// Inputs above `foreground_max_input_points` are uniformly subsampled
/// before clustering.
pub fn cluster_frame(points: &[WorldPoint], params: &TuningParams) -> Vec<WorldCluster> {
    let subsampled: Vec<WorldPoint>;
    let points = if points.len() > params.foreground_max_input_points {
        let stride = points.len().div_ceil(params.foreground_max_input_points);
        subsampled = points.iter().step_by(stride).cloned().collect();
        debug!(
            "subsampled {} foreground points to {}",
            points.len(),
            subsampled.len()
        );
        &subsampled[..]
    } else {
        points
    };

    let labels = dbscan_labels(
        points,
        params.foreground_dbscan_eps,
        params.foreground_min_cluster_points,
    );

    let cluster_count = labels.iter().filter_map(|l| *l).max().map_or(0, |m| m + 1);
    let mut members: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (idx, label) in labels.iter().enumerate() {
        if let Some(c) = label {
            members[*c].push(idx);
        }
    }

    let mut out = Vec::new();
    for member_indices in members {
        if let Some(cluster) = build_cluster(points, &member_indices, out.len() as u32, params) {
            out.push(cluster);
        }
    }
    out
}

/// Standard DBSCAN with BFS expansion. Returns a per-point cluster label;
/// `None` is noise.
fn dbscan_labels(points: &[WorldPoint], eps: f64, min_pts: usize) -> Vec<Option<usize>> {
    let index = GridIndex::build(points, eps);
    let mut labels: Vec<Option<usize>> = vec![None; points.len()];
    let mut visited = vec![false; points.len()];
    let mut next_cluster = 0usize;
    let mut scratch = Vec::new();
    let mut queue = std::collections::VecDeque::new();

    for seed in 0..points.len() {
        if visited[seed] {
            continue;
        }
        visited[seed] = true;
        index.neighbours(points, seed, &mut scratch);
        if scratch.len() < min_pts {
            continue; // noise, possibly claimed later as a border point
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[seed] = Some(cluster);
        queue.clear();
        queue.extend(scratch.iter().copied());

        while let Some(idx) = queue.pop_front() {
            if labels[idx].is_none() {
                labels[idx] = Some(cluster);
            }
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            index.neighbours(points, idx, &mut scratch);
            if scratch.len() >= min_pts {
                // Core point: its neighbourhood joins the cluster.
                for &n in &scratch {
                    if labels[n].is_none() || !visited[n] {
                        queue.push_back(n);
                    }
                }
            }
        }
    }
    labels
}

fn build_cluster(
    points: &[WorldPoint],
    member_indices: &[usize],
    cluster_id: u32,
    params: &TuningParams,
) -> Option<WorldCluster> {
    let n = member_indices.len();
    if n == 0 {
        return None;
    }

    let mut mean_x = 0.0;
    let mut mean_y = 0.0;
    let mut intensity_sum = 0.0;
    let mut aabb_min = [f64::INFINITY; 3];
    let mut aabb_max = [f64::NEG_INFINITY; 3];
    for &i in member_indices {
        let p = &points[i];
        mean_x += p.x;
        mean_y += p.y;
        intensity_sum += p.intensity as f64;
        for (axis, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            aabb_min[axis] = aabb_min[axis].min(v);
            aabb_max[axis] = aabb_max[axis].max(v);
        }
    }
    mean_x /= n as f64;
    mean_y /= n as f64;

    // Medoid: the actual member nearest the arithmetic mean.
    let medoid_idx = member_indices.iter().copied().min_by(|&a, &b| {
        let da = (points[a].x - mean_x).powi(2) + (points[a].y - mean_y).powi(2);
        let db = (points[b].x - mean_x).powi(2) + (points[b].y - mean_y).powi(2);
        da.total_cmp(&db)
    })?;

    // 2D PCA for the oriented box.
    let mut cov = Matrix2::zeros();
    for &i in member_indices {
        let dx = points[i].x - mean_x;
        let dy = points[i].y - mean_y;
        cov[(0, 0)] += dx * dx;
        cov[(0, 1)] += dx * dy;
        cov[(1, 1)] += dy * dy;
    }
    cov[(1, 0)] = cov[(0, 1)];
    cov /= n as f64;

    let eigen = SymmetricEigen::new(cov);
    let principal_idx = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
        0
    } else {
        1
    };
    let axis = eigen.eigenvectors.column(principal_idx);
    let heading_rad = axis[1].atan2(axis[0]);
    let (cos_h, sin_h) = (heading_rad.cos(), heading_rad.sin());

    let mut along_min = f64::INFINITY;
    let mut along_max = f64::NEG_INFINITY;
    let mut across_min = f64::INFINITY;
    let mut across_max = f64::NEG_INFINITY;
    for &i in member_indices {
        let dx = points[i].x - mean_x;
        let dy = points[i].y - mean_y;
        let along = dx * cos_h + dy * sin_h;
        let across = -dx * sin_h + dy * cos_h;
        along_min = along_min.min(along);
        along_max = along_max.max(along);
        across_min = across_min.min(across);
        across_max = across_max.max(across);
    }

    let length_m = along_max - along_min;
    let width_m = across_max - across_min;
    let height_m = aabb_max[2] - aabb_min[2];

    // Size and shape gates.
    let longest = length_m.max(width_m);
    if longest < params.min_cluster_diameter || longest > params.max_cluster_diameter {
        return None;
    }
    let shortest = length_m.min(width_m);
    if shortest >= ASPECT_NOISE_FLOOR_M
        && longest / shortest.max(f64::EPSILON) > params.max_cluster_aspect_ratio
    {
        return None;
    }

    let mut heights: Vec<f64> = member_indices.iter().map(|&i| points[i].z).collect();
    heights.sort_unstable_by(f64::total_cmp);
    let p95_idx = ((heights.len() as f64 * 0.95).ceil() as usize)
        .saturating_sub(1)
        .min(heights.len() - 1);

    Some(WorldCluster {
        cluster_id,
        centroid: points[medoid_idx].clone(),
        aabb_min,
        aabb_max,
        obb: Obb {
            cx: (along_min + along_max) / 2.0 * cos_h - (across_min + across_max) / 2.0 * sin_h
                + mean_x,
            cy: (along_min + along_max) / 2.0 * sin_h + (across_min + across_max) / 2.0 * cos_h
                + mean_y,
            length_m,
            width_m,
            height_m,
            heading_rad,
        },
        point_count: n,
        intensity_mean: intensity_sum / n as f64,
        height_p95: heights[p95_idx],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn wp(x: f64, y: f64) -> WorldPoint {
        WorldPoint {
            x,
            y,
            z: 1.0,
            intensity: 100,
            timestamp_ns: 0,
            sensor_id: verge_types::SensorId::new("s1"),
        }
    }

    fn params() -> TuningParams {
        let mut p = TuningParams::recommended();
        p.foreground_dbscan_eps = 0.5;
        p.foreground_min_cluster_points = 3;
        p.min_cluster_diameter = 0.05;
        p
    }

    /// A dense blob of points around (cx, cy).
    fn blob(cx: f64, cy: f64, half: f64, step: f64) -> Vec<WorldPoint> {
        let mut out = Vec::new();
        let mut x = -half;
        while x <= half {
            let mut y = -half;
            while y <= half {
                out.push(wp(cx + x, cy + y));
                y += step;
            }
            x += step;
        }
        out
    }

    #[test]
    fn two_separated_blobs_make_two_clusters() {
        let params = params();
        let mut points = blob(0.0, 0.0, 0.5, 0.2);
        points.extend(blob(10.0, 0.0, 0.5, 0.2));
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 2);
    }

    #[test]
    fn isolated_points_are_noise() {
        let params = params();
        let points = vec![wp(0.0, 0.0), wp(5.0, 5.0), wp(-7.0, 3.0)];
        let clusters = cluster_frame(&points, &params);
        assert!(clusters.is_empty());
    }

    #[test]
    fn negative_coordinates_cluster_fine() {
        let params = params();
        let clusters = cluster_frame(&blob(-20.0, -15.0, 0.5, 0.2), &params);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].centroid.x < -19.0);
    }

    #[test]
    fn medoid_is_a_member_point() {
        let params = params();
        let points = blob(3.0, 4.0, 0.6, 0.2);
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert!(points
            .iter()
            .any(|p| p.x == c.centroid.x && p.y == c.centroid.y));
    }

    #[test]
    fn obb_heading_follows_elongation() {
        let params = params();
        // A 4 m x 0.4 m bar along +Y.
        let mut points = Vec::new();
        let mut y = -2.0;
        while y <= 2.0 {
            points.push(wp(0.0, y));
            points.push(wp(0.2, y));
            points.push(wp(0.4, y));
            y += 0.1;
        }
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 1);
        let obb = &clusters[0].obb;
        assert!(obb.length_m > 3.5);
        assert!(obb.width_m < 0.6);
        // Heading along +-Y.
        let heading = obb.heading_rad.sin().abs();
        assert_relative_eq!(heading, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn oversized_cluster_rejected() {
        let mut params = params();
        params.max_cluster_diameter = 2.0;
        let clusters = cluster_frame(&blob(0.0, 0.0, 2.0, 0.2), &params);
        assert!(clusters.is_empty());
    }

    #[test]
    fn thin_edge_on_cluster_survives_aspect_gate() {
        let mut params = params();
        params.max_cluster_aspect_ratio = 3.0;
        // One beam wide: short axis under the noise floor.
        let mut points = Vec::new();
        let mut y = 0.0;
        while y <= 1.0 {
            points.push(wp(0.0, y));
            y += 0.05;
        }
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn oversubscribed_input_is_subsampled() {
        let mut params = params();
        params.foreground_max_input_points = 100;
        let points = blob(0.0, 0.0, 1.0, 0.02); // ~10k points
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 1);
        assert!(clusters[0].point_count <= 100);
    }
}
