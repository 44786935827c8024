//! Global cluster-to-track assignment.

use ordered_float::OrderedFloat;
use pathfinding::prelude::{kuhn_munkres_min, Matrix};

/// Cost sentinel for forbidden pairs (gate exceeded, implausible jump,
/// singular innovation covariance). Large enough to never win, small
/// enough that padded square matrices cannot overflow the solver's
/// potential sums.
pub const FORBIDDEN_COST: f64 = 1.0e12;

/// Solve the rectangular min-cost assignment between tracks (rows) and
/// clusters (columns). Pairs at or above [`FORBIDDEN_COST`] are dropped
/// from the result, so each returned `(row, col)` is a real, gated match.
pub fn assign_min_cost(costs: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let rows = costs.len();
    if rows == 0 {
        return Vec::new();
    }
    let cols = costs[0].len();
    if cols == 0 {
        return Vec::new();
    }

    // The solver wants rows <= columns; pad to square with forbidden
    // entries which also handles the surplus-track case.
    let n = rows.max(cols);
    let weights = Matrix::from_fn(n, n, |(r, c)| {
        if r < rows && c < cols {
            OrderedFloat(costs[r][c].min(FORBIDDEN_COST))
        } else {
            OrderedFloat(FORBIDDEN_COST)
        }
    });

    let (_total, assignment) = kuhn_munkres_min(&weights);
    assignment
        .into_iter()
        .enumerate()
        .filter(|&(r, c)| r < rows && c < cols && costs[r][c] < FORBIDDEN_COST)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inputs() {
        assert!(assign_min_cost(&[]).is_empty());
        assert!(assign_min_cost(&[vec![], vec![]]).is_empty());
    }

    #[test]
    fn globally_optimal_where_greedy_swaps() {
        // Greedy would grab (0,0) at cost 1 and be forced into (1,1) at
        // cost 100; the optimal total is 2 + 2.
        let costs = vec![vec![1.0, 2.0], vec![2.0, 100.0]];
        let mut assignment = assign_min_cost(&costs);
        assignment.sort_unstable();
        assert_eq!(assignment, vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn forbidden_pairs_stay_unmatched() {
        let costs = vec![
            vec![FORBIDDEN_COST, 3.0],
            vec![FORBIDDEN_COST, FORBIDDEN_COST],
        ];
        let assignment = assign_min_cost(&costs);
        assert_eq!(assignment, vec![(0, 1)]);
    }

    #[test]
    fn more_tracks_than_clusters() {
        let costs = vec![vec![5.0], vec![1.0], vec![3.0]];
        let assignment = assign_min_cost(&costs);
        assert_eq!(assignment, vec![(1, 0)]);
    }

    #[test]
    fn more_clusters_than_tracks() {
        let costs = vec![vec![4.0, 1.0, 9.0]];
        let assignment = assign_min_cost(&costs);
        assert_eq!(assignment, vec![(0, 1)]);
    }
}
