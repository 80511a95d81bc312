//! Hungarian assignment over a dense cost matrix with a hard rejection cap.

use nalgebra::DMatrix;
use pathfinding::prelude::{Matrix, kuhn_munkres_min};

/// Cost values are scaled by this and rounded to the nearest integer before the exact
/// solver runs; `kuhn_munkres_min` works over an ordered integer weight, not `f64`.
const COST_SCALE: f64 = 10_000.0;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_cols: Vec<usize>,
}

/// Finds a minimum-cost matching over `cost` (rows = tracks, columns = detections),
/// then rejects any individual match whose original cost exceeds `cap`. Rejected pairs
/// fall back to their row/column being unmatched.
///
/// `kuhn_munkres_min` requires at least as many columns as rows to saturate every row;
/// when `cost` has more rows than columns the problem is solved transposed and the
/// result mapped back, mirroring how the teacher handled non-square inputs.
pub fn assign(cost: &DMatrix<f64>, cap: f64) -> Assignment {
    let rows = cost.nrows();
    let cols = cost.ncols();

    if rows == 0 || cols == 0 {
        return Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..rows).collect(),
            unmatched_cols: (0..cols).collect(),
        };
    }

    let transpose = rows > cols;
    let (solve_rows, solve_cols) = if transpose { (cols, rows) } else { (rows, cols) };

    let mut weights = Matrix::new(solve_rows, solve_cols, 0i64);
    for i in 0..solve_rows {
        for j in 0..solve_cols {
            let (r, c) = if transpose { (j, i) } else { (i, j) };
            weights[(i, j)] = (cost[(r, c)] * COST_SCALE).round() as i64;
        }
    }

    let assignment_vector = kuhn_munkres_min(&weights).1;

    let mut matched_rows = vec![false; rows];
    let mut matched_cols = vec![false; cols];
    let mut matches = Vec::with_capacity(assignment_vector.len());

    for (i, &j) in assignment_vector.iter().enumerate() {
        let (row, col) = if transpose { (j, i) } else { (i, j) };
        if cost[(row, col)] <= cap {
            matches.push((row, col));
            matched_rows[row] = true;
            matched_cols[col] = true;
        }
    }

    let unmatched_rows = (0..rows).filter(|&r| !matched_rows[r]).collect();
    let unmatched_cols = (0..cols).filter(|&c| !matched_cols[c]).collect();

    Assignment { matches, unmatched_rows, unmatched_cols }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cost_matrix_yields_no_matches() {
        let cost = DMatrix::<f64>::zeros(0, 0);
        let result = assign(&cost, 1.0);
        assert!(result.matches.is_empty());
    }

    #[test]
    fn test_zero_rows_reports_all_columns_unmatched() {
        let cost = DMatrix::<f64>::zeros(0, 3);
        let result = assign(&cost, 1.0);
        assert_eq!(result.unmatched_cols, vec![0, 1, 2]);
    }

    #[test]
    fn test_obvious_diagonal_assignment() {
        let cost = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        let result = assign(&cost, 0.5);
        assert_eq!(result.matches.len(), 2);
        assert!(result.matches.contains(&(0, 0)));
        assert!(result.matches.contains(&(1, 1)));
    }

    #[test]
    fn test_cap_rejects_expensive_match() {
        let cost = DMatrix::from_row_slice(1, 1, &[0.9]);
        let result = assign(&cost, 0.5);
        assert!(result.matches.is_empty());
        assert_eq!(result.unmatched_rows, vec![0]);
        assert_eq!(result.unmatched_cols, vec![0]);
    }

    #[test]
    fn test_more_rows_than_columns_transposes_correctly() {
        let cost = DMatrix::from_row_slice(3, 1, &[0.9, 0.1, 0.9]);
        let result = assign(&cost, 0.5);
        assert_eq!(result.matches, vec![(1, 0)]);
        assert_eq!(result.unmatched_rows, vec![0, 2]);
    }

    #[test]
    fn test_more_columns_than_rows() {
        let cost = DMatrix::from_row_slice(1, 3, &[0.9, 0.1, 0.9]);
        let result = assign(&cost, 0.5);
        assert_eq!(result.matches, vec![(0, 1)]);
        assert_eq!(result.unmatched_cols, vec![0, 2]);
    }
}
