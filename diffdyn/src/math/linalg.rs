use na::{DMatrix, DVector};

/// Moore-Penrose pseudo-inverse.
///
/// Singular values below a relative tolerance are treated as zero, so singular
/// and non-square systems produce the minimum-norm solution. Empty inputs
/// produce an empty (transposed shape) output.
pub fn pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let (nrows, ncols) = m.shape();
    if nrows == 0 || ncols == 0 {
        return DMatrix::zeros(ncols, nrows);
    }
    let svd = m.clone().svd(true, true);
    let max_sv = svd.singular_values.max();
    let eps = f64::EPSILON * nrows.max(ncols) as f64 * max_sv;
    svd.pseudo_inverse(eps)
        .unwrap_or_else(|_| DMatrix::zeros(ncols, nrows))
}

/// Minimum-norm least squares solution to `a * x = b`.
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>) -> DVector<f64> {
    pseudo_inverse(a) * b
}
