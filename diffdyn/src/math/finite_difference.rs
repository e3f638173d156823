//! Finite difference Jacobians used to validate analytical derivatives.

use na::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Finite difference scheme.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FiniteDifference {
    /// `(f(x + h) - f(x)) / h`
    Forward { step: f64 },
    /// `(f(x + h) - f(x - h)) / 2h`
    Central { step: f64 },
    /// Richardson extrapolation of central differences with shrinking steps
    /// starting at `initial_step` (Ridders' method).
    Ridders { initial_step: f64 },
}

impl Default for FiniteDifference {
    fn default() -> Self {
        FiniteDifference::Central { step: 1e-6 }
    }
}

const RIDDERS_SHRINK: f64 = 1.4;
const RIDDERS_TABLE_SIZE: usize = 10;
const RIDDERS_SAFE: f64 = 2.0;

impl FiniteDifference {
    /// Estimate the derivative of `f` at zero, where `f(delta)` evaluates the
    /// function at the base point offset by `delta` along one input direction.
    pub fn derivative<E>(
        self,
        mut f: impl FnMut(f64) -> Result<DVector<f64>, E>,
    ) -> Result<DVector<f64>, E> {
        match self {
            FiniteDifference::Forward { step } => Ok((f(step)? - f(0.0)?) / step),
            FiniteDifference::Central { step } => Ok((f(step)? - f(-step)?) / (2.0 * step)),
            FiniteDifference::Ridders { initial_step } => ridders(f, initial_step),
        }
    }
}

fn ridders<E>(
    mut f: impl FnMut(f64) -> Result<DVector<f64>, E>,
    initial_step: f64,
) -> Result<DVector<f64>, E> {
    let shrink_sq = RIDDERS_SHRINK * RIDDERS_SHRINK;
    let mut central = |h: f64| -> Result<DVector<f64>, E> { Ok((f(h)? - f(-h)?) / (2.0 * h)) };

    let mut h = initial_step;
    let first = central(h)?;
    let n = first.len();
    let mut table = vec![vec![DVector::zeros(n); RIDDERS_TABLE_SIZE]; RIDDERS_TABLE_SIZE];
    table[0][0] = first;
    let mut best = table[0][0].clone();
    let mut err = f64::MAX;

    for i in 1..RIDDERS_TABLE_SIZE {
        h /= RIDDERS_SHRINK;
        table[0][i] = central(h)?;
        let mut fac = shrink_sq;
        for j in 1..=i {
            table[j][i] = (&table[j - 1][i] * fac - &table[j - 1][i - 1]) / (fac - 1.0);
            fac *= shrink_sq;
            let errt = (&table[j][i] - &table[j - 1][i])
                .amax()
                .max((&table[j][i] - &table[j - 1][i - 1]).amax());
            if errt <= err {
                err = errt;
                best = table[j][i].clone();
            }
        }
        if (&table[i][i] - &table[i - 1][i - 1]).amax() >= RIDDERS_SAFE * err {
            break;
        }
    }
    Ok(best)
}

/// Compute a `num_outputs × num_inputs` Jacobian column by column in parallel.
///
/// Each column gets its own clone of `probe`. `eval(probe, i, delta)` must
/// return the outputs at the base point with input `i` offset by `delta`.
pub fn jacobian<S, E, F>(
    probe: &S,
    num_inputs: usize,
    num_outputs: usize,
    method: FiniteDifference,
    eval: F,
) -> Result<DMatrix<f64>, E>
where
    S: Clone + Send,
    E: Send,
    F: Fn(&mut S, usize, f64) -> Result<DVector<f64>, E> + Sync,
{
    let mut probes: Vec<(usize, S)> = (0..num_inputs).map(|i| (i, probe.clone())).collect();
    let columns = probes
        .par_iter_mut()
        .map(|(i, probe)| method.derivative(|delta| eval(probe, *i, delta)))
        .collect::<Result<Vec<_>, E>>()?;

    let mut jac = DMatrix::zeros(num_outputs, num_inputs);
    for (i, col) in columns.iter().enumerate() {
        jac.column_mut(i).copy_from(col);
    }
    Ok(jac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::*;

    fn eval_sin_cube(x: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0].sin() * x[1], x[1] * x[1] * x[1]])
    }

    fn expected(x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            2,
            &[x[0].cos() * x[1], x[0].sin(), 0.0, 3.0 * x[1] * x[1]],
        )
    }

    fn check(method: FiniteDifference, tol: f64) {
        let x = DVector::from_vec(vec![0.3, -1.2]);
        let jac = jacobian(&x, 2, 2, method, |x, i, delta| {
            let mut p = x.clone();
            p[i] += delta;
            Ok::<_, ()>(eval_sin_cube(&p))
        })
        .unwrap();
        assert_relative_eq!(jac, expected(&x), epsilon = tol);
    }

    #[test]
    fn forward_difference() {
        check(FiniteDifference::Forward { step: 1e-7 }, 1e-5);
    }

    #[test]
    fn central_difference() {
        check(FiniteDifference::Central { step: 1e-5 }, 1e-8);
    }

    #[test]
    fn ridders_extrapolation() {
        check(FiniteDifference::Ridders { initial_step: 0.1 }, 1e-9);
    }

    #[test]
    fn errors_propagate() {
        let x = DVector::from_vec(vec![1.0]);
        let result = jacobian(&x, 1, 1, FiniteDifference::default(), |_, _, _| {
            Err::<DVector<f64>, _>("failed")
        });
        assert_eq!(result, Err("failed"));
    }
}
