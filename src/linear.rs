//! Linear system strategies for the damped normal equations
//!
//! The damped Hessian is symmetric positive definite, so the direct path
//! uses a Cholesky factorization. For large problems where a dense
//! factorization is too costly, a Jacobi-preconditioned conjugate-gradient
//! solve is available; both converge to the same increment within numerical
//! tolerance on well-conditioned systems.

use nalgebra::{DMatrix, DVector};

/// Strategy for solving `H * delta_x = b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolver {
    /// Dense Cholesky factorization of the damped system.
    Dense,
    /// Jacobi-preconditioned conjugate gradient. `max_iterations: None`
    /// caps the iteration count at the dimension of `b`.
    Pcg { max_iterations: Option<usize> },
}

impl Default for LinearSolver {
    fn default() -> Self {
        LinearSolver::Dense
    }
}

/// Solve `A x = b` for symmetric positive-definite `A` with Jacobi-PCG.
///
/// The preconditioner is `M = diag(A)`. Iteration stops once
/// `||r|| <= 1e-6 * ||b||` or the cap is reached; if the cap is hit the
/// possibly-non-converged estimate is returned as-is and the caller is
/// responsible for interpreting convergence. A zero `b` returns the zero
/// vector immediately.
pub fn pcg_solve(a: &DMatrix<f64>, b: &DVector<f64>, max_iterations: Option<usize>) -> DVector<f64> {
    assert_eq!(a.nrows(), a.ncols(), "PCG requires a square matrix");
    let n = b.nrows();
    let cap = max_iterations.unwrap_or(n);

    let mut x = DVector::zeros(n);
    let b_norm = b.norm();
    // Zero gradient: x = 0 is already the solution, and the recurrence
    // below would divide 0/0.
    if b_norm == 0.0 {
        return x;
    }

    let m_inv: DVector<f64> = a.diagonal().map(|d| 1.0 / d);

    let r0 = b.clone(); // r = b - A*0
    let z0 = r0.component_mul(&m_inv);
    let mut p = z0.clone();
    let mut w = a * &p;
    let mut r0z0 = r0.dot(&z0);
    let alpha = r0z0 / p.dot(&w);
    x.axpy(alpha, &p, 1.0);
    let mut r1 = &r0 - alpha * &w;

    let threshold = 1e-6 * b_norm;
    let mut i = 0;
    while r1.norm() > threshold && i < cap {
        i += 1;
        let z1 = r1.component_mul(&m_inv);
        let r1z1 = r1.dot(&z1);
        let beta = r1z1 / r0z0;
        p = beta * p + z1;
        w = a * &p;
        let alpha = r1z1 / p.dot(&w);
        x.axpy(alpha, &p, 1.0);
        r1.axpy(-alpha, &w, 1.0);
        r0z0 = r1z1;
    }
    x
}
