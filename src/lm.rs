//! Levenberg-Marquardt control loop
//!
//! Damping initialization, the Nielsen step-acceptance policy, and the
//! outer/inner iteration driver. The damping factor is injected into and
//! removed from the Hessian diagonal around every linear solve; the
//! pre-damping diagonal is cached so the removal restores it exactly.

use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::Cholesky;

use crate::linear::{pcg_solve, LinearSolver};
use crate::problem::Problem;

/// Initial damping is `TAU * max |diag(H)|`.
const TAU: f64 = 1e-5;

/// Consecutive rejected trial steps tolerated before giving up.
const MAX_CONSECUTIVE_FAILURES: usize = 10;

impl Problem {
    /// Run the Levenberg-Marquardt iteration for at most `iterations` outer
    /// loops.
    ///
    /// Returns `false` if the graph is empty (nothing was mutated). Returns
    /// `true` otherwise, whether the loop converged or gave up; callers can
    /// inspect [`current_chi2`](Problem::current_chi2) to distinguish.
    pub fn solve(&mut self, iterations: usize) -> bool {
        if self.edges.is_empty() || self.vertices.is_empty() {
            warn!("cannot solve a problem without edges or vertices");
            return false;
        }

        let t_solve = Instant::now();

        self.set_ordering();
        self.make_hessian();
        self.compute_lambda_init();

        let mut stop = false;
        let mut iter = 0;
        while !stop && iter < iterations {
            debug!(
                "iter: {}, chi2: {}, lambda: {}",
                iter, self.current_chi2, self.current_lambda
            );

            // Try lambdas until one produces an acceptable step.
            let mut one_step_success = false;
            let mut false_cnt = 0;
            while !one_step_success {
                self.add_lambda_to_hessian();
                self.solve_linear_system();
                self.remove_lambda_from_hessian();

                if self.delta_x.norm_squared() <= 1e-6 {
                    info!("converged: increment norm below threshold");
                    stop = true;
                    break;
                }
                if false_cnt > MAX_CONSECUTIVE_FAILURES {
                    warn!("cannot find an appropriate step; keeping the last accepted state");
                    stop = true;
                    break;
                }

                self.update_states();
                one_step_success = self.is_good_step();
                if one_step_success {
                    // Re-linearize at the accepted state.
                    self.make_hessian();
                    false_cnt = 0;
                } else {
                    false_cnt += 1;
                    self.rollback_states();
                }
            }
            iter += 1;

            if self.current_chi2.sqrt() <= self.stop_threshold {
                info!("converged: cost reduced below stop threshold");
                stop = true;
            }
        }

        info!(
            "solve finished in {:.3} ms ({} outer iterations, chi2 {}), hessian assembly {:.3} ms",
            t_solve.elapsed().as_secs_f64() * 1e3,
            iter,
            self.current_chi2,
            self.hessian_time().as_secs_f64() * 1e3
        );
        true
    }

    /// Initialize the damping state from the freshly assembled system:
    /// `ni = 2`, chi2 from all edges (plus the prior residual norm when one
    /// is set), stop threshold at a 1e-6 cost reduction, and
    /// `lambda = tau * max |diag(H)|`.
    pub(crate) fn compute_lambda_init(&mut self) {
        self.ni = 2.0;
        self.current_lambda = -1.0;

        self.current_chi2 = 0.0;
        for edge in self.edges.values() {
            self.current_chi2 += edge.borrow().chi2();
        }
        if self.prior_residual.len() > 0 {
            self.current_chi2 += self.prior_residual.norm();
        }

        self.stop_threshold = 1e-6 * self.current_chi2;

        let max_diagonal = self
            .hessian
            .diagonal()
            .iter()
            .fold(0.0_f64, |max, d| d.abs().max(max));
        self.current_lambda = TAU * max_diagonal;
    }

    /// Inject `lambda * I` into the Hessian diagonal, caching the undamped
    /// diagonal first.
    pub(crate) fn add_lambda_to_hessian(&mut self) {
        self.undamped_diagonal = self.hessian.diagonal();
        for i in 0..self.ordering_generic {
            self.hessian[(i, i)] += self.current_lambda;
        }
    }

    /// Restore the cached undamped diagonal. Exact inverse of
    /// `add_lambda_to_hessian`, with no add/subtract drift.
    pub(crate) fn remove_lambda_from_hessian(&mut self) {
        for i in 0..self.ordering_generic {
            self.hessian[(i, i)] = self.undamped_diagonal[i];
        }
    }

    /// Solve the damped normal equations for `delta_x`.
    pub(crate) fn solve_linear_system(&mut self) {
        match self.linear_solver {
            LinearSolver::Dense => {
                // The damping term keeps the system positive definite even
                // when the undamped Gauss-Newton Hessian is only
                // semi-definite.
                let chol = Cholesky::new_unchecked(self.hessian.clone());
                self.delta_x = chol.solve(&self.b);
            }
            LinearSolver::Pcg { max_iterations } => {
                self.delta_x = pcg_solve(&self.hessian, &self.b, max_iterations);
            }
        }
    }

    /// Nielsen step evaluation: accept when the gain ratio is positive and
    /// the trial cost is finite, rescaling lambda accordingly.
    ///
    /// Must be called after `update_states`; the caller rolls the update
    /// back on rejection.
    pub(crate) fn is_good_step(&mut self) -> bool {
        let scale =
            0.5 * self.delta_x.dot(&(self.current_lambda * &self.delta_x + &self.b)) + 1e-6;

        // Recompute residuals at the tentatively updated state.
        let mut temp_chi2 = 0.0;
        for edge in self.edges.values() {
            let mut e = edge.borrow_mut();
            e.compute_residual();
            temp_chi2 += e.chi2();
        }

        let rho = (self.current_chi2 - temp_chi2) / scale;
        if rho > 0.0 && temp_chi2.is_finite() {
            // The cubic blend and the 1/3 floor are exact constants of the
            // Nielsen policy.
            let alpha = 1.0 - (2.0 * rho - 1.0).powi(3);
            let scale_factor = alpha.max(1.0 / 3.0);
            self.current_lambda *= scale_factor;
            self.ni = 2.0;
            self.current_chi2 = temp_chi2;
            true
        } else {
            self.current_lambda *= self.ni;
            self.ni *= 2.0;
            false
        }
    }
}
