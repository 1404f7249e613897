//! Graph-based nonlinear least-squares optimization backend
//!
//! This crate implements the optimization core used by real-time estimation
//! pipelines (SLAM/VIO backends): a factor graph of state variables
//! ("vertices") and measurement constraints ("edges") is minimized with a
//! Levenberg-Marquardt trust-region iteration.
//!
//! The caller supplies concrete vertex and edge types implementing the
//! [`Vertex`] and [`Edge`] contracts (analytic residuals and Jacobians);
//! the [`Problem`] aggregate owns the ordering, the block-structured
//! Gauss-Newton Hessian, the adaptive damping policy, and the linear solve.
//!
//! # Example shape
//!
//! ```ignore
//! let mut problem = Problem::new().with_linear_solver(LinearSolver::Dense);
//! problem.add_vertex(vertex.clone());
//! problem.add_edge(edge.clone());
//! problem.solve(30);
//! // optimized state now lives in the vertices
//! ```

pub mod graph;
pub mod linear;
pub mod lm;
pub mod problem;

pub use graph::{Edge, EdgeRef, Vertex, VertexRef, INVALID_ORDERING};
pub use linear::{pcg_solve, LinearSolver};
pub use problem::Problem;
