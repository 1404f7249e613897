//! End-to-end exponential curve fitting.
//!
//! Estimates the parameters of y = exp(a*x^2 + b*x + c) from noisy samples,
//! exercising the whole pipeline: graph registration, ordering, assembly,
//! damping, linear solve, and the accept/reject loop.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use argos_solver::{Edge, LinearSolver, Problem, Vertex, VertexRef, INVALID_ORDERING};

/// The (a, b, c) curve parameters as a single 3-d vertex.
struct CurveVertex {
    id: u64,
    params: DVector<f64>,
    ordering_id: usize,
}

impl CurveVertex {
    fn new(id: u64) -> Self {
        Self {
            id,
            params: DVector::zeros(3),
            ordering_id: INVALID_ORDERING,
        }
    }
}

impl Vertex for CurveVertex {
    fn id(&self) -> u64 {
        self.id
    }
    fn params(&self) -> &DVector<f64> {
        &self.params
    }
    fn ordering_id(&self) -> usize {
        self.ordering_id
    }
    fn set_ordering_id(&mut self, ordering_id: usize) {
        self.ordering_id = ordering_id;
    }
    fn plus(&mut self, delta: &DVector<f64>) {
        self.params += delta;
    }
}

/// One noisy observation (x, y) of the curve.
struct CurveFitEdge {
    id: u64,
    vertices: Vec<VertexRef>,
    x: f64,
    y: f64,
    residual: DVector<f64>,
    jacobians: Vec<DMatrix<f64>>,
    information: DMatrix<f64>,
}

impl CurveFitEdge {
    fn new(id: u64, vertex: VertexRef, x: f64, y: f64) -> Self {
        Self {
            id,
            vertices: vec![vertex],
            x,
            y,
            residual: DVector::zeros(1),
            jacobians: vec![DMatrix::zeros(1, 3)],
            information: DMatrix::identity(1, 1),
        }
    }

    fn model(&self) -> f64 {
        let abc = self.vertices[0].borrow().params().clone_owned();
        (abc[0] * self.x * self.x + abc[1] * self.x + abc[2]).exp()
    }
}

impl Edge for CurveFitEdge {
    fn id(&self) -> u64 {
        self.id
    }
    fn vertices(&self) -> &[VertexRef] {
        &self.vertices
    }
    fn compute_residual(&mut self) {
        self.residual[0] = self.model() - self.y;
    }
    fn compute_jacobians(&mut self) {
        let f = self.model();
        self.jacobians[0] =
            DMatrix::from_row_slice(1, 3, &[self.x * self.x * f, self.x * f, f]);
    }
    fn residual(&self) -> &DVector<f64> {
        &self.residual
    }
    fn jacobians(&self) -> &[DMatrix<f64>] {
        &self.jacobians
    }
    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }
}

fn fit_curve(solver: LinearSolver) -> DVector<f64> {
    let (a, b, c) = (1.0, 2.0, 1.0);
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let mut problem = Problem::new().with_linear_solver(solver);
    let vertex = Rc::new(RefCell::new(CurveVertex::new(0)));
    problem.add_vertex(vertex.clone());

    for i in 0..100u64 {
        let x = i as f64 / 100.0;
        let y = (a * x * x + b * x + c).exp() + rng.gen_range(-0.02..0.02);
        problem.add_edge(Rc::new(RefCell::new(CurveFitEdge::new(
            i,
            vertex.clone(),
            x,
            y,
        ))));
    }

    assert!(problem.solve(30));
    let abc = vertex.borrow().params().clone_owned();
    abc
}

#[test]
fn recovers_curve_parameters_with_dense_solver() {
    let abc = fit_curve(LinearSolver::Dense);
    assert!((abc[0] - 1.0).abs() < 0.05, "a = {}", abc[0]);
    assert!((abc[1] - 2.0).abs() < 0.05, "b = {}", abc[1]);
    assert!((abc[2] - 1.0).abs() < 0.05, "c = {}", abc[2]);
}

#[test]
fn recovers_curve_parameters_with_pcg_solver() {
    let abc = fit_curve(LinearSolver::Pcg {
        max_iterations: None,
    });
    assert!((abc[0] - 1.0).abs() < 0.05, "a = {}", abc[0]);
    assert!((abc[1] - 2.0).abs() < 0.05, "b = {}", abc[1]);
    assert!((abc[2] - 1.0).abs() < 0.05, "c = {}", abc[2]);
}

#[test]
fn dense_and_pcg_agree() {
    let dense = fit_curve(LinearSolver::Dense);
    let pcg = fit_curve(LinearSolver::Pcg {
        max_iterations: None,
    });
    assert!((&dense - &pcg).norm() < 5e-3);
}
