//! Problem aggregate: graph storage, variable ordering, Hessian assembly
//!
//! The problem owns the id-keyed vertex/edge maps and the global
//! linear-algebra state (Gauss-Newton Hessian, gradient, increment).
//! Maps are `BTreeMap` so that every walk over the graph happens in
//! ascending-id order; assembly is bit-reproducible run to run.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::warn;
use nalgebra::{DMatrix, DVector};

use crate::graph::{EdgeRef, VertexRef, INVALID_ORDERING};
use crate::linear::LinearSolver;

/// A factor-graph least-squares problem.
///
/// Vertices and edges are registered once and shared with the caller; the
/// solver reads and writes vertex state only through the
/// [`Vertex`](crate::graph::Vertex) contract.
pub struct Problem {
    pub(crate) vertices: BTreeMap<u64, VertexRef>,
    pub(crate) edges: BTreeMap<u64, EdgeRef>,
    /// Edges incident to each vertex, kept consistent with `edges`.
    vertex_to_edge: BTreeMap<u64, Vec<EdgeRef>>,

    pub(crate) linear_solver: LinearSolver,

    // Global linear system state, valid after `make_hessian`.
    pub(crate) hessian: DMatrix<f64>,
    pub(crate) b: DVector<f64>,
    pub(crate) delta_x: DVector<f64>,
    /// Total free dimension (sum of local dimensions of non-fixed vertices).
    pub(crate) ordering_generic: usize,

    // Levenberg-Marquardt scalars.
    pub(crate) current_lambda: f64,
    pub(crate) current_chi2: f64,
    pub(crate) stop_threshold: f64,
    pub(crate) ni: f64,
    /// Hessian diagonal saved before damping is injected, restored when it
    /// is removed.
    pub(crate) undamped_diagonal: DVector<f64>,

    /// Marginalization prior residual, populated externally; empty when no
    /// prior is active.
    pub(crate) prior_residual: DVector<f64>,

    /// Cumulative time spent assembling the Hessian, for diagnostics.
    hessian_time: Duration,
}

impl Problem {
    pub fn new() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            vertex_to_edge: BTreeMap::new(),
            linear_solver: LinearSolver::default(),
            hessian: DMatrix::zeros(0, 0),
            b: DVector::zeros(0),
            delta_x: DVector::zeros(0),
            ordering_generic: 0,
            current_lambda: -1.0,
            current_chi2: 0.0,
            stop_threshold: 0.0,
            ni: 2.0,
            undamped_diagonal: DVector::zeros(0),
            prior_residual: DVector::zeros(0),
            hessian_time: Duration::ZERO,
        }
    }

    /// Select the linear system strategy (dense Cholesky by default).
    pub fn with_linear_solver(mut self, linear_solver: LinearSolver) -> Self {
        self.linear_solver = linear_solver;
        self
    }

    /// Register a vertex. Returns `false` (and leaves the graph unchanged)
    /// if the id is already present.
    pub fn add_vertex(&mut self, vertex: VertexRef) -> bool {
        let id = vertex.borrow().id();
        if self.vertices.contains_key(&id) {
            warn!("vertex {} has been added before", id);
            return false;
        }
        self.vertices.insert(id, vertex);
        true
    }

    /// Register an edge and index it against its vertices. Returns `false`
    /// if the id is already present.
    pub fn add_edge(&mut self, edge: EdgeRef) -> bool {
        let id = edge.borrow().id();
        if self.edges.contains_key(&id) {
            warn!("edge {} has been added before", id);
            return false;
        }
        self.edges.insert(id, edge.clone());

        for vertex in edge.borrow().vertices() {
            let vertex_id = vertex.borrow().id();
            self.vertex_to_edge
                .entry(vertex_id)
                .or_default()
                .push(edge.clone());
        }
        true
    }

    /// Edges incident to the given vertex.
    pub fn connected_edges(&self, vertex_id: u64) -> &[EdgeRef] {
        self.vertex_to_edge
            .get(&vertex_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Install the prior residual used at damping initialization. Pass an
    /// empty vector to clear it.
    pub fn set_prior_residual(&mut self, prior_residual: DVector<f64>) {
        self.prior_residual = prior_residual;
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Total free dimension as of the last ordering pass.
    pub fn ordering_generic(&self) -> usize {
        self.ordering_generic
    }

    /// Current weighted squared residual cost.
    pub fn current_chi2(&self) -> f64 {
        self.current_chi2
    }

    /// Current damping factor.
    pub fn current_lambda(&self) -> f64 {
        self.current_lambda
    }

    /// Cumulative time spent in Hessian assembly.
    pub fn hessian_time(&self) -> Duration {
        self.hessian_time
    }

    /// Assign every non-fixed vertex a contiguous, disjoint offset range in
    /// the global state vector, walking vertices in ascending-id order.
    ///
    /// Fixed vertices keep [`INVALID_ORDERING`] and consume no Hessian
    /// rows/columns. Must be re-run whenever the vertex set changes.
    pub(crate) fn set_ordering(&mut self) {
        self.ordering_generic = 0;
        for vertex in self.vertices.values() {
            let mut v = vertex.borrow_mut();
            if v.is_fixed() {
                v.set_ordering_id(INVALID_ORDERING);
                continue;
            }
            v.set_ordering_id(self.ordering_generic);
            self.ordering_generic += v.local_dimension();
        }
    }

    /// Assemble the Gauss-Newton system `H = J^T W J`, `b = -J^T W r` from
    /// all edges at the current linearization point.
    ///
    /// Only the upper triangle (including the diagonal) is computed per
    /// edge; the lower triangle is its transpose. Mirrored off-diagonal
    /// blocks are exact; diagonal blocks can carry roundoff-level asymmetry
    /// from summation order. Resets `delta_x` to zero.
    pub(crate) fn make_hessian(&mut self) {
        let start = Instant::now();

        let size = self.ordering_generic;
        let mut hessian = DMatrix::<f64>::zeros(size, size);
        let mut b = DVector::<f64>::zeros(size);

        for edge in self.edges.values() {
            {
                let mut e = edge.borrow_mut();
                e.compute_residual();
                e.compute_jacobians();
            }

            let e = edge.borrow();
            let vertices = e.vertices();
            let jacobians = e.jacobians();
            debug_assert_eq!(
                jacobians.len(),
                vertices.len(),
                "edge {} must supply one Jacobian per vertex",
                e.id()
            );

            for i in 0..vertices.len() {
                let v_i = vertices[i].borrow();
                if v_i.is_fixed() {
                    // A fixed vertex's Jacobian columns are treated as zero.
                    continue;
                }
                let index_i = v_i.ordering_id();
                let dim_i = v_i.local_dimension();
                drop(v_i);

                let jtw = jacobians[i].transpose() * e.information();

                for j in i..vertices.len() {
                    let v_j = vertices[j].borrow();
                    if v_j.is_fixed() {
                        continue;
                    }
                    let index_j = v_j.ordering_id();
                    let dim_j = v_j.local_dimension();
                    drop(v_j);

                    let block = &jtw * &jacobians[j];
                    let mut h_ij = hessian.view_mut((index_i, index_j), (dim_i, dim_j));
                    h_ij += &block;
                    if j != i {
                        // Mirror into the lower triangle.
                        let block_t = block.transpose();
                        let mut h_ji = hessian.view_mut((index_j, index_i), (dim_j, dim_i));
                        h_ji += &block_t;
                    }
                }

                let mut b_i = b.rows_mut(index_i, dim_i);
                b_i -= &jtw * e.residual();
            }
        }

        self.hessian = hessian;
        self.b = b;
        self.delta_x = DVector::zeros(size);
        self.hessian_time += start.elapsed();
    }

    /// Apply the current increment to every non-fixed vertex.
    pub(crate) fn update_states(&mut self) {
        for vertex in self.vertices.values() {
            let mut v = vertex.borrow_mut();
            if v.is_fixed() {
                continue;
            }
            let delta = self
                .delta_x
                .rows(v.ordering_id(), v.local_dimension())
                .clone_owned();
            v.plus(&delta);
        }
    }

    /// Undo the last `update_states` by applying the negated increment.
    pub(crate) fn rollback_states(&mut self) {
        for vertex in self.vertices.values() {
            let mut v = vertex.borrow_mut();
            if v.is_fixed() {
                continue;
            }
            let delta = -self
                .delta_x
                .rows(v.ordering_id(), v.local_dimension())
                .clone_owned();
            v.plus(&delta);
        }
    }
}

impl Default for Problem {
    fn default() -> Self {
        Self::new()
    }
}
