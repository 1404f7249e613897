//! Vertex and edge contracts for the factor graph
//!
//! Concrete vertex/edge types (reprojection, preintegration, priors, ...)
//! live with the caller; the solver only sees these object-safe traits.
//! Both sides of the graph share ownership of the same cells, so vertices
//! are handed around as `Rc<RefCell<dyn Vertex>>`.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};

/// Shared handle to an optimization variable.
pub type VertexRef = Rc<RefCell<dyn Vertex>>;

/// Shared handle to a measurement constraint.
pub type EdgeRef = Rc<RefCell<dyn Edge>>;

/// Sentinel for a vertex that has not been assigned a slot in the global
/// state vector.
pub const INVALID_ORDERING: usize = usize::MAX;

/// An optimization variable (state) in the factor graph.
///
/// A vertex owns its storage parameters and knows how to apply an increment
/// expressed in its minimal (local) parameterization. The local dimension
/// may be smaller than the storage dimension, e.g. for over-parameterized
/// rotations.
pub trait Vertex {
    /// Unique vertex id.
    fn id(&self) -> u64;

    /// Current storage-space parameters.
    fn params(&self) -> &DVector<f64>;

    /// Size of the minimal parameterization. Defaults to the storage
    /// dimension.
    fn local_dimension(&self) -> usize {
        self.params().len()
    }

    /// Offset of this vertex in the global state vector.
    ///
    /// Assigned exclusively by [`Problem::set_ordering`]; holds
    /// [`INVALID_ORDERING`] until then (and permanently for fixed vertices).
    ///
    /// [`Problem::set_ordering`]: crate::problem::Problem
    fn ordering_id(&self) -> usize;

    /// Record the ordering offset. Called by the solver only.
    fn set_ordering_id(&mut self, ordering_id: usize);

    /// Fixed vertices are held constant: they contribute no Jacobian
    /// columns/rows and receive no updates.
    fn is_fixed(&self) -> bool {
        false
    }

    /// Apply an increment in local coordinates: `x <- x boxplus delta`.
    ///
    /// `delta` has length `local_dimension()`. Passing the negated delta
    /// must undo the update (up to floating-point roundtrip).
    fn plus(&mut self, delta: &DVector<f64>);
}

/// A measurement constraint connecting one or more vertices.
///
/// The solver recomputes residual and Jacobians on demand; implementations
/// cache them internally between `compute_*` and the accessors but must not
/// assume any particular call ordering beyond "compute before read".
pub trait Edge {
    /// Unique edge id.
    fn id(&self) -> u64;

    /// Associated vertices, in the same order as `jacobians()`.
    fn vertices(&self) -> &[VertexRef];

    /// Recompute the residual at the current vertex states.
    fn compute_residual(&mut self);

    /// Recompute the per-vertex Jacobian blocks at the current vertex states.
    fn compute_jacobians(&mut self);

    /// Residual as of the last `compute_residual` call.
    fn residual(&self) -> &DVector<f64>;

    /// Jacobian blocks as of the last `compute_jacobians` call, one per
    /// associated vertex.
    fn jacobians(&self) -> &[DMatrix<f64>];

    /// Information (inverse covariance) weighting of the residual.
    fn information(&self) -> &DMatrix<f64>;

    /// Weighted squared residual norm `r^T * Information * r`.
    fn chi2(&self) -> f64 {
        let r = self.residual();
        (r.transpose() * self.information() * r)[(0, 0)]
    }
}
