//! Three-pass randomized SVD over standardized chunks.
//!
//! The sketch pass multiplies each chunk by a seeded Gaussian test matrix and stacks
//! the results into `Y` (n×l); its thin QR gives the row-space basis `Q`. The
//! projection pass folds `B += chunkᵀ · Q[rows]` (d×l), and the exact SVD of the small
//! `Bᵀ` is lifted back through `Q`. Power iterations reuse both accumulators: a
//! projection pass followed by a sketch pass against the orthonormalized `B`.

use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::faer_ndarray::{FaerLinalgError, FaerOrthonormalize, FaerThinSvd};

#[derive(Debug, Error)]
pub enum RandomizedError {
    #[error("chunk has {found} standardized columns but the test matrix has {expected} rows")]
    WidthMismatch { expected: usize, found: usize },
    #[error("projection pass reached row {needed} but the sketch basis only covers {basis_rows} rows")]
    RowOverflow { basis_rows: usize, needed: usize },
    #[error("projection pass covered {found} rows but the sketch basis has {expected}")]
    Incomplete { expected: usize, found: usize },
    #[error("sketch pass saw no rows")]
    EmptySketch,
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}

/// Sizes and seed of one randomized run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RandomizedParams {
    pub components: usize,
    pub oversampling: usize,
    pub power_iterations: usize,
    pub seed: u64,
}

impl RandomizedParams {
    /// Sketch width `l = k + p`.
    pub fn sketch_width(&self) -> usize {
        self.components + self.oversampling
    }
}

/// Standard-normal `rows × cols` matrix drawn from a `StdRng` seeded with `seed`.
pub fn gaussian_test_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((rows, cols), || rng.sample::<f64, _>(StandardNormal))
}

/// Accumulates `Y = X · Ω` one chunk at a time.
pub struct RangeFinder {
    test_matrix: Array2<f64>,
    sketch: Vec<f64>,
    rows: usize,
}

impl RangeFinder {
    /// Sketch against a fresh Gaussian Ω of shape `n_active × width`.
    pub fn new(n_active: usize, width: usize, seed: u64, rows_hint: Option<usize>) -> Self {
        Self::with_test_matrix(gaussian_test_matrix(n_active, width, seed), rows_hint)
    }

    /// Sketch against a caller-provided test matrix; power iterations pass the
    /// orthonormalized projection here.
    pub fn with_test_matrix(test_matrix: Array2<f64>, rows_hint: Option<usize>) -> Self {
        let capacity = rows_hint.unwrap_or(0).saturating_mul(test_matrix.ncols());
        Self {
            test_matrix,
            sketch: Vec::with_capacity(capacity),
            rows: 0,
        }
    }

    pub fn width(&self) -> usize {
        self.test_matrix.ncols()
    }

    pub fn absorb(&mut self, standardized: ArrayView2<'_, f64>) -> Result<(), RandomizedError> {
        if standardized.ncols() != self.test_matrix.nrows() {
            return Err(RandomizedError::WidthMismatch {
                expected: self.test_matrix.nrows(),
                found: standardized.ncols(),
            });
        }
        let product = standardized.dot(&self.test_matrix);
        self.sketch.extend(product.iter().copied());
        self.rows += standardized.nrows();
        Ok(())
    }

    /// The raw sketch `Y`.
    pub fn into_sketch(self) -> Result<Array2<f64>, RandomizedError> {
        let width = self.width();
        Array2::from_shape_vec((self.rows, width), self.sketch)
            .map_err(|_| RandomizedError::EmptySketch)
    }

    /// Orthonormal basis `Q` of the sketch's column space, n×min(n, l).
    pub fn finish(self) -> Result<Array2<f64>, RandomizedError> {
        if self.rows == 0 {
            return Err(RandomizedError::EmptySketch);
        }
        let sketch = self.into_sketch()?;
        Ok(sketch.orthonormal_basis()?)
    }
}

/// Accumulates `B = Σ chunkᵀ · Q[cursor..cursor + rows]`.
pub struct ProjectionAccumulator<'q> {
    basis: ArrayView2<'q, f64>,
    projected: Array2<f64>,
    cursor: usize,
}

impl<'q> ProjectionAccumulator<'q> {
    pub fn new(basis: ArrayView2<'q, f64>, n_active: usize) -> Self {
        Self {
            projected: Array2::zeros((n_active, basis.ncols())),
            basis,
            cursor: 0,
        }
    }

    pub fn absorb(&mut self, standardized: ArrayView2<'_, f64>) -> Result<(), RandomizedError> {
        if standardized.ncols() != self.projected.nrows() {
            return Err(RandomizedError::WidthMismatch {
                expected: self.projected.nrows(),
                found: standardized.ncols(),
            });
        }
        let end = self.cursor + standardized.nrows();
        if end > self.basis.nrows() {
            return Err(RandomizedError::RowOverflow {
                basis_rows: self.basis.nrows(),
                needed: end,
            });
        }
        let q_rows = self.basis.slice(s![self.cursor..end, ..]);
        ndarray::linalg::general_mat_mul(1.0, &standardized.t(), &q_rows, 1.0, &mut self.projected);
        self.cursor = end;
        Ok(())
    }

    /// The accumulated `B` (d_active × l). Fails unless every basis row was consumed.
    pub fn finish(self) -> Result<Array2<f64>, RandomizedError> {
        if self.cursor != self.basis.nrows() {
            return Err(RandomizedError::Incomplete {
                expected: self.basis.nrows(),
                found: self.cursor,
            });
        }
        Ok(self.projected)
    }
}

/// Lifted factors `X ≈ U · diag(S) · Vt` of the standardized table.
///
/// All `l = k + p` factors of the sketch are kept (at least k, zero-padded when the
/// decomposition is rank deficient); only the leading k make up the embedding.
#[derive(Clone, Debug, PartialEq)]
pub struct RandomizedFactors {
    /// n×l left singular vectors.
    pub u: Array2<f64>,
    /// l singular values, non-increasing.
    pub s: Array1<f64>,
    /// l×d_active right singular vectors.
    pub vt: Array2<f64>,
    components: usize,
}

impl RandomizedFactors {
    pub fn new(u: Array2<f64>, s: Array1<f64>, vt: Array2<f64>, components: usize) -> Self {
        assert!(
            components <= s.len() && u.ncols() == s.len() && vt.nrows() == s.len(),
            "factor shapes disagree: U {:?}, S {}, Vt {:?}, k = {components}",
            u.dim(),
            s.len(),
            vt.dim()
        );
        Self { u, s, vt, components }
    }

    /// Number of requested components k.
    pub fn components(&self) -> usize {
        self.components
    }

    /// The leading k factors.
    pub fn truncated(&self) -> RandomizedFactors {
        let k = self.components;
        RandomizedFactors {
            u: self.u.slice(s![.., ..k]).to_owned(),
            s: self.s.slice(s![..k]).to_owned(),
            vt: self.vt.slice(s![..k, ..]).to_owned(),
            components: k,
        }
    }

    /// `U[:, :k] * S[:k]`, one row per input row.
    pub fn embedding(&self) -> Array2<f64> {
        let k = self.components;
        &self.u.slice(s![.., ..k]) * &self.s.slice(s![..k]).insert_axis(Axis(0))
    }
}

/// Exact thin SVD of the small projected matrix, lifted back to row space.
#[derive(Clone, Copy, Debug)]
pub struct SmallSvdSolver {
    components: usize,
}

impl SmallSvdSolver {
    pub fn new(components: usize) -> Self {
        Self { components }
    }

    /// `Bᵀ = Ũ S Vt`, `U = Q Ũ`.
    ///
    /// Every lifted factor is returned. When the decomposition has fewer than k
    /// factors the missing components are zero singular values with zero vectors.
    pub fn solve(
        &self,
        basis: ArrayView2<'_, f64>,
        projected: ArrayView2<'_, f64>,
    ) -> Result<RandomizedFactors, RandomizedError> {
        let k = self.components;
        let n = basis.nrows();
        let d = projected.nrows();

        let (u_small, singular, vt_full) = projected.t().thin_svd()?;
        let u_full = basis.dot(&u_small);

        let r = singular.len();
        if r >= k {
            return Ok(RandomizedFactors::new(u_full, singular, vt_full, k));
        }
        log::warn!("decomposition has rank {r}; components {} to {k} are zero", r + 1);
        let mut u = Array2::zeros((n, k));
        let mut s = Array1::zeros(k);
        let mut vt = Array2::zeros((k, d));
        u.slice_mut(s![.., ..r]).assign(&u_full);
        s.slice_mut(s![..r]).assign(&singular);
        vt.slice_mut(s![..r, ..]).assign(&vt_full);
        Ok(RandomizedFactors::new(u, s, vt, k))
    }
}
