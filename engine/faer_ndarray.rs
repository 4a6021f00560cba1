//! Dense factorizations on `ndarray` values, computed through `faer`.
//!
//! The engine only ever factors small or skinny matrices (the n×(k+p) sketch, the
//! (k+p)×d projected matrix and the stacked incremental update), so every routine
//! here returns the *thin* factors.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("SVD failed to converge on a {rows}x{cols} matrix")]
    SvdNoConvergence { rows: usize, cols: usize },
    #[error("cannot factor an empty {rows}x{cols} matrix")]
    Empty { rows: usize, cols: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    Array1::from_shape_fn(mat.nrows(), |i| mat[(i, 0)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

/// Zero-copy `faer` view of an `ndarray` matrix when the memory layout allows it.
pub struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let borrowed = array.as_slice_memory_order().and_then(|slice| {
            if array.is_standard_layout() {
                Some(MatRef::from_row_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else if array.t().is_standard_layout() {
                Some(MatRef::from_column_major_slice(
                    slice,
                    array.nrows(),
                    array.ncols(),
                ))
            } else {
                None
            }
        });
        let storage = match borrowed {
            Some(view) => FaerStorage::Borrowed(view),
            None => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

/// Thin singular value decomposition `A = U diag(S) Vt`.
///
/// For an m×n input, `U` is m×r, `S` has r entries in non-increasing order and `Vt`
/// is r×n, with r = min(m, n).
pub trait FaerThinSvd {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerThinSvd for ArrayBase<S, Ix2> {
    fn thin_svd(&self) -> Result<(Array2<f64>, Array1<f64>, Array2<f64>), FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows == 0 || cols == 0 {
            return Err(FaerLinalgError::Empty { rows, cols });
        }
        let rank = rows.min(cols);

        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();

        let mut singular = Diag::<f64>::zeros(rank);
        let mut u_storage = Mat::<f64>::zeros(rows, rank);
        let mut v_storage = Mat::<f64>::zeros(cols, rank);

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            ComputeSvdVectors::Thin,
            ComputeSvdVectors::Thin,
            par,
            Default::default(),
        ));
        let mut stack = MemStack::new(&mut mem);

        svd::svd(
            faer_mat,
            singular.as_mut(),
            Some(u_storage.as_mut()),
            Some(v_storage.as_mut()),
            par,
            &mut stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence { rows, cols })?;

        let singular_values = diag_to_array(singular.as_ref());
        let u = mat_to_array(u_storage.as_ref());
        let v_ref = v_storage.as_ref();
        let vt = Array2::from_shape_fn((v_ref.ncols(), v_ref.nrows()), |(i, j)| v_ref[(j, i)]);

        Ok((u, singular_values, vt))
    }
}

/// Orthonormal basis for the column space of a tall or square matrix: the `Q` factor
/// of a thin QR decomposition, shaped m×min(m, n).
pub trait FaerOrthonormalize {
    fn orthonormal_basis(&self) -> Result<Array2<f64>, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerOrthonormalize for ArrayBase<S, Ix2> {
    fn orthonormal_basis(&self) -> Result<Array2<f64>, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows == 0 || cols == 0 {
            return Err(FaerLinalgError::Empty { rows, cols });
        }
        let faer_view = FaerArrayView::new(self);
        let qr = faer_view.as_ref().qr();
        let q = qr.compute_thin_Q();
        Ok(mat_to_array(q.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn thin_svd_reconstructs_input() {
        let a = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let (u, s, vt) = a.thin_svd().unwrap();

        assert_eq!(u.shape(), &[3, 2]);
        assert_eq!(s.len(), 2);
        assert_eq!(vt.shape(), &[2, 2]);
        assert!(s[0] >= s[1]);

        let reconstructed = u.dot(&Array2::from_diag(&s)).dot(&vt);
        for (lhs, rhs) in reconstructed.iter().zip(a.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
        }
    }

    #[test]
    fn thin_svd_of_wide_matrix_has_short_vt() {
        let a = array![[1.0, 0.0, 2.0, -1.0], [0.5, 3.0, 0.0, 1.0]];
        let (u, s, vt) = a.thin_svd().unwrap();
        assert_eq!(u.shape(), &[2, 2]);
        assert_eq!(s.len(), 2);
        assert_eq!(vt.shape(), &[2, 4]);

        let gram = vt.dot(&vt.t());
        assert_abs_diff_eq!(gram[(0, 0)], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(gram[(1, 1)], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(gram[(0, 1)], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn orthonormal_basis_spans_columns() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Array2::from_shape_fn((40, 6), |_| rng.gen_range(-1.0..1.0));
        let q = a.orthonormal_basis().unwrap();
        assert_eq!(q.shape(), &[40, 6]);

        let gram = q.t().dot(&q);
        for i in 0..6 {
            for j in 0..6 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(gram[(i, j)], expected, epsilon = 1e-10);
            }
        }

        let projected = q.dot(&q.t().dot(&a));
        for (lhs, rhs) in projected.iter().zip(a.iter()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-9);
        }
    }

    #[test]
    fn empty_input_is_rejected() {
        let a = Array2::<f64>::zeros((0, 3));
        assert!(matches!(
            a.thin_svd(),
            Err(FaerLinalgError::Empty { rows: 0, cols: 3 })
        ));
        assert!(a.orthonormal_basis().is_err());
    }
}
