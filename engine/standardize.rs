//! Zero-mean, unit-variance scaling fitted from finalized moments.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::moments::FeatureMoments;

const PARALLEL_ROW_THRESHOLD: usize = 64;

/// What happens to a feature whose variance does not exceed the configured epsilon.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroVariancePolicy {
    /// Remove the feature from the active set before any projection.
    Drop,
    /// Keep the feature and emit 0.0 for every row.
    #[default]
    ZeroFill,
}

#[derive(Debug, Error, PartialEq)]
pub enum StandardizeError {
    #[error("chunk has {found} feature columns but the standardizer was fitted on {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("variance epsilon must be finite and non-negative, got {0}")]
    InvalidEpsilon(f64),
}

/// Per-feature affine map `(x - mean) * inv_scale` over the active features.
///
/// An `inv_scale` of zero marks a zero-filled feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    n_features: usize,
    active: Vec<usize>,
    mean: Array1<f64>,
    scale: Array1<f64>,
    inv_scale: Array1<f64>,
    policy: ZeroVariancePolicy,
}

impl Standardizer {
    pub fn fit(
        moments: &FeatureMoments,
        epsilon: f64,
        policy: ZeroVariancePolicy,
    ) -> Result<Self, StandardizeError> {
        if !epsilon.is_finite() || epsilon < 0.0 {
            return Err(StandardizeError::InvalidEpsilon(epsilon));
        }

        let n_features = moments.n_features();
        let mut active = Vec::with_capacity(n_features);
        let mut mean = Vec::with_capacity(n_features);
        let mut scale = Vec::with_capacity(n_features);
        let mut inv_scale = Vec::with_capacity(n_features);

        for (j, (&m, &v)) in moments.mean.iter().zip(moments.variance.iter()).enumerate() {
            let degenerate = !(v > epsilon) || !v.is_finite();
            match (degenerate, policy) {
                (true, ZeroVariancePolicy::Drop) => continue,
                (true, ZeroVariancePolicy::ZeroFill) => {
                    active.push(j);
                    mean.push(if m.is_finite() { m } else { 0.0 });
                    scale.push(0.0);
                    inv_scale.push(0.0);
                }
                (false, _) => {
                    let sd = v.sqrt();
                    active.push(j);
                    mean.push(m);
                    scale.push(sd);
                    inv_scale.push(sd.recip());
                }
            }
        }

        Ok(Self {
            n_features,
            active,
            mean: Array1::from(mean),
            scale: Array1::from(scale),
            inv_scale: Array1::from(inv_scale),
            policy,
        })
    }

    /// Width of the raw chunks this standardizer accepts.
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Width of the standardized output.
    pub fn n_active(&self) -> usize {
        self.active.len()
    }

    /// Raw column indices kept in the output, in output order.
    pub fn active_features(&self) -> &[usize] {
        &self.active
    }

    /// Raw column indices removed by [`ZeroVariancePolicy::Drop`].
    pub fn dropped_features(&self) -> Vec<usize> {
        let mut kept = self.active.iter().copied().peekable();
        (0..self.n_features)
            .filter(|j| {
                if kept.peek() == Some(j) {
                    kept.next();
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    /// Raw column indices zero-filled by [`ZeroVariancePolicy::ZeroFill`].
    pub fn zero_filled_features(&self) -> Vec<usize> {
        self.active
            .iter()
            .zip(self.inv_scale.iter())
            .filter(|&(_, &inv)| inv == 0.0)
            .map(|(&j, _)| j)
            .collect()
    }

    /// Standardizes a raw chunk into a new `rows × n_active` matrix.
    ///
    /// Non-finite cells are missing values and become 0.0.
    pub fn transform_chunk(&self, chunk: ArrayView2<'_, f64>) -> Result<Array2<f64>, StandardizeError> {
        if chunk.ncols() != self.n_features {
            return Err(StandardizeError::WidthMismatch {
                expected: self.n_features,
                found: chunk.ncols(),
            });
        }
        let mut out = Array2::zeros((chunk.nrows(), self.n_active()));

        let fill_row = |mut out_row: ndarray::ArrayViewMut1<'_, f64>, raw_row: ArrayView1<'_, f64>| {
            Zip::from(&mut out_row)
                .and(&self.active[..])
                .and(&self.mean)
                .and(&self.inv_scale)
                .for_each(|slot, &j, &m, &inv| {
                    let raw = raw_row[j];
                    *slot = if inv == 0.0 || !raw.is_finite() {
                        0.0
                    } else {
                        (raw - m) * inv
                    };
                });
        };

        if chunk.nrows() >= PARALLEL_ROW_THRESHOLD {
            out.axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(chunk.axis_iter(Axis(0)).into_par_iter())
                .for_each(|(out_row, raw_row)| fill_row(out_row, raw_row));
        } else {
            out.axis_iter_mut(Axis(0))
                .zip(chunk.axis_iter(Axis(0)))
                .for_each(|(out_row, raw_row)| fill_row(out_row, raw_row));
        }
        Ok(out)
    }

    /// Maps standardized values of the active features back to raw units.
    pub fn inverse_transform(&self, standardized: ArrayView2<'_, f64>) -> Result<Array2<f64>, StandardizeError> {
        if standardized.ncols() != self.n_active() {
            return Err(StandardizeError::WidthMismatch {
                expected: self.n_active(),
                found: standardized.ncols(),
            });
        }
        let mut raw = standardized.to_owned();
        raw.axis_iter_mut(Axis(0)).for_each(|mut row| {
            Zip::from(&mut row)
                .and(&self.mean)
                .and(&self.scale)
                .for_each(|value, &m, &sd| *value = *value * sd + m);
        });
        Ok(raw)
    }
}
