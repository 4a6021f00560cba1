//! Streaming per-feature mean and variance.
//!
//! Chunks are folded into a [`MomentState`] with the pairwise (Chan) form of
//! Welford's update. Non-finite cells are missing observations and are excluded per
//! feature, so each feature carries its own count.

use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Column count above which per-column statistics are computed on the rayon pool.
const PARALLEL_COLUMN_THRESHOLD: usize = 32;

#[derive(Debug, Error, PartialEq)]
pub enum MomentError {
    #[error("chunk has {found} feature columns but the accumulator tracks {expected}")]
    WidthMismatch { expected: usize, found: usize },
}

/// Mean, population variance and finite-cell count of one chunk.
#[derive(Clone, Debug)]
pub struct ChunkMoments {
    pub counts: Vec<u64>,
    pub mean: Array1<f64>,
    pub variance: Array1<f64>,
}

impl ChunkMoments {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }
}

/// Running accumulator `(count, mean, M2)` per feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    counts: Vec<u64>,
    mean: Array1<f64>,
    m2: Array1<f64>,
}

/// Frozen moments of a finished pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureMoments {
    pub counts: Vec<u64>,
    pub mean: Array1<f64>,
    /// Biased (population) variance, `M2 / n`.
    pub variance: Array1<f64>,
}

impl FeatureMoments {
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }
}

impl MomentState {
    pub fn empty(n_features: usize) -> Self {
        Self {
            counts: vec![0; n_features],
            mean: Array1::zeros(n_features),
            m2: Array1::zeros(n_features),
        }
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    /// Per-feature statistics of a single chunk, ignoring non-finite cells.
    pub fn observe(chunk: ArrayView2<'_, f64>) -> ChunkMoments {
        let n_features = chunk.ncols();
        let column_stats = |column: ArrayView1<'_, f64>| -> (u64, f64, f64) {
            let mut count = 0u64;
            let mut mean = 0.0;
            let mut m2 = 0.0;
            for &value in column.iter().filter(|v| v.is_finite()) {
                count += 1;
                let delta = value - mean;
                mean += delta / count as f64;
                m2 += delta * (value - mean);
            }
            let variance = if count > 0 { m2 / count as f64 } else { 0.0 };
            (count, mean, variance)
        };

        let stats: Vec<(u64, f64, f64)> = if n_features >= PARALLEL_COLUMN_THRESHOLD {
            (0..n_features)
                .into_par_iter()
                .map(|j| column_stats(chunk.column(j)))
                .collect()
        } else {
            chunk.columns().into_iter().map(column_stats).collect()
        };

        let mut counts = Vec::with_capacity(n_features);
        let mut mean = Array1::zeros(n_features);
        let mut variance = Array1::zeros(n_features);
        for (j, (count, m, v)) in stats.into_iter().enumerate() {
            counts.push(count);
            mean[j] = m;
            variance[j] = v;
        }
        ChunkMoments {
            counts,
            mean,
            variance,
        }
    }

    /// Folds one chunk's `(mean, variance, count)` into the accumulator.
    ///
    /// Features with a zero chunk count are left untouched.
    pub fn merge_chunk(
        self,
        chunk_mean: ArrayView1<'_, f64>,
        chunk_variance: ArrayView1<'_, f64>,
        chunk_counts: &[u64],
    ) -> Result<Self, MomentError> {
        let expected = self.n_features();
        for found in [chunk_mean.len(), chunk_variance.len(), chunk_counts.len()] {
            if found != expected {
                return Err(MomentError::WidthMismatch { expected, found });
            }
        }

        let Self {
            mut counts,
            mut mean,
            mut m2,
        } = self;

        Zip::from(&mut mean)
            .and(&mut m2)
            .and(&chunk_mean)
            .and(&chunk_variance)
            .and(&mut counts[..])
            .and(chunk_counts)
            .for_each(|mean_a, m2_a, &mean_b, &var_b, n_a, &n_b| {
                combine(n_a, mean_a, m2_a, n_b, mean_b, var_b * n_b as f64);
            });

        Ok(Self { counts, mean, m2 })
    }

    /// Convenience for a chunk of `rows` complete rows.
    pub fn merge_uniform(
        self,
        chunk_mean: ArrayView1<'_, f64>,
        chunk_variance: ArrayView1<'_, f64>,
        rows: u64,
    ) -> Result<Self, MomentError> {
        let counts = vec![rows; chunk_mean.len()];
        self.merge_chunk(chunk_mean, chunk_variance, &counts)
    }

    /// Observes and folds a raw chunk in one step.
    pub fn update(self, chunk: ArrayView2<'_, f64>) -> Result<Self, MomentError> {
        if chunk.nrows() == 0 {
            return Ok(self);
        }
        let moments = Self::observe(chunk);
        self.merge_chunk(moments.mean.view(), moments.variance.view(), &moments.counts)
    }

    /// Associative reduction of two accumulators.
    pub fn merge(self, other: &MomentState) -> Result<Self, MomentError> {
        let expected = self.n_features();
        if other.n_features() != expected {
            return Err(MomentError::WidthMismatch {
                expected,
                found: other.n_features(),
            });
        }
        let Self {
            mut counts,
            mut mean,
            mut m2,
        } = self;
        Zip::from(&mut mean)
            .and(&mut m2)
            .and(&other.mean)
            .and(&other.m2)
            .and(&mut counts[..])
            .and(&other.counts[..])
            .for_each(|mean_a, m2_a, &mean_b, &m2_b, n_a, &n_b| {
                combine(n_a, mean_a, m2_a, n_b, mean_b, m2_b);
            });
        Ok(Self { counts, mean, m2 })
    }

    pub fn finalize(&self) -> FeatureMoments {
        let variance = Array1::from_iter(self.m2.iter().zip(&self.counts).map(|(&m2, &n)| {
            if n > 0 { (m2 / n as f64).max(0.0) } else { 0.0 }
        }));
        FeatureMoments {
            counts: self.counts.clone(),
            mean: self.mean.clone(),
            variance,
        }
    }
}

#[inline]
fn combine(n_a: &mut u64, mean_a: &mut f64, m2_a: &mut f64, n_b: u64, mean_b: f64, m2_b: f64) {
    if n_b == 0 {
        return;
    }
    if *n_a == 0 {
        *n_a = n_b;
        *mean_a = mean_b;
        *m2_a = m2_b;
        return;
    }
    let na = *n_a as f64;
    let nb = n_b as f64;
    let n = na + nb;
    let delta = mean_b - *mean_a;
    *mean_a += delta * nb / n;
    *m2_a += m2_b + delta * delta * na * nb / n;
    *n_a += n_b;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Axis, array, s};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn skewed_matrix(rows: usize, cols: usize) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(0xC0FFEE);
        Array2::from_shape_fn((rows, cols), |(_, j)| {
            1.0e3 * (j as f64 + 1.0) + rng.gen_range(-3.0..3.0)
        })
    }

    fn direct(x: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
        let mean = x.mean_axis(Axis(0)).unwrap();
        let var = x.var_axis(Axis(0), 0.0);
        (mean, var)
    }

    #[test]
    fn chunked_moments_match_direct_for_any_partition() {
        let x = skewed_matrix(311, 40);
        let (mean, var) = direct(&x);

        for sizes in [vec![311], vec![1, 310], vec![37; 9], vec![150, 1, 1, 159], vec![5, 300, 6]] {
            let mut state = MomentState::empty(40);
            let mut start = 0;
            for size in sizes {
                let end = (start + size).min(311);
                state = state.update(x.slice(s![start..end, ..])).unwrap();
                start = end;
            }
            let moments = state.finalize();
            for j in 0..40 {
                assert_relative_eq!(moments.mean[j], mean[j], max_relative = 1e-9);
                assert_relative_eq!(moments.variance[j], var[j], max_relative = 1e-9);
                assert_eq!(moments.counts[j], 311);
            }
        }
    }

    #[test]
    fn merge_is_associative_up_to_rounding() {
        let x = skewed_matrix(90, 3);
        let a = MomentState::empty(3).update(x.slice(s![..10, ..])).unwrap();
        let b = MomentState::empty(3).update(x.slice(s![10..70, ..])).unwrap();
        let c = MomentState::empty(3).update(x.slice(s![70.., ..])).unwrap();

        let left = a.clone().merge(&b).unwrap().merge(&c).unwrap().finalize();
        let right = a.merge(&b.merge(&c).unwrap()).unwrap().finalize();
        for j in 0..3 {
            assert_relative_eq!(left.mean[j], right.mean[j], max_relative = 1e-12);
            assert_relative_eq!(left.variance[j], right.variance[j], max_relative = 1e-9);
        }
    }

    #[test]
    fn merge_chunk_applies_the_pairwise_rule() {
        let state = MomentState::empty(1)
            .merge_uniform(array![2.0].view(), array![1.0].view(), 4)
            .unwrap()
            .merge_uniform(array![5.0].view(), array![0.0].view(), 2)
            .unwrap();
        let moments = state.finalize();
        // delta = 3, n = 6, mean = 2 + 3 * 2 / 6 = 3, M2 = 4 + 0 + 9 * 8 / 6 = 16
        assert_relative_eq!(moments.mean[0], 3.0);
        assert_relative_eq!(moments.variance[0], 16.0 / 6.0);
    }

    #[test]
    fn empty_chunks_are_no_ops() {
        let x = array![[1.0, 2.0], [3.0, 6.0]];
        let base = MomentState::empty(2).update(x.view()).unwrap();
        let after = base
            .clone()
            .update(Array2::<f64>::zeros((0, 2)).view())
            .unwrap()
            .merge_uniform(array![9.0, 9.0].view(), array![1.0, 1.0].view(), 0)
            .unwrap();
        assert_eq!(base, after);
    }

    #[test]
    fn missing_cells_are_excluded_per_feature() {
        let x = array![[1.0, f64::NAN], [3.0, 10.0], [5.0, 20.0]];
        let moments = MomentState::empty(2).update(x.view()).unwrap().finalize();
        assert_eq!(moments.counts, vec![3, 2]);
        assert_relative_eq!(moments.mean[1], 15.0);
        assert_relative_eq!(moments.variance[1], 25.0);
    }

    #[test]
    fn constant_column_has_zero_variance() {
        let x = Array2::from_elem((17, 1), 7.0);
        let moments = MomentState::empty(1).update(x.view()).unwrap().finalize();
        assert_eq!(moments.variance[0], 0.0);
        assert_eq!(moments.mean[0], 7.0);
    }

    #[test]
    fn width_mismatch_is_reported() {
        let err = MomentState::empty(3)
            .merge_uniform(array![1.0].view(), array![1.0].view(), 2)
            .unwrap_err();
        assert_eq!(err, MomentError::WidthMismatch { expected: 3, found: 1 });
    }
}
