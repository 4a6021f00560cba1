//! Incremental PCA: a rank-k model updated one batch at a time.
//!
//! Each update stacks the current components (scaled by their singular values), the
//! batch centered on its own mean and a mean-correction row, and re-factors the
//! stack with a thin SVD. The result depends on batch order and size.

use std::fs;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView2, Axis, concatenate, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedding::{EmbeddingError, write_atomically};
use crate::faer_ndarray::{FaerLinalgError, FaerThinSvd};
use crate::moments::{MomentError, MomentState};
use crate::standardize::Standardizer;

#[derive(Debug, Error)]
pub enum IncrementalError {
    #[error("batch of {rows} rows cannot fit {components} components; batches need at least as many rows as components")]
    InsufficientRows { rows: usize, components: usize },
    #[error("{components} components requested but only {features} features are active")]
    TooManyComponents { components: usize, features: usize },
    #[error("batch has {found} features but the model has {expected}")]
    WidthMismatch { expected: usize, found: usize },
    #[error("model has not been fitted")]
    NotFitted,
    #[error(transparent)]
    Moments(#[from] MomentError),
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize model to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error(transparent)]
    Write(#[from] EmbeddingError),
}

/// Fitted state of an incremental PCA.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncrementalPca {
    n_components: usize,
    n_features: usize,
    n_samples_seen: u64,
    /// Running per-feature moments of everything fitted so far.
    moments: MomentState,
    /// k×d principal axes, one per row.
    components: Array2<f64>,
    singular_values: Array1<f64>,
    explained_variance: Array1<f64>,
    explained_variance_ratio: Array1<f64>,
    /// Mean explained variance of the discarded factors of the last update.
    noise_variance: f64,
}

impl IncrementalPca {
    pub fn new(n_components: usize, n_features: usize) -> Result<Self, IncrementalError> {
        if n_components > n_features {
            return Err(IncrementalError::TooManyComponents {
                components: n_components,
                features: n_features,
            });
        }
        Ok(Self {
            n_components,
            n_features,
            n_samples_seen: 0,
            moments: MomentState::empty(n_features),
            components: Array2::zeros((0, n_features)),
            singular_values: Array1::zeros(0),
            explained_variance: Array1::zeros(0),
            explained_variance_ratio: Array1::zeros(0),
            noise_variance: 0.0,
        })
    }

    pub fn n_components(&self) -> usize {
        self.n_components
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_samples_seen(&self) -> u64 {
        self.n_samples_seen
    }

    pub fn is_fitted(&self) -> bool {
        self.n_samples_seen > 0
    }

    pub fn components(&self) -> ArrayView2<'_, f64> {
        self.components.view()
    }

    pub fn singular_values(&self) -> &Array1<f64> {
        &self.singular_values
    }

    pub fn explained_variance(&self) -> &Array1<f64> {
        &self.explained_variance
    }

    pub fn explained_variance_ratio(&self) -> &Array1<f64> {
        &self.explained_variance_ratio
    }

    pub fn noise_variance(&self) -> f64 {
        self.noise_variance
    }

    /// Running per-feature mean of all fitted rows.
    pub fn mean(&self) -> Array1<f64> {
        self.moments.finalize().mean
    }

    /// Running per-feature population variance of all fitted rows.
    pub fn variance(&self) -> Array1<f64> {
        self.moments.finalize().variance
    }

    fn check_width(&self, batch: &ArrayView2<'_, f64>) -> Result<(), IncrementalError> {
        if batch.ncols() != self.n_features {
            return Err(IncrementalError::WidthMismatch {
                expected: self.n_features,
                found: batch.ncols(),
            });
        }
        Ok(())
    }

    /// Folds one batch into the model.
    pub fn partial_fit(&mut self, batch: ArrayView2<'_, f64>) -> Result<(), IncrementalError> {
        self.check_width(&batch)?;
        let n_batch = batch.nrows();
        if n_batch < self.n_components || n_batch == 0 {
            return Err(IncrementalError::InsufficientRows {
                rows: n_batch,
                components: self.n_components,
            });
        }

        let previous_mean = self.mean();
        let n_seen = self.n_samples_seen as f64;
        let moments = self.moments.clone().update(batch)?;
        let n_total = self.n_samples_seen + n_batch as u64;
        let total = moments.finalize();

        let batch_mean = batch
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.n_features));
        let centered = &batch - &batch_mean.view().insert_axis(Axis(0));

        let stacked = if self.is_fitted() {
            let scaled_components =
                &self.components * &self.singular_values.view().insert_axis(Axis(1));
            let correction_scale = (n_seen * n_batch as f64 / n_total as f64).sqrt();
            let correction = (&previous_mean - &batch_mean) * correction_scale;
            concatenate(
                Axis(0),
                &[
                    scaled_components.view(),
                    centered.view(),
                    correction.view().insert_axis(Axis(0)),
                ],
            )
            .map_err(|_| IncrementalError::WidthMismatch {
                expected: self.n_features,
                found: self.components.ncols(),
            })?
        } else {
            centered
        };

        let (mut u, singular, mut vt) = stacked.thin_svd()?;
        flip_signs_by_loadings(&mut u, &mut vt);

        let k = self.n_components;
        let denominator = (n_total as f64 - 1.0).max(1.0);
        let explained = singular.mapv(|sv| sv * sv / denominator);
        let total_variance: f64 = total.variance.sum() * n_total as f64;
        let ratio = if total_variance > 0.0 {
            singular.mapv(|sv| sv * sv / total_variance)
        } else {
            Array1::zeros(singular.len())
        };

        self.noise_variance = if k < singular.len() {
            explained.slice(s![k..]).mean().unwrap_or(0.0)
        } else {
            0.0
        };
        self.components = vt.slice(s![..k, ..]).to_owned();
        self.singular_values = singular.slice(s![..k]).to_owned();
        self.explained_variance = explained.slice(s![..k]).to_owned();
        self.explained_variance_ratio = ratio.slice(s![..k]).to_owned();
        self.moments = moments;
        self.n_samples_seen = n_total;
        Ok(())
    }

    /// Projects rows onto the current axes: `(x - mean) · componentsᵀ`.
    pub fn transform(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, IncrementalError> {
        if !self.is_fitted() {
            return Err(IncrementalError::NotFitted);
        }
        self.check_width(&batch)?;
        let mean = self.mean();
        let centered = &batch - &mean.view().insert_axis(Axis(0));
        Ok(centered.dot(&self.components.t()))
    }
}

/// Makes the largest-magnitude loading of every component positive, flipping the
/// matching left vector with it.
fn flip_signs_by_loadings(u: &mut Array2<f64>, vt: &mut Array2<f64>) {
    for (i, mut row) in vt.axis_iter_mut(Axis(0)).enumerate() {
        let pivot = row
            .iter()
            .copied()
            .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            row.mapv_inplace(|v| -v);
            u.column_mut(i).mapv_inplace(|v| -v);
        }
    }
}

/// One fitted-and-embedded batch.
#[derive(Debug)]
pub struct EmbeddedBatch {
    pub ids: Vec<String>,
    pub values: Array2<f64>,
}

/// Buffers standardized chunks until a batch can carry `k` components, then fits and
/// embeds it with the updated model.
pub struct IncrementalEngine {
    model: IncrementalPca,
    pending_ids: Vec<String>,
    pending: Vec<f64>,
    batches: usize,
}

impl IncrementalEngine {
    pub fn new(n_components: usize, n_features: usize) -> Result<Self, IncrementalError> {
        Ok(Self::from_model(IncrementalPca::new(n_components, n_features)?))
    }

    /// Continues fitting an existing model.
    pub fn from_model(model: IncrementalPca) -> Self {
        Self {
            model,
            pending_ids: Vec::new(),
            pending: Vec::new(),
            batches: 0,
        }
    }

    pub fn model(&self) -> &IncrementalPca {
        &self.model
    }

    pub fn pending_rows(&self) -> usize {
        self.pending_ids.len()
    }

    /// Queues one standardized chunk; returns the embedded batch once enough rows
    /// are pending.
    pub fn push(
        &mut self,
        ids: &[String],
        standardized: ArrayView2<'_, f64>,
    ) -> Result<Option<EmbeddedBatch>, IncrementalError> {
        self.model.check_width(&standardized)?;
        debug_assert_eq!(ids.len(), standardized.nrows());
        self.pending_ids.extend_from_slice(ids);
        self.pending.extend(standardized.iter().copied());

        if self.pending_rows() < self.model.n_components().max(1) {
            return Ok(None);
        }
        let (ids, batch) = self.take_pending()?;
        self.model.partial_fit(batch.view())?;
        self.batches += 1;
        log::debug!(
            "incremental batch {} fitted on {} rows ({} seen)",
            self.batches,
            ids.len(),
            self.model.n_samples_seen()
        );
        let values = self.model.transform(batch.view())?;
        Ok(Some(EmbeddedBatch { ids, values }))
    }

    /// Embeds any rows still pending with the existing model, without fitting them.
    pub fn finish(mut self) -> Result<(IncrementalPca, Option<EmbeddedBatch>), IncrementalError> {
        if self.pending_ids.is_empty() {
            return Ok((self.model, None));
        }
        if !self.model.is_fitted() {
            return Err(IncrementalError::InsufficientRows {
                rows: self.pending_rows(),
                components: self.model.n_components(),
            });
        }
        let (ids, batch) = self.take_pending()?;
        log::warn!(
            "last {} rows are fewer than the {} components; embedded with the existing model without refitting",
            ids.len(),
            self.model.n_components()
        );
        let values = self.model.transform(batch.view())?;
        Ok((self.model, Some(EmbeddedBatch { ids, values })))
    }

    fn take_pending(&mut self) -> Result<(Vec<String>, Array2<f64>), IncrementalError> {
        let ids = std::mem::take(&mut self.pending_ids);
        let values = std::mem::take(&mut self.pending);
        let batch = Array2::from_shape_vec((ids.len(), self.model.n_features()), values)
            .map_err(|_| IncrementalError::WidthMismatch {
                expected: self.model.n_features(),
                found: 0,
            })?;
        Ok((ids, batch))
    }
}

/// A saved incremental model together with the scaling it was fitted under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncrementalArtifact {
    /// Feature column names of the table the model was fitted on, in raw order.
    pub feature_names: Vec<String>,
    pub standardizer: Standardizer,
    pub model: IncrementalPca,
}

impl IncrementalArtifact {
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        let toml_string = toml::to_string_pretty(self)?;
        write_atomically(path, |writer| {
            use std::io::Write;
            writer.write_all(toml_string.as_bytes())
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let toml_string = fs::read_to_string(path)?;
        let artifact = toml::from_str(&toml_string)?;
        Ok(artifact)
    }
}
