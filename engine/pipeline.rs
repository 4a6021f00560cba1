//! Drives a [`ChunkSource`] through the passes of the configured algorithm.
//!
//! Every pass rewinds the source, streams it chunk by chunk and checks row identifiers
//! against the ledger kept by the first pass. Only accumulators (moments, the n×l
//! sketch basis, the d×l projection or the incremental model) live between passes.

use std::error::Error as StdError;

use thiserror::Error;

use crate::config::{Algorithm, ConfigError, IncrementalScaler, ReduceConfig};
use crate::embedding::{Embedding, EmbeddingError};
use crate::faer_ndarray::{FaerLinalgError, FaerOrthonormalize};
use crate::incremental::{IncrementalArtifact, IncrementalEngine, IncrementalError, IncrementalPca};
use crate::moments::{MomentError, MomentState};
use crate::order::{RowOrderError, RowOrderLedger};
use crate::progress::{NoopProgress, PassProgressObserver, PassStage};
use crate::randomized::{
    ProjectionAccumulator, RandomizedError, RandomizedFactors, RangeFinder, SmallSvdSolver,
};
use crate::source::{ChunkSource, FeatureChunk, ParseReport};
use crate::standardize::{StandardizeError, Standardizer};

#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("input error: {0}")]
    Source(#[source] Box<dyn StdError + Send + Sync + 'static>),
    #[error("{pass} pass: row {row} has identifier '{found}' but the first pass had '{expected}'")]
    RowOrderMismatch {
        pass: String,
        row: usize,
        expected: String,
        found: String,
    },
    #[error("{pass} pass: read {found} rows but the first pass read {expected}")]
    RowCountMismatch {
        pass: String,
        expected: usize,
        found: usize,
    },
    #[error("identifier '{id}' appears at rows {first} and {second}")]
    DuplicateIdentifier {
        id: String,
        first: usize,
        second: usize,
    },
    #[error("input has no data rows")]
    EmptyInput,
    #[error("no active features remain after dropping {dropped} zero-variance features")]
    NoActiveFeatures { dropped: usize },
    #[error("model expects {expected} feature columns but the table has {found}")]
    FeatureCountMismatch { expected: usize, found: usize },
    #[error("feature column {index} is '{found}' but the model was fitted on '{expected}'")]
    FeatureNameMismatch {
        index: usize,
        expected: String,
        found: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Moments(#[from] MomentError),
    #[error(transparent)]
    Standardize(#[from] StandardizeError),
    #[error(transparent)]
    Randomized(#[from] RandomizedError),
    #[error(transparent)]
    Incremental(#[from] IncrementalError),
    #[error(transparent)]
    Linalg(#[from] FaerLinalgError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

impl From<RowOrderError> for ReduceError {
    fn from(err: RowOrderError) -> Self {
        match err {
            RowOrderError::DuplicateIdentifier { id, first, second } => {
                Self::DuplicateIdentifier { id, first, second }
            }
            RowOrderError::Mismatch {
                pass,
                row,
                expected,
                found,
            } => Self::RowOrderMismatch {
                pass,
                row,
                expected,
                found,
            },
            RowOrderError::RowCount {
                pass,
                expected,
                found,
            } => Self::RowCountMismatch {
                pass,
                expected,
                found,
            },
        }
    }
}

/// Everything a reduction run produces.
#[derive(Debug)]
pub struct ReduceOutcome {
    pub embedding: Embedding,
    pub standardizer: Standardizer,
    /// Raw feature column names, in table order.
    pub feature_names: Vec<String>,
    /// Present for [`Algorithm::Randomized`].
    pub factors: Option<RandomizedFactors>,
    /// Present for [`Algorithm::Incremental`].
    pub model: Option<IncrementalPca>,
    /// Parse accounting of the first pass.
    pub report: ParseReport,
    pub passes: usize,
}

impl ReduceOutcome {
    /// The incremental model packaged for `transform`, when one was fitted.
    pub fn artifact(&self) -> Option<IncrementalArtifact> {
        self.model.as_ref().map(|model| IncrementalArtifact {
            feature_names: self.feature_names.clone(),
            standardizer: self.standardizer.clone(),
            model: model.clone(),
        })
    }
}

enum RowCheck<'l> {
    Record(&'l mut RowOrderLedger),
    Verify(&'l RowOrderLedger),
}

struct PassSummary {
    rows: usize,
    report: ParseReport,
}

fn source_error<E>(err: E) -> ReduceError
where
    E: StdError + Send + Sync + 'static,
{
    ReduceError::Source(Box::new(err))
}

/// One full pass: rewind, stream every chunk through `visit`, check identifiers.
fn run_pass<S, P, F>(
    source: &mut S,
    stage: PassStage,
    chunk_size: usize,
    mut check: RowCheck<'_>,
    progress: &mut P,
    mut visit: F,
) -> Result<PassSummary, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
    F: FnMut(&FeatureChunk) -> Result<(), ReduceError>,
{
    source.reset().map_err(source_error)?;
    let total = match &check {
        RowCheck::Verify(ledger) => Some(ledger.len()),
        RowCheck::Record(_) => source.n_rows_hint(),
    };
    progress.on_stage_start(stage, total);
    log::info!("Starting {stage} pass");

    let mut chunk = FeatureChunk::with_capacity(chunk_size, source.n_features());
    let mut rows = 0usize;
    let mut chunks = 0usize;
    loop {
        let read = source
            .next_chunk_into(chunk_size, &mut chunk)
            .map_err(source_error)?;
        if read == 0 {
            break;
        }
        match &mut check {
            RowCheck::Record(ledger) => ledger.record(chunk.ids())?,
            RowCheck::Verify(ledger) => {
                if let Err(err) = ledger.verify(stage.describe(), rows, chunk.ids()) {
                    if !source.stable_row_order() {
                        log::warn!(
                            "Input source does not guarantee a stable row order; every pass must replay the rows of the first"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
        visit(&chunk)?;
        rows += read;
        chunks += 1;
        progress.on_stage_advance(stage, rows);
    }

    let report = source.take_report();
    report.log_summary(stage.describe(), source.feature_names());
    if let RowCheck::Verify(ledger) = &check {
        ledger.verify_complete(stage.describe(), rows)?;
    }
    progress.on_stage_finish(stage);
    log::info!("Finished {stage} pass: {rows} rows in {chunks} chunks");
    Ok(PassSummary { rows, report })
}

fn fit_standardizer(
    moments: &MomentState,
    config: &ReduceConfig,
    feature_names: &[String],
) -> Result<Standardizer, ReduceError> {
    let standardizer = Standardizer::fit(
        &moments.finalize(),
        config.variance_epsilon,
        config.zero_variance,
    )?;

    let name = |j: usize| feature_names.get(j).map_or("?", String::as_str);
    let dropped = standardizer.dropped_features();
    if !dropped.is_empty() {
        log::warn!(
            "Dropped {} zero-variance features: {}",
            dropped.len(),
            dropped.iter().map(|&j| name(j)).collect::<Vec<_>>().join(", ")
        );
    }
    let zero_filled = standardizer.zero_filled_features();
    if !zero_filled.is_empty() {
        log::warn!(
            "Zero-filled {} zero-variance features: {}",
            zero_filled.len(),
            zero_filled.iter().map(|&j| name(j)).collect::<Vec<_>>().join(", ")
        );
    }
    if standardizer.n_active() == 0 {
        return Err(ReduceError::NoActiveFeatures {
            dropped: dropped.len(),
        });
    }
    log::info!(
        "Standardizing {} of {} features",
        standardizer.n_active(),
        standardizer.n_features()
    );
    Ok(standardizer)
}

/// Moment pass over the whole table; records the canonical row order.
fn moment_pass<S, P>(
    source: &mut S,
    config: &ReduceConfig,
    ledger: &mut RowOrderLedger,
    progress: &mut P,
) -> Result<(MomentState, ParseReport), ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
{
    let mut state = MomentState::empty(source.n_features());
    let summary = run_pass(
        source,
        PassStage::Moments,
        config.chunk_size,
        RowCheck::Record(ledger),
        progress,
        |chunk| {
            let current = std::mem::replace(&mut state, MomentState::empty(0));
            state = current.update(chunk.view())?;
            Ok(())
        },
    )?;
    if summary.rows == 0 {
        return Err(ReduceError::EmptyInput);
    }
    Ok((state, summary.report))
}

/// Reduces `source` with the algorithm named in `config`.
pub fn reduce<S>(source: &mut S, config: &ReduceConfig) -> Result<ReduceOutcome, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
{
    reduce_with_progress(source, config, &mut NoopProgress)
}

pub fn reduce_with_progress<S, P>(
    source: &mut S,
    config: &ReduceConfig,
    progress: &mut P,
) -> Result<ReduceOutcome, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
{
    config.validate()?;
    log::info!(
        "Reducing {} features to {} components with the {:?} algorithm (chunk size {})",
        source.n_features(),
        config.components,
        config.algorithm,
        config.chunk_size
    );
    match config.algorithm {
        Algorithm::Randomized => reduce_randomized(source, config, progress),
        Algorithm::Incremental => reduce_incremental(source, config, progress),
    }
}

fn reduce_randomized<S, P>(
    source: &mut S,
    config: &ReduceConfig,
    progress: &mut P,
) -> Result<ReduceOutcome, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
{
    let params = config.randomized_params();
    let feature_names = source.feature_names().to_vec();
    let mut ledger = RowOrderLedger::with_capacity(source.n_rows_hint().unwrap_or(0));

    let (moments, report) = moment_pass(source, config, &mut ledger, progress)?;
    let standardizer = fit_standardizer(&moments, config, &feature_names)?;
    let n_rows = ledger.len();
    let n_active = standardizer.n_active();
    if params.components > n_rows.min(n_active) {
        log::warn!(
            "Requested {} components but the standardized table is {n_rows}x{n_active}; trailing components will be zero",
            params.components
        );
    }
    let mut passes = 1;

    let mut finder = RangeFinder::new(n_active, params.sketch_width(), params.seed, Some(n_rows));
    run_pass(
        source,
        PassStage::Sketch,
        config.chunk_size,
        RowCheck::Verify(&ledger),
        progress,
        |chunk| {
            let z = standardizer.transform_chunk(chunk.view())?;
            finder.absorb(z.view())?;
            Ok(())
        },
    )?;
    passes += 1;
    let mut basis = finder.finish()?;
    log::info!("Sketch basis is {}x{}", basis.nrows(), basis.ncols());

    for iteration in 1..=params.power_iterations {
        let mut back = ProjectionAccumulator::new(basis.view(), n_active);
        run_pass(
            source,
            PassStage::PowerIteration,
            config.chunk_size,
            RowCheck::Verify(&ledger),
            progress,
            |chunk| {
                let z = standardizer.transform_chunk(chunk.view())?;
                back.absorb(z.view())?;
                Ok(())
            },
        )?;
        let test_matrix = back.finish()?.orthonormal_basis()?;

        let mut forward = RangeFinder::with_test_matrix(test_matrix, Some(n_rows));
        run_pass(
            source,
            PassStage::PowerIteration,
            config.chunk_size,
            RowCheck::Verify(&ledger),
            progress,
            |chunk| {
                let z = standardizer.transform_chunk(chunk.view())?;
                forward.absorb(z.view())?;
                Ok(())
            },
        )?;
        basis = forward.finish()?;
        passes += 2;
        log::info!("Power iteration {iteration} of {} done", params.power_iterations);
    }

    let mut projection = ProjectionAccumulator::new(basis.view(), n_active);
    run_pass(
        source,
        PassStage::Projection,
        config.chunk_size,
        RowCheck::Verify(&ledger),
        progress,
        |chunk| {
            let z = standardizer.transform_chunk(chunk.view())?;
            projection.absorb(z.view())?;
            Ok(())
        },
    )?;
    passes += 1;
    let projected = projection.finish()?;

    let factors = SmallSvdSolver::new(params.components).solve(basis.view(), projected.view())?;
    log::info!(
        "Singular values of the {} components: {}",
        factors.components(),
        factors
            .s
            .iter()
            .take(factors.components())
            .map(|v| format!("{v:.4}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let embedding =
        Embedding::new(ledger.into_ids(), factors.embedding())?.with_id_column(source.id_column());

    Ok(ReduceOutcome {
        embedding,
        standardizer,
        feature_names,
        factors: Some(factors),
        model: None,
        report,
        passes,
    })
}

fn reduce_incremental<S, P>(
    source: &mut S,
    config: &ReduceConfig,
    progress: &mut P,
) -> Result<ReduceOutcome, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
{
    let feature_names = source.feature_names().to_vec();
    let mut ledger = RowOrderLedger::with_capacity(source.n_rows_hint().unwrap_or(0));
    let mut embedding =
        Embedding::with_components(config.components).with_id_column(source.id_column());

    let (standardizer, engine, report, passes) = match config.incremental_scaler {
        IncrementalScaler::FullPass => {
            let (moments, report) = moment_pass(source, config, &mut ledger, progress)?;
            let standardizer = fit_standardizer(&moments, config, &feature_names)?;
            let mut engine = IncrementalEngine::new(config.components, standardizer.n_active())?;
            run_pass(
                source,
                PassStage::Incremental,
                config.chunk_size,
                RowCheck::Verify(&ledger),
                progress,
                |chunk| {
                    let z = standardizer.transform_chunk(chunk.view())?;
                    if let Some(batch) = engine.push(chunk.ids(), z.view())? {
                        embedding.append(&batch.ids, batch.values.view())?;
                    }
                    Ok(())
                },
            )?;
            (standardizer, engine, report, 2)
        }
        IncrementalScaler::Bootstrap => {
            // Bootstrap sample: the leading max(k, 2) rows, gathered across chunks.
            let bootstrap_rows = config.components.max(2);
            let mut bootstrap = FeatureChunk::with_capacity(bootstrap_rows, source.n_features());
            let mut fitted: Option<(Standardizer, IncrementalEngine)> = None;
            let summary = run_pass(
                source,
                PassStage::Incremental,
                config.chunk_size,
                RowCheck::Record(&mut ledger),
                progress,
                |chunk| {
                    let rows = if fitted.is_none() {
                        bootstrap.extend_from(chunk);
                        if bootstrap.n_rows() < bootstrap_rows {
                            return Ok(());
                        }
                        let moments =
                            MomentState::empty(bootstrap.n_features()).update(bootstrap.view())?;
                        log::info!("Fitting standardizer on the first {} rows", bootstrap.n_rows());
                        let standardizer = fit_standardizer(&moments, config, &feature_names)?;
                        let engine =
                            IncrementalEngine::new(config.components, standardizer.n_active())?;
                        fitted = Some((standardizer, engine));
                        &bootstrap
                    } else {
                        chunk
                    };
                    if let Some((standardizer, engine)) = fitted.as_mut() {
                        let z = standardizer.transform_chunk(rows.view())?;
                        if let Some(batch) = engine.push(rows.ids(), z.view())? {
                            embedding.append(&batch.ids, batch.values.view())?;
                        }
                    }
                    Ok(())
                },
            )?;
            let Some((standardizer, engine)) = fitted else {
                if bootstrap.is_empty() {
                    return Err(ReduceError::EmptyInput);
                }
                return Err(IncrementalError::InsufficientRows {
                    rows: bootstrap.n_rows(),
                    components: bootstrap_rows,
                }
                .into());
            };
            (standardizer, engine, summary.report, 1)
        }
    };

    let (model, tail) = engine.finish()?;
    if let Some(batch) = tail {
        embedding.append(&batch.ids, batch.values.view())?;
    }
    debug_assert_eq!(embedding.ids(), ledger.ids());
    log::info!(
        "Incremental model fitted on {} rows; explained variance ratio of PC1 is {:.4}, noise variance {:.4}",
        model.n_samples_seen(),
        model.explained_variance_ratio().first().copied().unwrap_or(0.0),
        model.noise_variance()
    );

    Ok(ReduceOutcome {
        embedding,
        standardizer,
        feature_names,
        factors: None,
        model: Some(model),
        report,
        passes,
    })
}

/// Embeds a new table with a saved incremental model, without refitting.
pub fn transform<S>(
    source: &mut S,
    artifact: &IncrementalArtifact,
    chunk_size: usize,
) -> Result<Embedding, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
{
    transform_with_progress(source, artifact, chunk_size, &mut NoopProgress)
}

pub fn transform_with_progress<S, P>(
    source: &mut S,
    artifact: &IncrementalArtifact,
    chunk_size: usize,
    progress: &mut P,
) -> Result<Embedding, ReduceError>
where
    S: ChunkSource,
    S::Error: StdError + Send + Sync + 'static,
    P: PassProgressObserver,
{
    if chunk_size == 0 {
        return Err(ConfigError::ZeroChunkSize.into());
    }
    let expected = artifact.standardizer.n_features();
    if source.n_features() != expected {
        return Err(ReduceError::FeatureCountMismatch {
            expected,
            found: source.n_features(),
        });
    }
    if let Some((index, (expected, found))) = artifact
        .feature_names
        .iter()
        .zip(source.feature_names())
        .enumerate()
        .find(|(_, (expected, found))| expected != found)
    {
        return Err(ReduceError::FeatureNameMismatch {
            index,
            expected: expected.clone(),
            found: found.clone(),
        });
    }

    let mut ledger = RowOrderLedger::with_capacity(source.n_rows_hint().unwrap_or(0));
    let mut embedding =
        Embedding::with_components(artifact.model.n_components()).with_id_column(source.id_column());
    let summary = run_pass(
        source,
        PassStage::Transform,
        chunk_size,
        RowCheck::Record(&mut ledger),
        progress,
        |chunk| {
            let z = artifact.standardizer.transform_chunk(chunk.view())?;
            let embedded = artifact.model.transform(z.view())?;
            embedding.append(chunk.ids(), embedded.view())?;
            Ok(())
        },
    )?;
    if summary.rows == 0 {
        return Err(ReduceError::EmptyInput);
    }
    Ok(embedding)
}
