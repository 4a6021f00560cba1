//! Restartable row-chunk access to a feature table.

use core::cmp::min;
use std::convert::Infallible;

use ndarray::ArrayView2;

/// Reusable buffers for one chunk of rows.
///
/// Values are stored row-major; missing cells hold `NaN`.
#[derive(Clone, Debug, Default)]
pub struct FeatureChunk {
    ids: Vec<String>,
    values: Vec<f64>,
    n_features: usize,
}

impl FeatureChunk {
    pub fn with_capacity(max_rows: usize, n_features: usize) -> Self {
        Self {
            ids: Vec::with_capacity(max_rows),
            values: Vec::with_capacity(max_rows * n_features),
            n_features,
        }
    }

    pub fn clear(&mut self, n_features: usize) {
        self.ids.clear();
        self.values.clear();
        self.n_features = n_features;
    }

    /// Appends one row.
    ///
    /// # Panics
    /// If `row` does not have exactly `n_features` entries.
    pub fn push_row(&mut self, id: String, row: &[f64]) {
        assert_eq!(
            row.len(),
            self.n_features,
            "row '{id}' has {} values but the chunk holds {} features",
            row.len(),
            self.n_features
        );
        self.ids.push(id);
        self.values.extend_from_slice(row);
    }

    /// Appends every row of `other`, which must have the same width.
    pub fn extend_from(&mut self, other: &FeatureChunk) {
        assert_eq!(
            other.n_features, self.n_features,
            "cannot append a {}-feature chunk to a {}-feature chunk",
            other.n_features, self.n_features
        );
        self.ids.extend_from_slice(&other.ids);
        self.values.extend_from_slice(&other.values);
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        ArrayView2::from_shape((self.n_rows(), self.n_features), &self.values)
            .expect("chunk buffer length matches rows × features")
    }
}

/// One problem cell or row found while reading a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct CellIssue {
    /// 1-based line number in the source, header included.
    pub line: u64,
    pub column: String,
    pub raw: String,
}

/// Per-pass accounting of missing cells and rejected rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParseReport {
    pub rows_read: u64,
    pub rows_rejected: u64,
    pub missing_cells: u64,
    pub invalid_cells: u64,
    /// Missing or invalid cell counts per feature column.
    pub missing_per_feature: Vec<u64>,
    /// The first few issues, for error messages and logs.
    pub samples: Vec<CellIssue>,
}

impl ParseReport {
    pub const MAX_SAMPLES: usize = 8;

    pub fn new(n_features: usize) -> Self {
        Self {
            missing_per_feature: vec![0; n_features],
            ..Self::default()
        }
    }

    pub fn record_issue(&mut self, issue: CellIssue) {
        if self.samples.len() < Self::MAX_SAMPLES {
            self.samples.push(issue);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.rows_rejected == 0 && self.missing_cells == 0 && self.invalid_cells == 0
    }

    /// Logs a one-line summary plus the sampled issues at warn level.
    pub fn log_summary(&self, pass: &str, feature_names: &[String]) {
        if self.is_clean() {
            log::debug!("{pass}: read {} rows without parse issues", self.rows_read);
            return;
        }
        log::warn!(
            "{pass}: read {} rows, rejected {}, {} missing and {} non-numeric cells",
            self.rows_read,
            self.rows_rejected,
            self.missing_cells,
            self.invalid_cells
        );
        let mut worst: Vec<(usize, u64)> = self
            .missing_per_feature
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, n)| n > 0)
            .collect();
        worst.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        for (j, n) in worst.into_iter().take(Self::MAX_SAMPLES) {
            let name = feature_names.get(j).map_or("?", String::as_str);
            log::warn!("{pass}:   feature {name} has {n} missing cells");
        }
        for issue in &self.samples {
            log::warn!(
                "{pass}:   line {} column {}: {:?}",
                issue.line,
                issue.column,
                issue.raw
            );
        }
    }
}

/// A feature table that can be read as a sequence of row chunks, any number of times.
pub trait ChunkSource {
    type Error;

    fn n_features(&self) -> usize;

    fn feature_names(&self) -> &[String];

    /// Header of the identifier column, used to label it in plain output tables.
    fn id_column(&self) -> &str {
        "id"
    }

    /// Total row count, when known before a full scan.
    fn n_rows_hint(&self) -> Option<usize> {
        None
    }

    /// Whether every pass is guaranteed to yield the same `(id, row)` sequence.
    ///
    /// Identifiers are verified on every re-read pass either way; for a source that
    /// cannot promise stable order a mismatch is also logged as a likely cause.
    fn stable_row_order(&self) -> bool {
        false
    }

    /// Rewinds to the first row.
    fn reset(&mut self) -> Result<(), Self::Error>;

    /// Replaces the contents of `chunk` with up to `max_rows` rows and returns how many
    /// were read. Zero means the pass is finished.
    fn next_chunk_into(
        &mut self,
        max_rows: usize,
        chunk: &mut FeatureChunk,
    ) -> Result<usize, Self::Error>;

    /// Parse accounting accumulated since the last `reset`.
    fn take_report(&mut self) -> ParseReport {
        ParseReport::new(self.n_features())
    }
}

/// In-memory row-major table.
pub struct DenseChunkSource<'a> {
    data: &'a [f64],
    ids: Vec<String>,
    feature_names: Vec<String>,
    cursor: usize,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DenseSourceError {
    #[error("dense source needs at least one feature column")]
    NoFeatures,
    #[error("data length {found} does not match {rows} rows × {cols} features")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        found: usize,
    },
}

impl<'a> DenseChunkSource<'a> {
    pub fn new(
        data: &'a [f64],
        ids: Vec<String>,
        feature_names: Vec<String>,
    ) -> Result<Self, DenseSourceError> {
        let cols = feature_names.len();
        if cols == 0 {
            return Err(DenseSourceError::NoFeatures);
        }
        let rows = ids.len();
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(DenseSourceError::ShapeMismatch {
                rows,
                cols,
                found: data.len(),
            });
        }
        Ok(Self {
            data,
            ids,
            feature_names,
            cursor: 0,
        })
    }

    /// Wraps a matrix view in standard layout, naming rows `S1..Sn` and columns `F1..Fd`.
    pub fn from_matrix(matrix: &'a ndarray::Array2<f64>) -> Result<Self, DenseSourceError> {
        let (rows, cols) = matrix.dim();
        let data = matrix
            .as_slice()
            .ok_or(DenseSourceError::ShapeMismatch { rows, cols, found: 0 })?;
        Self::new(
            data,
            (1..=rows).map(|i| format!("S{i}")).collect(),
            (1..=cols).map(|j| format!("F{j}")).collect(),
        )
    }
}

impl ChunkSource for DenseChunkSource<'_> {
    type Error = Infallible;

    fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn n_rows_hint(&self) -> Option<usize> {
        Some(self.ids.len())
    }

    fn stable_row_order(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.cursor = 0;
        Ok(())
    }

    fn next_chunk_into(
        &mut self,
        max_rows: usize,
        chunk: &mut FeatureChunk,
    ) -> Result<usize, Self::Error> {
        let cols = self.n_features();
        chunk.clear(cols);
        let remaining = self.ids.len().saturating_sub(self.cursor);
        let rows = min(max_rows, remaining);
        for i in self.cursor..self.cursor + rows {
            chunk.push_row(self.ids[i].clone(), &self.data[i * cols..(i + 1) * cols]);
        }
        self.cursor += rows;
        Ok(rows)
    }

    fn take_report(&mut self) -> ParseReport {
        let mut report = ParseReport::new(self.n_features());
        report.rows_read = self.cursor as u64;
        report
    }
}
