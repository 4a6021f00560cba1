//! Embedding and factor tables on disk.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::randomized::RandomizedFactors;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding has {ids} identifiers but {rows} value rows")]
    RowMismatch { ids: usize, rows: usize },
    #[error("batch has {found} components but the embedding has {expected}")]
    ComponentMismatch { expected: usize, found: usize },
    #[error("failed to write '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Column layout of the embedding table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputLayout {
    /// `<id column>\tPC1..PCk`
    Plain,
    /// `#FID\tIID\tPC1..PCk` with FID = IID = id, ready for PLINK phenotype input.
    #[default]
    Plink,
}

/// Per-row component values keyed by identifier, in input order.
#[derive(Clone, Debug, PartialEq)]
pub struct Embedding {
    id_column: String,
    ids: Vec<String>,
    values: Array2<f64>,
}

impl Embedding {
    pub fn new(ids: Vec<String>, values: Array2<f64>) -> Result<Self, EmbeddingError> {
        if ids.len() != values.nrows() {
            return Err(EmbeddingError::RowMismatch {
                ids: ids.len(),
                rows: values.nrows(),
            });
        }
        Ok(Self {
            id_column: "id".to_string(),
            ids,
            values,
        })
    }

    /// Empty embedding that batches are appended to.
    pub fn with_components(components: usize) -> Self {
        Self {
            id_column: "id".to_string(),
            ids: Vec::new(),
            values: Array2::zeros((0, components)),
        }
    }

    /// Header of the identifier column in the plain layout.
    pub fn with_id_column(mut self, name: &str) -> Self {
        self.id_column = name.to_string();
        self
    }

    pub fn append(&mut self, ids: &[String], values: ArrayView2<'_, f64>) -> Result<(), EmbeddingError> {
        if ids.len() != values.nrows() {
            return Err(EmbeddingError::RowMismatch {
                ids: ids.len(),
                rows: values.nrows(),
            });
        }
        self.values
            .append(Axis(0), values)
            .map_err(|_| EmbeddingError::ComponentMismatch {
                expected: self.values.ncols(),
                found: values.ncols(),
            })?;
        self.ids.extend_from_slice(ids);
        Ok(())
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    pub fn n_components(&self) -> usize {
        self.values.ncols()
    }

    pub fn write_tsv(&self, path: &Path, layout: OutputLayout) -> Result<(), EmbeddingError> {
        let pcs = (1..=self.n_components()).map(|j| format!("PC{j}"));
        let header = match layout {
            OutputLayout::Plain => std::iter::once(self.id_column.clone()).chain(pcs).join("\t"),
            OutputLayout::Plink => ["#FID".to_string(), "IID".to_string()]
                .into_iter()
                .chain(pcs)
                .join("\t"),
        };

        write_atomically(path, |writer| {
            writeln!(writer, "{header}")?;
            let mut line = String::with_capacity(32 + self.n_components() * 24);
            let mut ryu_buffer = ryu::Buffer::new();
            for (id, row) in self.ids.iter().zip(self.values.rows()) {
                line.clear();
                line.push_str(id);
                if layout == OutputLayout::Plink {
                    line.push('\t');
                    line.push_str(id);
                }
                for &value in row {
                    line.push('\t');
                    line.push_str(ryu_buffer.format(value));
                }
                writeln!(writer, "{line}")?;
            }
            Ok(())
        })
    }
}

/// Writes `U.tsv`, `S.tsv` and `Vt.tsv` into `dir`, creating it if needed.
///
/// Each table has a header of 0-based column indices, matching the way the factors
/// are addressed downstream.
pub fn write_factors(dir: &Path, factors: &RandomizedFactors) -> Result<(), EmbeddingError> {
    fs::create_dir_all(dir).map_err(|source| EmbeddingError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_matrix(&dir.join("U.tsv"), factors.u.view())?;
    write_matrix(&dir.join("S.tsv"), factors.s.view().insert_axis(Axis(1)))?;
    write_matrix(&dir.join("Vt.tsv"), factors.vt.view())
}

fn write_matrix(path: &Path, matrix: ArrayView2<'_, f64>) -> Result<(), EmbeddingError> {
    write_atomically(path, |writer| {
        writeln!(writer, "{}", (0..matrix.ncols()).join("\t"))?;
        let mut ryu_buffer = ryu::Buffer::new();
        let mut line = String::new();
        for row in matrix.rows() {
            line.clear();
            for (j, &value) in row.iter().enumerate() {
                if j > 0 {
                    line.push('\t');
                }
                line.push_str(ryu_buffer.format(value));
            }
            writeln!(writer, "{line}")?;
        }
        Ok(())
    })
}

/// Runs `body` against a buffered temporary file next to `path`, then renames it into
/// place. The temporary file is removed on any failure.
pub fn write_atomically<F>(path: &Path, body: F) -> Result<(), EmbeddingError>
where
    F: FnOnce(&mut BufWriter<fs::File>) -> io::Result<()>,
{
    let wrap = |source: io::Error| EmbeddingError::Io {
        path: path.to_path_buf(),
        source,
    };
    let name = path.file_name().ok_or_else(|| {
        wrap(io::Error::new(
            io::ErrorKind::InvalidInput,
            "output path has no file name",
        ))
    })?;
    let temp_path = path.with_file_name(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        std::process::id()
    ));

    let result = fs::File::create(&temp_path).and_then(|file| {
        let mut writer = BufWriter::new(file);
        body(&mut writer)?;
        writer.into_inner().map_err(io::Error::other)?.sync_all()?;
        fs::rename(&temp_path, path)
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result.map_err(wrap)
}
