//! Tab-delimited feature tables read as a [`ChunkSource`].
//!
//! The first header row names the columns. One column holds subject identifiers; every
//! other column (optionally narrowed by a substring filter) is a numeric feature. Paths
//! ending in `.gz` are decompressed on the fly.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::str;

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{CellIssue, ChunkSource, FeatureChunk, ParseReport};

/// How cells that do not hold a finite number are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingPolicy {
    /// Abort the pass at the first missing or non-numeric cell or malformed row.
    #[default]
    Fail,
    /// Store missing and non-numeric cells as `NaN` and skip malformed rows.
    Exclude,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Identifier column name. Defaults to the first column.
    pub id_column: Option<String>,
    /// Keep only feature columns whose name contains this substring.
    pub feature_filter: Option<String>,
    pub missing: MissingPolicy,
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("{path} has no header row")]
    EmptyHeader { path: String },
    #[error("{path} header is not valid UTF-8")]
    HeaderEncoding { path: String },
    #[error("identifier column '{column}' not found in {path}")]
    MissingIdColumn { path: String, column: String },
    #[error("{path} has no feature columns{}", filter_suffix(.filter))]
    NoFeatureColumns {
        path: String,
        filter: Option<String>,
    },
    #[error("{path} header changed between passes")]
    HeaderChanged { path: String },
    #[error("{path} line {line}: expected {expected} fields, found {found}")]
    MalformedRow {
        path: String,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("{path} line {line}: empty or non-UTF-8 identifier")]
    BadIdentifier { path: String, line: u64 },
    #[error("{path} line {line}, column '{column}': {kind} value {value:?}")]
    BadCell {
        path: String,
        line: u64,
        column: String,
        value: String,
        kind: &'static str,
    },
}

fn filter_suffix(filter: &Option<String>) -> String {
    filter
        .as_ref()
        .map(|f| format!(" matching '{f}'"))
        .unwrap_or_default()
}

/// Outcome of parsing one feature cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cell {
    Value(f64),
    Missing,
    Invalid,
}

const MISSING_TOKENS: &[&[u8]] = &[b"", b"NA", b"N/A", b"NaN", b"nan", b"NAN", b"null", b"NULL", b"."];

pub fn parse_cell(raw: &[u8]) -> Cell {
    let trimmed = raw.trim_ascii();
    if MISSING_TOKENS.contains(&trimmed) {
        return Cell::Missing;
    }
    match lexical_core::parse::<f64>(trimmed) {
        Ok(value) if value.is_finite() => Cell::Value(value),
        _ => Cell::Invalid,
    }
}

pub struct TsvChunkSource {
    path: PathBuf,
    options: TableOptions,
    header: csv::ByteRecord,
    id_index: usize,
    id_name: String,
    feature_indices: Vec<usize>,
    feature_names: Vec<String>,
    reader: csv::Reader<Box<dyn Read>>,
    record: csv::ByteRecord,
    row: Vec<f64>,
    report: ParseReport,
}

fn open_reader(path: &Path) -> Result<csv::Reader<Box<dyn Read>>, TableError> {
    let file = File::open(path).map_err(|source| TableError::Open {
        path: path.display().to_string(),
        source,
    })?;
    let inner: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(MultiGzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(file)
    };
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .buffer_capacity(1 << 20)
        .from_reader(inner))
}

impl TsvChunkSource {
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let display = path.display().to_string();
        let mut reader = open_reader(&path)?;
        let header = reader
            .byte_headers()
            .map_err(|source| TableError::Read {
                path: display.clone(),
                source,
            })?
            .clone();
        if header.is_empty() {
            return Err(TableError::EmptyHeader { path: display });
        }
        let names: Vec<String> = header
            .iter()
            .map(|field| str::from_utf8(field).map(|s| s.trim().to_string()))
            .collect::<Result<_, _>>()
            .map_err(|_| TableError::HeaderEncoding {
                path: display.clone(),
            })?;

        let id_index = match &options.id_column {
            Some(column) => names.iter().position(|n| n == column).ok_or_else(|| {
                TableError::MissingIdColumn {
                    path: display.clone(),
                    column: column.clone(),
                }
            })?,
            None => 0,
        };

        let (feature_indices, feature_names): (Vec<usize>, Vec<String>) = names
            .iter()
            .enumerate()
            .filter(|&(i, name)| {
                i != id_index
                    && options
                        .feature_filter
                        .as_deref()
                        .is_none_or(|filter| name.contains(filter))
            })
            .map(|(i, name)| (i, name.clone()))
            .unzip();
        if feature_indices.is_empty() {
            return Err(TableError::NoFeatureColumns {
                path: display,
                filter: options.feature_filter.clone(),
            });
        }

        log::info!(
            "Opened {} with {} feature columns (identifier column '{}')",
            path.display(),
            feature_names.len(),
            names[id_index]
        );

        let n_features = feature_names.len();
        Ok(Self {
            path,
            options,
            header,
            id_index,
            id_name: names[id_index].clone(),
            feature_indices,
            feature_names,
            reader,
            record: csv::ByteRecord::new(),
            row: vec![f64::NAN; n_features],
            report: ParseReport::new(n_features),
        })
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    /// Parses the current record into `self.row`. `Ok(None)` means the row was rejected
    /// under [`MissingPolicy::Exclude`].
    fn parse_record(&mut self, line: u64) -> Result<Option<String>, TableError> {
        let exclude = self.options.missing == MissingPolicy::Exclude;

        if self.record.len() != self.header.len() {
            if exclude {
                let found = format!("{} fields", self.record.len());
                self.reject(line, "<row>", found);
                return Ok(None);
            }
            return Err(TableError::MalformedRow {
                path: self.display(),
                line,
                expected: self.header.len(),
                found: self.record.len(),
            });
        }

        let id = str::from_utf8(&self.record[self.id_index])
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let Some(id) = id else {
            if exclude {
                let raw = String::from_utf8_lossy(&self.record[self.id_index]).into_owned();
                self.reject(line, "<id>", raw);
                return Ok(None);
            }
            return Err(TableError::BadIdentifier {
                path: self.display(),
                line,
            });
        };

        let mut parsed = 0usize;
        for (slot, (j, &col)) in self.row.iter_mut().zip(self.feature_indices.iter().enumerate()) {
            let raw = &self.record[col];
            let (kind, value) = match parse_cell(raw) {
                Cell::Value(value) => {
                    *slot = value;
                    parsed += 1;
                    continue;
                }
                Cell::Missing => ("missing", raw),
                Cell::Invalid => ("non-numeric", raw),
            };
            if !exclude {
                return Err(TableError::BadCell {
                    path: self.path.display().to_string(),
                    line,
                    column: self.feature_names[j].clone(),
                    value: String::from_utf8_lossy(value).into_owned(),
                    kind,
                });
            }
            *slot = f64::NAN;
            self.report.missing_per_feature[j] += 1;
            if kind == "missing" {
                self.report.missing_cells += 1;
            } else {
                self.report.invalid_cells += 1;
                self.report.record_issue(CellIssue {
                    line,
                    column: self.feature_names[j].clone(),
                    raw: String::from_utf8_lossy(value).into_owned(),
                });
            }
        }

        if parsed == 0 {
            self.report.rows_rejected += 1;
            return Ok(None);
        }
        Ok(Some(id))
    }

    fn reject(&mut self, line: u64, column: &str, raw: String) {
        self.report.rows_rejected += 1;
        self.report.record_issue(CellIssue {
            line,
            column: column.to_string(),
            raw,
        });
    }
}

impl ChunkSource for TsvChunkSource {
    type Error = TableError;

    fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn id_column(&self) -> &str {
        &self.id_name
    }

    fn stable_row_order(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        let mut reader = open_reader(&self.path)?;
        let header = reader.byte_headers().map_err(|source| TableError::Read {
            path: self.display(),
            source,
        })?;
        if header != &self.header {
            return Err(TableError::HeaderChanged {
                path: self.display(),
            });
        }
        self.reader = reader;
        self.report = ParseReport::new(self.n_features());
        Ok(())
    }

    fn next_chunk_into(
        &mut self,
        max_rows: usize,
        chunk: &mut FeatureChunk,
    ) -> Result<usize, Self::Error> {
        chunk.clear(self.n_features());
        while chunk.n_rows() < max_rows {
            let more = self
                .reader
                .read_byte_record(&mut self.record)
                .map_err(|source| TableError::Read {
                    path: self.path.display().to_string(),
                    source,
                })?;
            if !more {
                break;
            }
            let line = self.record.position().map_or(0, |p| p.line());
            self.report.rows_read += 1;
            if let Some(id) = self.parse_record(line)? {
                chunk.push_row(id, &self.row);
            }
        }
        Ok(chunk.n_rows())
    }

    fn take_report(&mut self) -> ParseReport {
        std::mem::replace(&mut self.report, ParseReport::new(self.feature_names.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_table(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    const TABLE: &str = "24983_id\tlead1_a\tlead1_b\tother\n\
                         s1\t1.0\t2.0\t9\n\
                         s2\t3.5\t-1e2\t9\n\
                         s3\t0\t4\t9\n";

    #[test]
    fn parse_cell_distinguishes_missing_and_invalid() {
        assert_eq!(parse_cell(b" 1.5 "), Cell::Value(1.5));
        assert_eq!(parse_cell(b"-2e-3"), Cell::Value(-2e-3));
        assert_eq!(parse_cell(b""), Cell::Missing);
        assert_eq!(parse_cell(b"NA"), Cell::Missing);
        assert_eq!(parse_cell(b"nan"), Cell::Missing);
        assert_eq!(parse_cell(b"abc"), Cell::Invalid);
        assert_eq!(parse_cell(b"inf"), Cell::Invalid);
    }

    #[test]
    fn reads_chunks_with_feature_filter() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "t.tsv", TABLE);
        let options = TableOptions {
            feature_filter: Some("lead".into()),
            ..TableOptions::default()
        };
        let mut source = TsvChunkSource::open(&path, options).unwrap();
        assert_eq!(source.feature_names(), &["lead1_a", "lead1_b"]);
        assert_eq!(source.id_column(), "24983_id");

        let mut chunk = FeatureChunk::default();
        assert_eq!(source.next_chunk_into(2, &mut chunk).unwrap(), 2);
        assert_eq!(chunk.ids(), &["s1", "s2"]);
        assert_eq!(chunk.view()[(1, 1)], -100.0);
        assert_eq!(source.next_chunk_into(2, &mut chunk).unwrap(), 1);
        assert_eq!(source.next_chunk_into(2, &mut chunk).unwrap(), 0);

        source.reset().unwrap();
        assert_eq!(source.next_chunk_into(10, &mut chunk).unwrap(), 3);
        assert_eq!(source.take_report().rows_read, 3);
    }

    #[test]
    fn explicit_id_column_may_be_anywhere() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "t.tsv", "x\tid\ty\n1\ta\t2\n");
        let options = TableOptions {
            id_column: Some("id".into()),
            ..TableOptions::default()
        };
        let mut source = TsvChunkSource::open(&path, options).unwrap();
        assert_eq!(source.feature_names(), &["x", "y"]);
        let mut chunk = FeatureChunk::default();
        source.next_chunk_into(4, &mut chunk).unwrap();
        assert_eq!(chunk.ids(), &["a"]);
        assert_eq!(chunk.view().row(0).to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn fail_policy_names_the_offending_cell() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "t.tsv", "id\ta\tb\ns1\t1\t2\ns2\t3\toops\n");
        let mut source = TsvChunkSource::open(&path, TableOptions::default()).unwrap();
        let mut chunk = FeatureChunk::default();
        match source.next_chunk_into(10, &mut chunk) {
            Err(TableError::BadCell {
                line, column, value, ..
            }) => {
                assert_eq!(line, 3);
                assert_eq!(column, "b");
                assert_eq!(value, "oops");
            }
            other => panic!("expected BadCell, got {other:?}"),
        }
    }

    #[test]
    fn exclude_policy_marks_missing_and_rejects_bad_rows() {
        let dir = TempDir::new().unwrap();
        let contents = "id\ta\tb\n\
                        s1\t1\t\n\
                        s2\tNA\tx\n\
                        s3\t1\n\
                        \t4\t5\n\
                        s5\t6\t7\n";
        let path = write_table(&dir, "t.tsv", contents);
        let options = TableOptions {
            missing: MissingPolicy::Exclude,
            ..TableOptions::default()
        };
        let mut source = TsvChunkSource::open(&path, options).unwrap();
        let mut chunk = FeatureChunk::default();
        assert_eq!(source.next_chunk_into(100, &mut chunk).unwrap(), 2);
        assert_eq!(chunk.ids(), &["s1", "s5"]);
        assert!(chunk.view()[(0, 1)].is_nan());

        let report = source.take_report();
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_rejected, 3);
        assert_eq!(report.missing_cells, 2);
        assert_eq!(report.invalid_cells, 1);
        assert_eq!(report.missing_per_feature, vec![1, 2]);
    }

    #[test]
    fn gzip_tables_are_decompressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tsv.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(TABLE.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let mut source = TsvChunkSource::open(&path, TableOptions::default()).unwrap();
        assert_eq!(source.n_features(), 3);
        let mut chunk = FeatureChunk::default();
        assert_eq!(source.next_chunk_into(10, &mut chunk).unwrap(), 3);
        assert_eq!(chunk.view()[(2, 2)], 9.0);
    }

    #[test]
    fn missing_id_column_and_empty_filter_are_errors() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "t.tsv", TABLE);
        let options = TableOptions {
            id_column: Some("IID".into()),
            ..TableOptions::default()
        };
        assert!(matches!(
            TsvChunkSource::open(&path, options),
            Err(TableError::MissingIdColumn { .. })
        ));
        let options = TableOptions {
            feature_filter: Some("lead9".into()),
            ..TableOptions::default()
        };
        assert!(matches!(
            TsvChunkSource::open(&path, options),
            Err(TableError::NoFeatureColumns { .. })
        ));
    }
}
