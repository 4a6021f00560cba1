//! Canonical row order for multi-pass runs.
//!
//! The first pass that emits output records every identifier. Later passes replay the
//! same source and must present the same identifiers at the same positions; the
//! ledger checks each chunk as it arrives so a reordered source fails loudly instead
//! of silently misaligning rows of the basis.

use ahash::AHashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RowOrderError {
    #[error("identifier '{id}' appears at rows {first} and {second}")]
    DuplicateIdentifier {
        id: String,
        first: usize,
        second: usize,
    },
    #[error("{pass}: row {row} is '{found}' but the canonical pass had '{expected}'")]
    Mismatch {
        pass: String,
        row: usize,
        expected: String,
        found: String,
    },
    #[error("{pass}: saw {found} rows but the canonical pass had {expected}")]
    RowCount {
        pass: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Default)]
pub struct RowOrderLedger {
    ids: Vec<String>,
    positions: AHashMap<String, usize>,
}

impl RowOrderLedger {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            ids: Vec::with_capacity(rows),
            positions: AHashMap::with_capacity(rows),
        }
    }

    /// Appends the identifiers of one chunk of the canonical pass.
    pub fn record(&mut self, chunk_ids: &[String]) -> Result<(), RowOrderError> {
        for id in chunk_ids {
            let row = self.ids.len();
            if let Some(&first) = self.positions.get(id) {
                return Err(RowOrderError::DuplicateIdentifier {
                    id: id.clone(),
                    first,
                    second: row,
                });
            }
            self.positions.insert(id.clone(), row);
            self.ids.push(id.clone());
        }
        Ok(())
    }

    /// Checks one chunk of a replay pass starting at row `start`.
    pub fn verify(&self, pass: &str, start: usize, chunk_ids: &[String]) -> Result<(), RowOrderError> {
        let end = start + chunk_ids.len();
        if end > self.ids.len() {
            return Err(RowOrderError::RowCount {
                pass: pass.to_string(),
                expected: self.ids.len(),
                found: end,
            });
        }
        for (offset, (found, expected)) in chunk_ids.iter().zip(&self.ids[start..end]).enumerate() {
            if found != expected {
                return Err(RowOrderError::Mismatch {
                    pass: pass.to_string(),
                    row: start + offset,
                    expected: expected.clone(),
                    found: found.clone(),
                });
            }
        }
        Ok(())
    }

    /// Checks that a replay pass ended exactly where the canonical pass did.
    pub fn verify_complete(&self, pass: &str, rows: usize) -> Result<(), RowOrderError> {
        if rows != self.ids.len() {
            return Err(RowOrderError::RowCount {
                pass: pass.to_string(),
                expected: self.ids.len(),
                found: rows,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn into_ids(self) -> Vec<String> {
        self.ids
    }
}
