#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
//! Out-of-core principal components for wide feature tables.
//!
//! Tables are streamed as row chunks through a [`source::ChunkSource`]; per-feature
//! moments feed a [`standardize::Standardizer`], and either the randomized SVD path
//! ([`randomized`]) or incremental PCA ([`incremental`]) produces the embedding.

pub mod config;
pub mod embedding;
pub mod faer_ndarray;
pub mod incremental;
pub mod moments;
pub mod order;
pub mod pipeline;
pub mod progress;
pub mod randomized;
pub mod source;
pub mod standardize;
pub mod table;

pub use config::{Algorithm, IncrementalScaler, ReduceConfig};
pub use embedding::{Embedding, OutputLayout};
pub use incremental::{IncrementalArtifact, IncrementalPca};
pub use pipeline::{ReduceError, ReduceOutcome, reduce, reduce_with_progress, transform};
pub use source::{ChunkSource, DenseChunkSource, FeatureChunk};
pub use table::{MissingPolicy, TableOptions, TsvChunkSource};
