//! Data loading for chest X-ray report generation.
//!
//! A corpus is a `word2idx.json` vocabulary, a pair of json files mapping
//! study ids to tokenized reports and their lengths, and a directory of
//! images whose file names carry the study id. [`ReportDataset`] turns these
//! into per-sample tensors and [`Batcher`] groups samples into batches.

pub mod batcher;
pub mod captions;
pub mod dataset;
pub mod images;
pub mod vocab;

pub use batcher::{Batch, Batcher};
pub use dataset::ReportDataset;
pub use vocab::Vocabulary;
