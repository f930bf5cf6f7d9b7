// ==============================================================================
// lib.rs - gnomAD Merge Library
// ==============================================================================
// Description: Library interface for merging VCF allele statistics into a
//              SQLite variant store and exporting it again
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-26
// Version: 1.1.0
// ==============================================================================

pub mod parsers;
pub mod models;
pub mod normalizer;
pub mod store;
pub mod aggregator;
pub mod projector;
pub mod processor;
pub mod output;

pub use aggregator::{batches, BatchAggregator, ConfigError, MergeConfig, MergeStats};
pub use models::{MultiAllelicPolicy, StoredRow, VariantKey, VariantRecord};
pub use normalizer::{NormalizeError, Normalizer};
pub use output::{export, OutputError, OutputFormat};
pub use processor::{FileSummary, MergeError, MergeProcessor, MergeSummary};
pub use projector::{allele_frequency, project, OutputRecord};
pub use store::{StoreError, VariantStore};
