// ==============================================================================
// processor.rs - Merge Driver
// ==============================================================================
// Description: Runs parse -> normalize -> batch merge for a sequence of VCF
//              files and keeps the ingest log and run summary
// Author: Matt Barham
// Created: 2025-11-21
// Modified: 2025-11-26
// Version: 1.1.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{BatchAggregator, ConfigError, MergeConfig, MergeStats};
use crate::models::VariantRecord;
use crate::normalizer::{NormalizeError, Normalizer};
use crate::parsers::{VCFParseError, VCFReader};
use crate::store::{IngestRecord, StoreError, VariantStore};

/// Errors raised while merging input files
#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Parse(#[from] VCFParseError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to fingerprint {}: {source}", .path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "{} was already merged at {merged_at} (run {run_id}); use allow_reprocess to merge it again",
        .path.display()
    )]
    AlreadyMerged {
        path: PathBuf,
        merged_at: DateTime<Utc>,
        run_id: Uuid,
    },
}

/// Result of merging one input file
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub path: PathBuf,
    pub sha256: String,
    pub stats: MergeStats,
}

/// Result of one merge run
#[derive(Debug, Clone, Serialize)]
pub struct MergeSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config: MergeConfig,
    pub files: Vec<FileSummary>,
    pub totals: MergeStats,

    /// Distinct variants in the store after the run
    pub rows: u64,
}

/// Merges VCF files into a variant store, one file at a time
pub struct MergeProcessor {
    run_id: Uuid,
    aggregator: BatchAggregator,
    normalizer: Normalizer,
    allow_reprocess: bool,
}

impl MergeProcessor {
    /// Fails on an invalid configuration, before any file is opened
    pub fn new(config: MergeConfig) -> Result<Self, MergeError> {
        let aggregator = BatchAggregator::new(config)?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            aggregator,
            normalizer: Normalizer::new(config.multi_allelic),
            allow_reprocess: false,
        })
    }

    /// Merge files whose content is already in the ingest log again
    /// (their AC and AN are added a second time)
    pub fn with_allow_reprocess(mut self, allow: bool) -> Self {
        self.allow_reprocess = allow;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Merge one VCF file into `store`
    ///
    /// The file is logged in the ingest log by the same transaction that
    /// commits its last batch; a failure midway leaves the earlier batches
    /// in the store and the file unlogged.
    pub fn merge_file(
        &self,
        store: &mut VariantStore,
        path: &Path,
    ) -> Result<FileSummary, MergeError> {
        info!("Merging {:?}", path);

        // Fingerprint the raw bytes; the ingest log is keyed on content, not name
        let sha256 = compute_sha256(path).map_err(|source| MergeError::Fingerprint {
            path: path.to_path_buf(),
            source,
        })?;

        // Refuse content that an earlier run already accumulated
        if let Some(previous) = store.find_ingest(&sha256)? {
            if !self.allow_reprocess {
                return Err(MergeError::AlreadyMerged {
                    path: path.to_path_buf(),
                    merged_at: previous.merged_at,
                    run_id: previous.run_id,
                });
            }
            warn!(
                "{:?} was already merged at {} (run {}); counts will be added again",
                path, previous.merged_at, previous.run_id
            );
        }

        // Parse and normalize lazily, one batch at a time
        let mut reader = VCFReader::open(path)?;
        let normalizer = self.normalizer;
        let records = reader
            .variants()
            .map(|variant| -> Result<VariantRecord, MergeError> {
                Ok(normalizer.normalize(variant?)?)
            });

        // The ingest entry commits with the file's last batch
        let display_path = path.display().to_string();
        let stats = self.aggregator.merge_logged(store, records, |records| IngestRecord {
            sha256: sha256.clone(),
            path: display_path.clone(),
            run_id: self.run_id,
            records,
            merged_at: Utc::now(),
        })?;

        info!(
            "Merged {:?}: {} records ({} new variants, {} accumulated)",
            path, stats.records, stats.inserted, stats.accumulated
        );
        if stats.allele_count_violations > 0 {
            warn!(
                "{:?}: {} variants have AN < AC after accumulation",
                path, stats.allele_count_violations
            );
        }

        Ok(FileSummary {
            path: path.to_path_buf(),
            sha256,
            stats,
        })
    }

    /// Merge files strictly in the given order, stopping at the first error
    pub fn merge_files<P: AsRef<Path>>(
        &self,
        store: &mut VariantStore,
        paths: &[P],
    ) -> Result<MergeSummary, MergeError> {
        let started_at = Utc::now();
        info!("Starting merge run {} over {} files", self.run_id, paths.len());

        let mut files = Vec::with_capacity(paths.len());
        let mut totals = MergeStats::default();
        for path in paths {
            let summary = self.merge_file(store, path.as_ref())?;
            totals.absorb(&summary.stats);
            files.push(summary);
        }

        let rows = store.row_count()?;
        info!(
            "Merge run {} complete: {} records from {} files, {} distinct variants",
            self.run_id,
            totals.records,
            files.len(),
            rows
        );

        Ok(MergeSummary {
            run_id: self.run_id,
            started_at,
            finished_at: Utc::now(),
            config: *self.aggregator.config(),
            files,
            totals,
            rows,
        })
    }
}

/// SHA-256 of a file's raw bytes, lowercase hex
pub fn compute_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
