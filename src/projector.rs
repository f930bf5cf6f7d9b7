// ==============================================================================
// projector.rs - Row Projector
// ==============================================================================
// Description: Rebuilds exportable VCF records from merged store rows
// Author: Matt Barham
// Created: 2025-11-21
// Modified: 2025-11-24
// Version: 1.0.1
// ==============================================================================

use std::fmt;

use crate::models::{StoredRow, VariantKey};
use crate::store::StoreError;

/// ID column placeholder when no identifier was recorded
pub const MISSING_ID: &str = ".";

/// FILTER column value when no filter annotation was recorded
pub const DEFAULT_FILTER: &str = "PASS";

/// AF placeholder when AN is 0
pub const UNKNOWN_FREQUENCY: &str = ".";

/// Allele frequency, None when AN is 0
pub fn allele_frequency(allele_count: u64, allele_number: u64) -> Option<f64> {
    (allele_number > 0).then(|| allele_count as f64 / allele_number as f64)
}

/// One exported variant
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub key: VariantKey,
    pub id: Option<String>,
    pub quality: f32,
    pub filter: Option<String>,
    pub allele_count: u64,
    pub allele_number: u64,
    pub allele_frequency: Option<f64>,
}

impl From<StoredRow> for OutputRecord {
    fn from(row: StoredRow) -> Self {
        Self {
            allele_frequency: allele_frequency(row.allele_count, row.allele_number),
            key: row.key,
            id: row.id,
            quality: row.quality,
            filter: row.filter,
            allele_count: row.allele_count,
            allele_number: row.allele_number,
        }
    }
}

impl fmt::Display for OutputRecord {
    /// Tab-separated VCF data line (no trailing newline)
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\tAC={};AF=",
            self.key.chromosome,
            self.key.position,
            self.id.as_deref().unwrap_or(MISSING_ID),
            self.key.ref_allele,
            self.key.alt_allele,
            self.quality,
            self.filter.as_deref().unwrap_or(DEFAULT_FILTER),
            self.allele_count,
        )?;

        match self.allele_frequency {
            Some(af) => write!(f, "{}", af)?,
            None => f.write_str(UNKNOWN_FREQUENCY)?,
        }

        write!(f, ";AN={}", self.allele_number)
    }
}

/// Map stored rows to output records, keeping the store's order
pub fn project<I>(rows: I) -> impl Iterator<Item = Result<OutputRecord, StoreError>>
where
    I: IntoIterator<Item = Result<StoredRow, StoreError>>,
{
    rows.into_iter().map(|row| row.map(OutputRecord::from))
}
