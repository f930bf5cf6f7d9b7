// ==============================================================================
// models.rs - Merged Variant Data Models
// ==============================================================================
// Description: Canonical variant records, store rows and merge policies
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-24
// Version: 1.1.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a genomic variant in the merged store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantKey {
    /// Chromosome name as written in the source VCF (e.g., "1", "chrX")
    pub chromosome: String,

    /// 1-based position
    pub position: u64,

    /// Reference allele
    pub ref_allele: String,

    /// Alternate allele (exactly one)
    pub alt_allele: String,
}

impl VariantKey {
    pub fn new(
        chromosome: impl Into<String>,
        position: u64,
        ref_allele: impl Into<String>,
        alt_allele: impl Into<String>,
    ) -> Self {
        Self {
            chromosome: chromosome.into(),
            position,
            ref_allele: ref_allele.into(),
            alt_allele: alt_allele.into(),
        }
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chromosome, self.position, self.ref_allele, self.alt_allele
        )
    }
}

/// Canonical variant record produced by the normalizer
///
/// Built once per input line and consumed by the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRecord {
    pub key: VariantKey,

    /// rsID(s), None when the source ID column is "."
    pub id: Option<String>,

    /// QUAL column, None when the source value is "."
    pub quality: Option<f32>,

    /// Allele count (AC)
    pub allele_count: u64,

    /// Allele number (AN)
    pub allele_number: u64,

    /// FILTER column, None when no filter annotation was recorded
    /// (distinct from an explicit "PASS")
    pub filter: Option<String>,
}

/// A row of the `variants` table
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub key: VariantKey,
    pub id: Option<String>,
    pub quality: f32,
    pub allele_count: u64,
    pub allele_number: u64,
    pub filter: Option<String>,
}

impl StoredRow {
    /// Column order matches `store::SELECT_VARIANTS`
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        // REAL is stored widened from f32, so narrowing is exact
        let quality: f64 = row.get(5)?;

        Ok(Self {
            key: VariantKey {
                chromosome: row.get(0)?,
                position: row.get(1)?,
                ref_allele: row.get(3)?,
                alt_allele: row.get(4)?,
            },
            id: row.get(2)?,
            quality: quality as f32,
            allele_count: row.get(6)?,
            allele_number: row.get(7)?,
            filter: row.get(8)?,
        })
    }
}

/// How to treat records carrying more than one alternate allele
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MultiAllelicPolicy {
    /// Fail the file on the first multi-allelic record
    #[default]
    Reject,
    /// Keep only the first alternate allele and the first AC value
    FirstAllele,
}

impl FromStr for MultiAllelicPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(MultiAllelicPolicy::Reject),
            "first" | "first-allele" => Ok(MultiAllelicPolicy::FirstAllele),
            other => Err(format!(
                "unknown multi-allelic policy '{}' (reject, first-allele)",
                other
            )),
        }
    }
}
