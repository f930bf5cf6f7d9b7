// ==============================================================================
// normalizer.rs - Record Normalizer
// ==============================================================================
// Description: Converts parsed VCF lines into canonical variant records
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-24
// Version: 1.1.0
// ==============================================================================

use thiserror::Error;

use crate::models::{MultiAllelicPolicy, VariantKey, VariantRecord};
use crate::parsers::ParsedVariant;

/// INFO key holding the allele count
pub const ALLELE_COUNT_KEY: &str = "AC";

/// INFO key holding the allele number
pub const ALLELE_NUMBER_KEY: &str = "AN";

/// VCF missing value
const MISSING: &str = ".";

/// Normalization errors
///
/// Every variant carries the location of the offending record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Missing {statistic} for variant at {chromosome}:{position}")]
    MissingStatistic {
        statistic: &'static str,
        chromosome: String,
        position: u64,
    },

    #[error("Invalid {statistic} value '{value}' for variant at {chromosome}:{position}")]
    InvalidStatistic {
        statistic: &'static str,
        value: String,
        chromosome: String,
        position: u64,
    },

    #[error(
        "Multi-allelic variant at {chromosome}:{position} has {alt_count} alternate alleles"
    )]
    MultiAllelic {
        chromosome: String,
        position: u64,
        alt_count: usize,
    },

    #[error(
        "AC value '{value}' for variant at {chromosome}:{position} does not match its {alt_count} alternate alleles"
    )]
    AlleleCountArity {
        value: String,
        alt_count: usize,
        chromosome: String,
        position: u64,
    },

    #[error("No alternate allele for variant at {chromosome}:{position}")]
    MissingAlternate { chromosome: String, position: u64 },
}

/// Record normalizer
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: MultiAllelicPolicy,
}

impl Normalizer {
    pub fn new(policy: MultiAllelicPolicy) -> Self {
        Self { policy }
    }

    /// Convert one parsed line into a canonical record
    ///
    /// Only the alternate allele count and the AC/AN statistics are checked;
    /// ID, QUAL and FILTER pass through untouched.
    pub fn normalize(&self, variant: ParsedVariant) -> Result<VariantRecord, NormalizeError> {
        let alt_count = variant.alt_alleles.len();
        if alt_count == 0 {
            return Err(NormalizeError::MissingAlternate {
                chromosome: variant.chromosome,
                position: variant.position,
            });
        }
        if alt_count > 1 && self.policy == MultiAllelicPolicy::Reject {
            return Err(NormalizeError::MultiAllelic {
                chromosome: variant.chromosome,
                position: variant.position,
                alt_count,
            });
        }

        // AC is Number=A: one value per ALT, the first belongs to the kept allele
        let raw_count = raw_statistic(&variant, ALLELE_COUNT_KEY)?;
        let counts: Vec<&str> = raw_count.split(',').collect();
        if counts.len() != alt_count {
            return Err(NormalizeError::AlleleCountArity {
                value: raw_count.to_string(),
                alt_count,
                chromosome: variant.chromosome.clone(),
                position: variant.position,
            });
        }
        let allele_count = parse_statistic(&variant, ALLELE_COUNT_KEY, counts[0])?;

        let raw_number = raw_statistic(&variant, ALLELE_NUMBER_KEY)?;
        let allele_number = parse_statistic(&variant, ALLELE_NUMBER_KEY, raw_number)?;

        let ParsedVariant {
            chromosome,
            position,
            ids,
            ref_allele,
            alt_alleles,
            quality,
            filter,
            ..
        } = variant;

        let alt_allele = alt_alleles.into_iter().next().unwrap_or_default();
        let id = (!ids.is_empty()).then(|| ids.join(";"));

        Ok(VariantRecord {
            key: VariantKey {
                chromosome,
                position,
                ref_allele,
                alt_allele,
            },
            id,
            quality,
            allele_count,
            allele_number,
            filter,
        })
    }
}

fn missing(variant: &ParsedVariant, statistic: &'static str) -> NormalizeError {
    NormalizeError::MissingStatistic {
        statistic,
        chromosome: variant.chromosome.clone(),
        position: variant.position,
    }
}

/// Raw INFO value of `statistic`; absent, flag-only and "." are all missing
fn raw_statistic<'a>(
    variant: &'a ParsedVariant,
    statistic: &'static str,
) -> Result<&'a str, NormalizeError> {
    match variant.info_value(statistic) {
        Some(raw) if raw != MISSING => Ok(raw),
        _ => Err(missing(variant, statistic)),
    }
}

fn parse_statistic(
    variant: &ParsedVariant,
    statistic: &'static str,
    raw: &str,
) -> Result<u64, NormalizeError> {
    if raw == MISSING {
        return Err(missing(variant, statistic));
    }

    raw.parse::<u64>()
        .map_err(|_| NormalizeError::InvalidStatistic {
            statistic,
            value: raw.to_string(),
            chromosome: variant.chromosome.clone(),
            position: variant.position,
        })
}
