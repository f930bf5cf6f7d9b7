// ==============================================================================
// parsers/mod.rs - File parser modules
// ==============================================================================
// Description: Readers for variant call input files
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-20
// Version: 1.0.0
// ==============================================================================

pub mod vcf;

pub use vcf::{ParsedVariant, VCFParseError, VCFReader};
