// ==============================================================================
// main.rs - gnomAD Merge Entry Point
// ==============================================================================
// Description: Command line entry point: merge VCF files into a variant store,
//              export the store as VCF or Parquet
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-26
// Version: 1.1.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gnomad_merge::aggregator::DEFAULT_BATCH_SIZE;
use gnomad_merge::{
    export, MergeConfig, MergeProcessor, MergeSummary, MultiAllelicPolicy, OutputFormat,
    VariantStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge genome (and optionally exome) VCF files into a variant store
    Merge {
        /// SQLite store to create or extend
        #[arg(short, long)]
        output: PathBuf,

        /// Exome VCF, merged after all genome VCFs
        #[arg(long)]
        exome_vcf: Option<PathBuf>,

        /// Records per transaction
        #[arg(long, env = "GNOMAD_MERGE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Multi-allelic records: reject or first (keep the first ALT allele)
        #[arg(long, default_value = "reject")]
        multi_allelic: MultiAllelicPolicy,

        /// Merge files that are already in the ingest log again
        #[arg(long)]
        allow_reprocess: bool,

        /// Write the run summary as JSON
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Genome VCF files (plain, .gz or .bgz), merged in the given order
        #[arg(required = true)]
        genome_vcfs: Vec<PathBuf>,
    },

    /// Export a variant store as VCF (stdout by default) or Parquet
    Export {
        /// SQLite store to read
        db_path: PathBuf,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// vcf, vcf-gz or parquet; guessed from the output name when omitted
        #[arg(long)]
        format: Option<OutputFormat>,

        /// Rows per Parquet row group
        #[arg(long, env = "GNOMAD_MERGE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries exported VCF
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gnomad_merge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Merge {
            output,
            exome_vcf,
            batch_size,
            multi_allelic,
            allow_reprocess,
            summary,
            genome_vcfs,
        } => {
            let config = MergeConfig::new()
                .with_batch_size(batch_size)
                .with_multi_allelic(multi_allelic);

            let mut inputs = genome_vcfs;
            inputs.extend(exome_vcf);

            let summary_report = run_merge(&output, config, allow_reprocess, &inputs)?;

            if let Some(path) = summary {
                write_summary(&path, &summary_report)?;
            }
        }
        Command::Export {
            db_path,
            output,
            format,
            batch_size,
        } => {
            let format = format.unwrap_or_else(|| {
                output
                    .as_deref()
                    .map(OutputFormat::from_path)
                    .unwrap_or(OutputFormat::Vcf)
            });

            let store = VariantStore::open_read_only(&db_path)
                .with_context(|| format!("Failed to open variant store {:?}", db_path))?;
            export(&store, format, output.as_deref(), batch_size)
                .with_context(|| format!("Failed to export {:?}", db_path))?;
        }
    }

    Ok(())
}

fn run_merge(
    db_path: &Path,
    config: MergeConfig,
    allow_reprocess: bool,
    inputs: &[PathBuf],
) -> Result<MergeSummary> {
    // Invalid configuration fails before the store is touched
    let processor = MergeProcessor::new(config)
        .context("Invalid merge configuration")?
        .with_allow_reprocess(allow_reprocess);

    info!("Opening variant store: {:?}", db_path);
    let mut store = VariantStore::open(db_path)
        .with_context(|| format!("Failed to open variant store {:?}", db_path))?;

    processor
        .merge_files(&mut store, inputs)
        .context("Merge failed")
}

fn write_summary(path: &Path, summary: &MergeSummary) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create summary file {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("Failed to write summary file {:?}", path))?;

    info!("Run summary written to {:?}", path);
    Ok(())
}
