// ==============================================================================
// output.rs - Merged Store Export
// ==============================================================================
// Description: Export the merged variant store as VCF, gzip VCF or Parquet
// Author: Matt Barham
// Created: 2025-11-21
// Modified: 2025-11-26
// Version: 1.1.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

// Apache Arrow/Parquet for columnar data
use arrow::array::{ArrayRef, Float32Array, Float64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::aggregator::{batches, ConfigError};
use crate::projector::{project, OutputRecord};
use crate::store::{StoreError, VariantStore};

/// Fixed header of exported VCF files
pub const VCF_HEADER: &str = concat!(
    "##fileformat=VCFv4.2\n",
    "##FILTER=<ID=PASS,Description=\"All filters passed\">\n",
    "##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n",
    "##FORMAT=<ID=AD,Number=R,Type=Integer,Description=\"Allelic depths for the ref and alt alleles in the order listed\">\n",
    "##FORMAT=<ID=DP,Number=1,Type=Integer,Description=\"Read Depth\">\n",
    "##FORMAT=<ID=GQ,Number=1,Type=Integer,Description=\"Genotype Quality\">\n",
    "##FORMAT=<ID=PL,Number=G,Type=Integer,Description=\"Normalized, Phred-scaled likelihoods for genotypes as defined in the VCF specification\">\n",
    "##FILTER=<ID=RF,Description=\"Failed random forests filters (SNV cutoff 0.1, indels cutoff 0.2)\">\n",
    "##FILTER=<ID=AC0,Description=\"Allele Count is zero (i.e. no high-confidence genotype (GQ >= 20, DP >= 10, AB => 0.2 for het calls))\">\n",
    "##FILTER=<ID=InbreedingCoeff,Description=\"InbreedingCoeff < -0.3\">\n",
    "##FILTER=<ID=LCR,Description=\"In a low complexity region\">\n",
    "##FILTER=<ID=SEGDUP,Description=\"In a segmental duplication region\">\n",
    "##INFO=<ID=AC,Number=A,Type=Integer,Description=\"Allele count in genotypes, for each ALT allele, in the same order as listed\">\n",
    "##INFO=<ID=AF,Number=A,Type=Float,Description=\"Allele Frequency among genotypes, for each ALT allele, in the same order as listed\">\n",
    "##INFO=<ID=AN,Number=1,Type=Integer,Description=\"Total number of alleles in called genotypes\">\n",
    "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO",
);

/// Supported export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Plain-text VCF (default, stdout capable)
    Vcf,
    /// Gzip-compressed VCF
    VcfGz,
    /// Apache Parquet (best for data science: Python, R, Spark)
    Parquet,
}

impl OutputFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Vcf => "vcf",
            OutputFormat::VcfGz => "vcf.gz",
            OutputFormat::Parquet => "parquet",
        }
    }

    /// Guess the format from an output file name
    ///
    /// Only `.gz` selects gzip: the writer emits a single gzip member, not
    /// block-gzipped (BGZF) data, so `.bgz` names are left to plain VCF.
    pub fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".parquet") {
            OutputFormat::Parquet
        } else if name.ends_with(".gz") {
            OutputFormat::VcfGz
        } else {
            OutputFormat::Vcf
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vcf" => Ok(OutputFormat::Vcf),
            "vcf-gz" | "vcf.gz" | "gz" => Ok(OutputFormat::VcfGz),
            "parquet" => Ok(OutputFormat::Parquet),
            other => Err(format!("unknown output format '{}' (vcf, vcf-gz, parquet)", other)),
        }
    }
}

/// Export errors
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write output: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Parquet output needs an output file")]
    ParquetNeedsPath,
}

/// Export every stored row
///
/// `destination` None writes to stdout. `rows_per_group` bounds how many rows
/// are buffered for each Parquet row group; text formats stream row by row.
///
/// Returns the number of exported variants.
pub fn export(
    store: &VariantStore,
    format: OutputFormat,
    destination: Option<&Path>,
    rows_per_group: usize,
) -> Result<u64, OutputError> {
    // Stream rows straight from the SQLite cursor
    let mut scan = store.rows()?;
    let records = project(scan.iter()?);

    // Pick the sink: file or stdout, compressed or columnar
    let count = match (format, destination) {
        (OutputFormat::Vcf, Some(path)) => {
            info!("Writing VCF: {:?}", path);
            let file = File::create(path)?;
            let mut writer = BufWriter::new(file);
            let count = write_vcf(&mut writer, records)?;
            writer.flush()?;
            count
        }
        (OutputFormat::Vcf, None) => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            let count = write_vcf(&mut writer, records)?;
            writer.flush()?;
            count
        }
        (OutputFormat::VcfGz, destination) => {
            let sink: Box<dyn Write> = match destination {
                Some(path) => {
                    info!("Writing gzip-compressed VCF: {:?}", path);
                    Box::new(File::create(path)?)
                }
                None => Box::new(io::stdout()),
            };
            let mut encoder =
                flate2::write::GzEncoder::new(BufWriter::new(sink), flate2::Compression::default());
            let count = write_vcf(&mut encoder, records)?;
            // finish() writes the gzip trailer
            encoder.finish()?.flush()?;
            count
        }
        (OutputFormat::Parquet, Some(path)) => {
            info!("Writing Parquet: {:?}", path);
            let file = File::create(path)?;
            write_parquet(file, records, rows_per_group)?
        }
        (OutputFormat::Parquet, None) => return Err(OutputError::ParquetNeedsPath),
    };

    info!("Export complete: {} variants", count);
    Ok(count)
}

/// Write the VCF header followed by one line per record
pub fn write_vcf<W, I>(writer: &mut W, records: I) -> Result<u64, OutputError>
where
    W: Write,
    I: IntoIterator<Item = Result<OutputRecord, StoreError>>,
{
    writeln!(writer, "{}", VCF_HEADER)?;

    let mut count = 0u64;
    for record in records {
        writeln!(writer, "{}", record?)?;
        count += 1;
    }

    Ok(count)
}

/// Arrow schema of the Parquet export; nulls are kept, not replaced by placeholders
pub fn parquet_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("chrom", DataType::Utf8, false),
        Field::new("pos", DataType::UInt64, false),
        Field::new("id", DataType::Utf8, true),
        Field::new("ref", DataType::Utf8, false),
        Field::new("alt", DataType::Utf8, false),
        Field::new("qual", DataType::Float32, false),
        Field::new("filter", DataType::Utf8, true),
        Field::new("ac", DataType::UInt64, false),
        Field::new("an", DataType::UInt64, false),
        Field::new("af", DataType::Float64, true),
    ]))
}

/// Write records as Parquet, one row group per `rows_per_group` records
pub fn write_parquet<W, I>(writer: W, records: I, rows_per_group: usize) -> Result<u64, OutputError>
where
    W: Write + Send,
    I: IntoIterator<Item = Result<OutputRecord, StoreError>>,
{
    let schema = parquet_schema();
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .set_max_row_group_size(rows_per_group.max(1))
        .build();

    let mut writer = ArrowWriter::try_new(writer, schema.clone(), Some(props))?;

    let mut count = 0u64;
    for chunk in batches(records, rows_per_group)? {
        let chunk = chunk.into_iter().collect::<Result<Vec<_>, StoreError>>()?;
        if chunk.is_empty() {
            continue;
        }

        // One Arrow batch per chunk, flushed as its own row group
        let batch = record_batch(&schema, &chunk)?;
        writer.write(&batch)?;
        writer.flush()?;
        count += chunk.len() as u64;
    }

    writer.close()?;
    Ok(count)
}

fn record_batch(schema: &SchemaRef, records: &[OutputRecord]) -> Result<RecordBatch, OutputError> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records.iter().map(|r| r.key.chromosome.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.key.position).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.id.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.key.ref_allele.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.key.alt_allele.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Float32Array::from(
            records.iter().map(|r| r.quality).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records.iter().map(|r| r.filter.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.allele_count).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            records.iter().map(|r| r.allele_number).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            records.iter().map(|r| r.allele_frequency).collect::<Vec<_>>(),
        )),
    ];

    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{VariantKey, VariantRecord};
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn output(pos: u64, id: Option<&str>, ac: u64, an: u64) -> OutputRecord {
        OutputRecord {
            key: VariantKey::new("1", pos, "A", "T"),
            id: id.map(String::from),
            quality: 100.0,
            filter: None,
            allele_count: ac,
            allele_number: an,
            allele_frequency: crate::projector::allele_frequency(ac, an),
        }
    }

    #[test]
    fn test_output_format_extension() {
        assert_eq!(OutputFormat::Vcf.extension(), "vcf");
        assert_eq!(OutputFormat::VcfGz.extension(), "vcf.gz");
        assert_eq!(OutputFormat::Parquet.extension(), "parquet");
    }

    #[test]
    fn test_output_format_from_path() {
        assert_eq!(OutputFormat::from_path(Path::new("merged.vcf")), OutputFormat::Vcf);
        assert_eq!(OutputFormat::from_path(Path::new("merged.vcf.gz")), OutputFormat::VcfGz);
        assert_eq!(
            OutputFormat::from_path(Path::new("out/merged.PARQUET")),
            OutputFormat::Parquet
        );
        assert_eq!(OutputFormat::from_path(Path::new("merged.vcf.bgz")), OutputFormat::Vcf);
    }

    #[test]
    fn test_output_format_parse_and_serde() {
        assert_eq!("vcf-gz".parse::<OutputFormat>().unwrap(), OutputFormat::VcfGz);
        assert!("bam".parse::<OutputFormat>().is_err());

        let json = serde_json::to_string(&OutputFormat::VcfGz).unwrap();
        assert_eq!(json, "\"vcf-gz\"");
    }

    #[test]
    fn test_header_shape() {
        let lines: Vec<&str> = VCF_HEADER.lines().collect();
        assert_eq!(lines[0], "##fileformat=VCFv4.2");
        assert_eq!(lines.len(), 16);
        assert_eq!(
            *lines.last().unwrap(),
            "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO"
        );
        assert!(lines[..lines.len() - 1].iter().all(|l| l.starts_with("##")));
    }

    #[test]
    fn test_write_vcf() {
        let mut buffer = Vec::new();
        let count = write_vcf(
            &mut buffer,
            vec![Ok(output(100, None, 1, 10)), Ok(output(200, Some("rs2"), 0, 0))],
        )
        .unwrap();
        assert_eq!(count, 2);

        let text = String::from_utf8(buffer).unwrap();
        let body: Vec<&str> = text.lines().skip_while(|l| l.starts_with('#')).collect();
        assert_eq!(
            body,
            vec![
                "1\t100\t.\tA\tT\t100\tPASS\tAC=1;AF=0.1;AN=10",
                "1\t200\trs2\tA\tT\t100\tPASS\tAC=0;AF=.;AN=0",
            ]
        );
    }

    #[test]
    fn test_write_vcf_stops_on_read_error() {
        let mut buffer = Vec::new();
        let err = write_vcf(
            &mut buffer,
            vec![
                Ok(output(100, None, 1, 10)),
                Err(StoreError::Read(rusqlite::Error::InvalidQuery)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, OutputError::Store(StoreError::Read(_))));
    }

    #[test]
    fn test_write_parquet_keeps_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.parquet");

        let records = (1..=5).map(|pos| Ok(output(pos, None, 1, if pos == 5 { 0 } else { 4 })));
        let count = write_parquet(File::create(&path).unwrap(), records, 2).unwrap();
        assert_eq!(count, 5);

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<RecordBatch> = reader.map(|b| b.unwrap()).collect();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 5);

        let first = &batches[0];
        assert_eq!(first.schema().fields(), parquet_schema().fields());
        let ids = first.column(2);
        assert!(ids.is_null(0));

        let last = batches.last().unwrap();
        let af = last.column(9);
        assert!(af.is_null(last.num_rows() - 1));
    }

    #[test]
    fn test_export_vcf_file_from_store() {
        let mut store = VariantStore::open_in_memory().unwrap();
        store
            .merge_batch(&[VariantRecord {
                key: VariantKey::new("2", 500, "G", "C"),
                id: Some("rs5".to_string()),
                quality: Some(12.0),
                allele_count: 2,
                allele_number: 4,
                filter: Some("PASS".to_string()),
            }])
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.vcf");
        let count = export(&store, OutputFormat::Vcf, Some(&path), 1000).unwrap();
        assert_eq!(count, 1);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(VCF_HEADER));
        assert!(text.ends_with("2\t500\trs5\tG\tC\t12\tPASS\tAC=2;AF=0.5;AN=4\n"));
    }

    #[test]
    fn test_export_parquet_requires_path() {
        let store = VariantStore::open_in_memory().unwrap();
        let err = export(&store, OutputFormat::Parquet, None, 1000).unwrap_err();
        assert!(matches!(err, OutputError::ParquetNeedsPath));
    }
}
