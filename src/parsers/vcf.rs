// ==============================================================================
// parsers/vcf.rs - VCF file reader
// ==============================================================================
// Description: Streaming reader for sites VCF files using noodles-vcf
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-24
// Version: 1.1.0
// ==============================================================================
// References:
// - VCF 4.2 Spec: https://samtools.github.io/hts-specs/VCFv4.2.pdf
// - noodles-vcf: https://docs.rs/noodles-vcf/0.81.0/noodles_vcf/
// ==============================================================================

use flate2::read::MultiGzDecoder;
use noodles_vcf as vcf;
use noodles_vcf::variant::record::{AlternateBases, Filters, Ids};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

/// 256KB read buffer; gnomAD VCFs run to tens of GB
const READ_BUFFER_CAPACITY: usize = 256 * 1024;

/// One VCF data line, as read from disk
///
/// Fields are copied out of the noodles record so the reader buffer can be
/// reused for the next line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVariant {
    /// CHROM column
    pub chromosome: String,

    /// POS column (1-based)
    pub position: u64,

    /// ID column split on ';', empty when "."
    pub ids: Vec<String>,

    /// REF column
    pub ref_allele: String,

    /// ALT column split on ',', empty when "."
    pub alt_alleles: Vec<String>,

    /// QUAL column, None when "."
    pub quality: Option<f32>,

    /// FILTER column joined with ';', None when "."
    pub filter: Option<String>,

    /// Raw INFO column (semicolon separated key=value pairs)
    pub info: String,
}

impl ParsedVariant {
    /// Look up the raw value of an INFO key
    ///
    /// Flags (keys without `=`) and absent keys both return None.
    pub fn info_value(&self, key: &str) -> Option<&str> {
        self.info.split(';').find_map(|field| {
            let (name, value) = field.split_once('=')?;
            (name == key).then_some(value)
        })
    }
}

/// VCF reading errors
#[derive(Error, Debug)]
pub enum VCFParseError {
    #[error("Failed to open VCF file: {0}")]
    FileOpenError(String),

    #[error("Failed to read VCF header: {0}")]
    HeaderError(String),

    #[error("Failed to parse VCF record {record}: {message}")]
    RecordError { record: usize, message: String },

    #[error("Missing required field in VCF record {record}: {field}")]
    MissingField { record: usize, field: &'static str },
}

/// Streaming VCF reader
///
/// Plain text and gzip/bgzip input are both accepted; compression is picked
/// from the file extension.
pub struct VCFReader {
    reader: vcf::io::Reader<Box<dyn BufRead>>,
    header: vcf::Header,
}

impl VCFReader {
    /// Open a VCF file (`.vcf`, `.vcf.gz` or `.vcf.bgz`) and read its header
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VCFParseError> {
        let path = path.as_ref();

        let file = File::open(path)
            .map_err(|e| VCFParseError::FileOpenError(format!("{}: {}", path.display(), e)))?;

        // MultiGzDecoder handles both plain gzip and BGZF (multi-member gzip)
        let inner: Box<dyn BufRead> = if is_gzipped(path) {
            Box::new(BufReader::with_capacity(
                READ_BUFFER_CAPACITY,
                MultiGzDecoder::new(file),
            ))
        } else {
            Box::new(BufReader::with_capacity(READ_BUFFER_CAPACITY, file))
        };

        Self::from_reader(inner)
    }

    /// Wrap an already opened, uncompressed VCF stream
    pub fn from_reader(inner: Box<dyn BufRead>) -> Result<Self, VCFParseError> {
        let mut reader = vcf::io::Reader::new(inner);

        let header = reader
            .read_header()
            .map_err(|e| VCFParseError::HeaderError(e.to_string()))?;

        Ok(Self { reader, header })
    }

    /// Lazily iterate over the data lines of the file
    ///
    /// Single pass: the underlying stream is consumed as records are pulled.
    pub fn variants(&mut self) -> impl Iterator<Item = Result<ParsedVariant, VCFParseError>> + '_ {
        let header = &self.header;

        self.reader
            .records()
            .enumerate()
            .map(move |(index, result)| {
                let record = result.map_err(|e| VCFParseError::RecordError {
                    record: index + 1,
                    message: e.to_string(),
                })?;
                parse_record(&record, header, index + 1)
            })
    }
}

fn is_gzipped(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("gz") | Some("bgz")
    )
}

fn parse_record(
    record: &vcf::Record,
    header: &vcf::Header,
    index: usize,
) -> Result<ParsedVariant, VCFParseError> {
    let record_error = |e: std::io::Error| VCFParseError::RecordError {
        record: index,
        message: e.to_string(),
    };

    let position = match record.variant_start() {
        Some(Ok(pos)) => usize::from(pos) as u64,
        Some(Err(e)) => return Err(record_error(e)),
        None => {
            return Err(VCFParseError::MissingField {
                record: index,
                field: "POS",
            })
        }
    };

    let ids = record.ids().iter().map(String::from).collect();

    let alt_alleles = record
        .alternate_bases()
        .iter()
        .map(|alt| alt.map(String::from))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(record_error)?;

    let quality = record.quality_score().transpose().map_err(record_error)?;

    let raw_filters = record.filters();
    let filters = raw_filters
        .iter(header)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(record_error)?;
    let filter = (!filters.is_empty()).then(|| filters.join(";"));

    let raw_info = record.info();
    let info: &str = raw_info.as_ref();

    Ok(ParsedVariant {
        chromosome: record.reference_sequence_name().to_string(),
        position,
        ids,
        ref_allele: record.reference_bases().to_string(),
        alt_alleles,
        quality,
        filter,
        info: info.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const HEADER: &str = "##fileformat=VCFv4.2\n\
##INFO=<ID=AC,Number=A,Type=Integer,Description=\"Allele count\">\n\
##INFO=<ID=AN,Number=1,Type=Integer,Description=\"Allele number\">\n\
##FILTER=<ID=RF,Description=\"Failed random forests filters\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n";

    fn reader_for(body: &str) -> VCFReader {
        let data = format!("{}{}", HEADER, body);
        VCFReader::from_reader(Box::new(Cursor::new(data.into_bytes()))).unwrap()
    }

    #[test]
    fn test_parse_full_record() {
        let mut reader = reader_for("1\t17412\trs1;rs2\tC\tA,G\t123.5\tRF\tAC=1,2;AN=72302;DB\n");
        let variants: Vec<_> = reader.variants().collect::<Result<_, _>>().unwrap();

        assert_eq!(variants.len(), 1);
        let v = &variants[0];
        assert_eq!(v.chromosome, "1");
        assert_eq!(v.position, 17412);
        assert_eq!(v.ids, vec!["rs1", "rs2"]);
        assert_eq!(v.ref_allele, "C");
        assert_eq!(v.alt_alleles, vec!["A", "G"]);
        assert_eq!(v.quality, Some(123.5));
        assert_eq!(v.filter.as_deref(), Some("RF"));
        assert_eq!(v.info_value("AC"), Some("1,2"));
        assert_eq!(v.info_value("AN"), Some("72302"));
    }

    #[test]
    fn test_missing_values_become_none() {
        let mut reader = reader_for("X\t100\t.\tA\tT\t.\t.\tAN=10\n");
        let v = reader.variants().next().unwrap().unwrap();

        assert!(v.ids.is_empty());
        assert_eq!(v.quality, None);
        assert_eq!(v.filter, None);
        assert_eq!(v.info_value("AC"), None);
    }

    #[test]
    fn test_info_value_ignores_flags_and_prefixes() {
        let v = ParsedVariant {
            chromosome: "1".to_string(),
            position: 1,
            ids: vec![],
            ref_allele: "A".to_string(),
            alt_alleles: vec!["T".to_string()],
            quality: None,
            filter: None,
            info: "AC_AFR=5;AC;AN=10".to_string(),
        };

        assert_eq!(v.info_value("AC"), None);
        assert_eq!(v.info_value("AC_AFR"), Some("5"));
        assert_eq!(v.info_value("AN"), Some("10"));
    }

    #[test]
    fn test_open_gzipped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.vcf.gz");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            write!(encoder, "{}1\t10\t.\tG\tC\t50\tPASS\tAC=1;AN=2\n", HEADER).unwrap();
            encoder.finish().unwrap();
        }

        let mut reader = VCFReader::open(&path).unwrap();
        let variants: Vec<_> = reader.variants().collect::<Result<_, _>>().unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0].filter.as_deref(), Some("PASS"));
    }

    #[test]
    fn test_open_missing_file() {
        let err = VCFReader::open("/nonexistent/sites.vcf").err().unwrap();
        assert!(matches!(err, VCFParseError::FileOpenError(_)));
    }
}
