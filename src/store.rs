// ==============================================================================
// store.rs - Merged Variant Store
// ==============================================================================
// Description: SQLite-backed store of merged variants with accumulating
//              per-batch upserts and an ingest log of merged input files
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-26
// Version: 1.2.0
// ==============================================================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Statement};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{StoredRow, VariantKey, VariantRecord};

const CREATE_VARIANTS_TABLE: &str = "CREATE TABLE IF NOT EXISTS variants (
    chrom TEXT NOT NULL,
    pos INTEGER NOT NULL,
    id TEXT,
    ref TEXT NOT NULL,
    alt TEXT NOT NULL,
    qual REAL NOT NULL,
    ac INTEGER NOT NULL,
    an INTEGER NOT NULL,
    filter TEXT,
    PRIMARY KEY (chrom, pos, ref, alt)
)";

const CREATE_INGEST_TABLE: &str = "CREATE TABLE IF NOT EXISTS ingested_files (
    sha256 TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    run_id TEXT NOT NULL,
    records INTEGER NOT NULL,
    merged_at TEXT NOT NULL
)";

// Step 1 of the accumulating write: insert when the key is new
const INSERT_VARIANT: &str = "INSERT INTO variants (chrom, pos, id, ref, alt, qual, ac, an, filter)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT (chrom, pos, ref, alt) DO NOTHING";

// Step 2: add AC/AN to the existing row, every other column keeps its first value
const ACCUMULATE_VARIANT: &str = "UPDATE variants SET ac = ac + ?1, an = an + ?2
     WHERE chrom = ?3 AND pos = ?4 AND ref = ?5 AND alt = ?6
     RETURNING ac, an";

const INSERT_INGEST: &str = "INSERT OR REPLACE INTO ingested_files (sha256, path, run_id, records, merged_at)
     VALUES (?1, ?2, ?3, ?4, ?5)";

// rowid order is first-insertion order
const SELECT_VARIANTS: &str = "SELECT chrom, pos, id, ref, alt, qual, ac, an, filter
     FROM variants ORDER BY rowid";

const SELECT_VARIANT: &str = "SELECT chrom, pos, id, ref, alt, qual, ac, an, filter
     FROM variants WHERE chrom = ?1 AND pos = ?2 AND ref = ?3 AND alt = ?4";

/// Variant store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to open variant store {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to create variant store schema: {0}")]
    Schema(#[source] rusqlite::Error),

    #[error("Failed to write batch to variant store: {0}")]
    Write(#[source] rusqlite::Error),

    #[error("Failed to read from variant store: {0}")]
    Read(#[source] rusqlite::Error),
}

/// Result of writing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records whose key was new
    pub inserted: u64,

    /// Records added onto an existing row
    pub accumulated: u64,

    /// Accumulated rows left with AN < AC
    pub allele_count_violations: u64,
}

/// Ingest log entry for one merged input file
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    pub sha256: String,
    pub path: String,
    pub run_id: Uuid,
    pub records: u64,
    pub merged_at: DateTime<Utc>,
}

/// Handle on the merged variant database
///
/// Single writer: every merge operation takes `&mut self`, and each batch is
/// one SQLite transaction.
pub struct VariantStore {
    conn: Connection,
}

impl VariantStore {
    /// Open (or create) a store file and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;

        // journal_mode returns a row, so execute() would fail here
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let store = Self { conn };
        store.create_schema()?;

        info!("Opened variant store: {:?}", path);
        Ok(store)
    }

    /// Open an existing store for export, without creating anything
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self { conn })
    }

    /// In-memory store (tests and dry runs)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;

        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    /// Create the tables; a no-op when they already exist
    pub fn create_schema(&self) -> Result<(), StoreError> {
        self.conn
            .execute(CREATE_VARIANTS_TABLE, [])
            .map_err(StoreError::Schema)?;
        self.conn
            .execute(CREATE_INGEST_TABLE, [])
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    /// Merge one batch of records in a single transaction
    ///
    /// New keys are inserted verbatim; existing keys get AC and AN added.
    /// If any statement fails the transaction is dropped uncommitted, so no
    /// row of the batch is kept.
    ///
    /// AN >= AC is not enforced after accumulation. Rows that end up with
    /// AN < AC are logged and counted in the outcome, but still stored.
    pub fn merge_batch(&mut self, batch: &[VariantRecord]) -> Result<BatchOutcome, StoreError> {
        self.write_batch(batch, None)
    }

    /// Merge the last batch of an input file and log the file in the same
    /// transaction
    ///
    /// Either the batch and the ingest entry are both committed or neither
    /// is, so a fully merged file can never be left out of the ingest log.
    pub fn merge_final_batch(
        &mut self,
        batch: &[VariantRecord],
        entry: &IngestRecord,
    ) -> Result<BatchOutcome, StoreError> {
        self.write_batch(batch, Some(entry))
    }

    fn write_batch(
        &mut self,
        batch: &[VariantRecord],
        entry: Option<&IngestRecord>,
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome::default();

        // Dropping `tx` without commit rolls the whole batch back
        let tx = self.conn.transaction().map_err(StoreError::Write)?;
        {
            let mut insert = tx.prepare_cached(INSERT_VARIANT).map_err(StoreError::Write)?;
            let mut accumulate = tx
                .prepare_cached(ACCUMULATE_VARIANT)
                .map_err(StoreError::Write)?;

            for record in batch {
                let key = &record.key;

                // Step 1: new key, insert verbatim
                let inserted = insert
                    .execute(params![
                        key.chromosome,
                        key.position,
                        record.id,
                        key.ref_allele,
                        key.alt_allele,
                        record.quality.map(f64::from),
                        record.allele_count,
                        record.allele_number,
                        record.filter,
                    ])
                    .map_err(StoreError::Write)?;

                if inserted > 0 {
                    outcome.inserted += 1;
                    continue;
                }

                // Step 2: existing key, add AC/AN and read back the totals
                let (ac, an): (u64, u64) = accumulate
                    .query_row(
                        params![
                            record.allele_count,
                            record.allele_number,
                            key.chromosome,
                            key.position,
                            key.ref_allele,
                            key.alt_allele,
                        ],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(StoreError::Write)?;
                outcome.accumulated += 1;

                if an < ac {
                    warn!("Allele number below allele count after merge at {}: AC={} AN={}", key, ac, an);
                    outcome.allele_count_violations += 1;
                }
            }
        }

        if let Some(entry) = entry {
            insert_ingest(&tx, entry)?;
        }

        tx.commit().map_err(StoreError::Write)?;

        Ok(outcome)
    }

    /// Prepare a scan over every stored row in insertion order
    pub fn rows(&self) -> Result<RowScan<'_>, StoreError> {
        let stmt = self.conn.prepare(SELECT_VARIANTS).map_err(StoreError::Read)?;
        Ok(RowScan { stmt })
    }

    /// Look up a single variant
    pub fn get(&self, key: &VariantKey) -> Result<Option<StoredRow>, StoreError> {
        self.conn
            .query_row(
                SELECT_VARIANT,
                params![key.chromosome, key.position, key.ref_allele, key.alt_allele],
                StoredRow::from_row,
            )
            .optional()
            .map_err(StoreError::Read)
    }

    /// Number of distinct variants stored
    pub fn row_count(&self) -> Result<u64, StoreError> {
        self.conn
            .query_row("SELECT COUNT(*) FROM variants", [], |row| row.get(0))
            .map_err(StoreError::Read)
    }

    /// Find an earlier merge of a file with this SHA-256 fingerprint
    pub fn find_ingest(&self, sha256: &str) -> Result<Option<IngestRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT sha256, path, run_id, records, merged_at
                 FROM ingested_files WHERE sha256 = ?1",
                params![sha256],
                |row| {
                    let run_id: String = row.get(2)?;
                    let run_id = Uuid::parse_str(&run_id).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            2,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?;

                    let merged_at: String = row.get(4)?;
                    let merged_at = DateTime::parse_from_rfc3339(&merged_at)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                4,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?
                        .with_timezone(&Utc);

                    Ok(IngestRecord {
                        sha256: row.get(0)?,
                        path: row.get(1)?,
                        run_id,
                        records: row.get(3)?,
                        merged_at,
                    })
                },
            )
            .optional()
            .map_err(StoreError::Read)
    }

    /// Log a fully merged input file (replaces an earlier entry for the same content)
    ///
    /// Standalone entry point for files that produced no batch to write;
    /// files with data are logged through `merge_final_batch`.
    pub fn record_ingest(&self, entry: &IngestRecord) -> Result<(), StoreError> {
        insert_ingest(&self.conn, entry)
    }
}

fn insert_ingest(conn: &Connection, entry: &IngestRecord) -> Result<(), StoreError> {
    conn.execute(
        INSERT_INGEST,
        params![
            entry.sha256,
            entry.path,
            entry.run_id.to_string(),
            entry.records,
            entry.merged_at.to_rfc3339(),
        ],
    )
    .map_err(StoreError::Write)?;
    Ok(())
}

/// Prepared scan over the `variants` table
pub struct RowScan<'conn> {
    stmt: Statement<'conn>,
}

impl RowScan<'_> {
    /// Lazily yield stored rows; one pass per call
    pub fn iter(
        &mut self,
    ) -> Result<impl Iterator<Item = Result<StoredRow, StoreError>> + '_, StoreError> {
        let rows = self
            .stmt
            .query_map([], StoredRow::from_row)
            .map_err(StoreError::Read)?;

        Ok(rows.map(|row| row.map_err(StoreError::Read)))
    }
}
