// ==============================================================================
// aggregator.rs - Batch Aggregator
// ==============================================================================
// Description: Lazily batches canonical records and merges each batch into
//              the variant store as one transaction
// Author: Matt Barham
// Created: 2025-11-20
// Modified: 2025-11-26
// Version: 1.1.0
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::iter::FusedIterator;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{MultiAllelicPolicy, VariantRecord};
use crate::store::{BatchOutcome, IngestRecord, StoreError, VariantStore};

/// Records per transaction unless configured otherwise
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Log a progress line every this many batches
const PROGRESS_INTERVAL: u64 = 100;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid batch size {0} (must be at least 1)")]
    InvalidBatchSize(usize),
}

/// Merge configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Records per batch (= per transaction); bounds memory use
    pub batch_size: usize,

    /// Treatment of records with more than one ALT allele
    pub multi_allelic: MultiAllelicPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            multi_allelic: MultiAllelicPolicy::default(),
        }
    }
}

impl MergeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set records per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set multi-allelic policy
    pub fn with_multi_allelic(mut self, policy: MultiAllelicPolicy) -> Self {
        self.multi_allelic = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        Ok(())
    }
}

/// Pull-based batching adapter
///
/// Yields `Vec`s of exactly `size` items, then a final shorter batch. An
/// empty source yields one empty batch. Single pass: once the source is
/// exhausted the adapter stays exhausted.
#[derive(Debug)]
pub struct Batches<I> {
    iter: I,
    size: usize,
    emitted: bool,
    done: bool,
}

/// Split `items` into batches of `size`
///
/// Fails before pulling anything when `size` is 0.
pub fn batches<I: IntoIterator>(items: I, size: usize) -> Result<Batches<I::IntoIter>, ConfigError> {
    if size < 1 {
        return Err(ConfigError::InvalidBatchSize(size));
    }

    Ok(Batches {
        iter: items.into_iter(),
        size,
        emitted: false,
        done: false,
    })
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let batch: Vec<I::Item> = self.iter.by_ref().take(self.size).collect();
        if batch.len() < self.size {
            self.done = true;
        }

        // a short batch only follows full ones when it has items
        if batch.is_empty() && self.emitted {
            return None;
        }

        self.emitted = true;
        Some(batch)
    }
}

impl<I: Iterator> FusedIterator for Batches<I> {}

/// Per-file merge statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub records: u64,
    pub batches: u64,
    pub inserted: u64,
    pub accumulated: u64,
    pub allele_count_violations: u64,
}

impl MergeStats {
    fn add_batch(&mut self, records: usize, outcome: &BatchOutcome) {
        self.records += records as u64;
        self.batches += 1;
        self.inserted += outcome.inserted;
        self.accumulated += outcome.accumulated;
        self.allele_count_violations += outcome.allele_count_violations;
    }

    /// Fold another file's statistics into a running total
    pub fn absorb(&mut self, other: &MergeStats) {
        self.records += other.records;
        self.batches += other.batches;
        self.inserted += other.inserted;
        self.accumulated += other.accumulated;
        self.allele_count_violations += other.allele_count_violations;
    }
}

/// Drives batched, accumulating writes into a variant store
#[derive(Debug, Clone)]
pub struct BatchAggregator {
    config: MergeConfig,
}

impl BatchAggregator {
    /// Fails on an invalid configuration, before any I/O happens
    pub fn new(config: MergeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge a stream of records into `store`, one transaction per batch
    ///
    /// Batches are committed strictly in input order. The first error (a
    /// record that failed upstream, or a rejected write) stops the merge;
    /// batches committed before it stay committed, the failing batch leaves
    /// nothing behind.
    ///
    /// Merging the same records twice doubles their AC and AN.
    pub fn merge<I, E>(&self, store: &mut VariantStore, records: I) -> Result<MergeStats, E>
    where
        I: IntoIterator<Item = Result<VariantRecord, E>>,
        E: From<StoreError> + From<ConfigError>,
    {
        let mut stats = MergeStats::default();

        for batch in batches(records, self.config.batch_size)? {
            let batch = batch.into_iter().collect::<Result<Vec<_>, E>>()?;
            if batch.is_empty() {
                debug!("Empty batch, nothing to merge");
                continue;
            }

            let outcome = store.merge_batch(&batch)?;
            self.committed(&mut stats, batch.len(), &outcome);
        }

        Ok(stats)
    }

    /// Like `merge`, but also logs the input in the ingest log
    ///
    /// The entry is written in the transaction of the last batch, so the
    /// input is logged exactly when all of its records are committed.
    /// `entry` receives the total record count. An input without records is
    /// logged on its own.
    pub fn merge_logged<I, E, F>(
        &self,
        store: &mut VariantStore,
        records: I,
        entry: F,
    ) -> Result<MergeStats, E>
    where
        I: IntoIterator<Item = Result<VariantRecord, E>>,
        E: From<StoreError> + From<ConfigError>,
        F: Fn(u64) -> IngestRecord,
    {
        let mut stats = MergeStats::default();
        let mut chunks = batches(records, self.config.batch_size)?.peekable();

        while let Some(batch) = chunks.next() {
            let batch = batch.into_iter().collect::<Result<Vec<_>, E>>()?;
            if batch.is_empty() {
                debug!("Empty batch, nothing to merge");
                continue;
            }

            // Pulls the next batch ahead; at most two batches are held
            let outcome = if chunks.peek().is_none() {
                let total = stats.records + batch.len() as u64;
                store.merge_final_batch(&batch, &entry(total))?
            } else {
                store.merge_batch(&batch)?
            };
            self.committed(&mut stats, batch.len(), &outcome);
        }

        // No batch carried the entry
        if stats.batches == 0 {
            store.record_ingest(&entry(0))?;
        }

        Ok(stats)
    }

    fn committed(&self, stats: &mut MergeStats, records: usize, outcome: &BatchOutcome) {
        stats.add_batch(records, outcome);

        debug!(
            "Batch {} committed: {} inserted, {} accumulated",
            stats.batches, outcome.inserted, outcome.accumulated
        );
        if stats.batches % PROGRESS_INTERVAL == 0 {
            info!("  {} records merged", stats.records);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VariantKey;
    use crate::normalizer::NormalizeError;
    use crate::processor::MergeError;
    use rstest::rstest;

    fn record(pos: u64, ac: u64, an: u64) -> VariantRecord {
        VariantRecord {
            key: VariantKey::new("1", pos, "C", "A"),
            id: None,
            quality: Some(30.0),
            allele_count: ac,
            allele_number: an,
            filter: None,
        }
    }

    #[rstest]
    #[case(10000, 100, 100, 100)]
    #[case(10000, 101, 100, 1)]
    #[case(7, 3, 3, 1)]
    #[case(6, 3, 2, 3)]
    #[case(1, 1000, 1, 1)]
    fn test_batch_sizes(
        #[case] n: usize,
        #[case] size: usize,
        #[case] expected_batches: usize,
        #[case] expected_last: usize,
    ) {
        let chunks: Vec<Vec<usize>> = batches(0..n, size).unwrap().collect();

        assert_eq!(chunks.len(), expected_batches);
        assert_eq!(chunks.last().unwrap().len(), expected_last);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), size);
        }

        let flattened: Vec<usize> = chunks.into_iter().flatten().collect();
        assert_eq!(flattened, (0..n).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input_yields_one_empty_batch() {
        let mut chunks = batches(Vec::<u32>::new(), 10).unwrap();
        assert_eq!(chunks.next(), Some(vec![]));
        assert_eq!(chunks.next(), None);
        assert_eq!(chunks.next(), None);
    }

    #[test]
    fn test_invalid_batch_size() {
        assert_eq!(
            batches(0..10, 0).err(),
            Some(ConfigError::InvalidBatchSize(0))
        );

        let config = MergeConfig::new().with_batch_size(0);
        assert_eq!(
            BatchAggregator::new(config).err(),
            Some(ConfigError::InvalidBatchSize(0))
        );
    }

    #[test]
    fn test_batches_are_lazy() {
        let mut pulled = 0;
        let source = (0..100).inspect(|_| pulled += 1);
        let mut chunks = batches(source, 10).unwrap();

        chunks.next();
        drop(chunks);
        assert_eq!(pulled, 10);
    }

    #[test]
    fn test_merge_twice_doubles_counts() {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::new().with_batch_size(2)).unwrap();
        let input = vec![record(1, 1, 10), record(2, 3, 8), record(3, 0, 4)];

        let first = aggregator
            .merge::<_, MergeError>(&mut store, input.clone().into_iter().map(Ok))
            .unwrap();
        assert_eq!(first.records, 3);
        assert_eq!(first.batches, 2);
        assert_eq!(first.inserted, 3);

        let second = aggregator
            .merge::<_, MergeError>(&mut store, input.clone().into_iter().map(Ok))
            .unwrap();
        assert_eq!(second.accumulated, 3);

        for original in &input {
            let row = store.get(&original.key).unwrap().unwrap();
            assert_eq!(row.allele_count, original.allele_count * 2);
            assert_eq!(row.allele_number, original.allele_number * 2);
        }
    }

    #[test]
    fn test_merge_empty_stream_is_noop() {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::default()).unwrap();

        let stats = aggregator
            .merge::<_, MergeError>(&mut store, std::iter::empty())
            .unwrap();
        assert_eq!(stats, MergeStats::default());
        assert_eq!(store.row_count().unwrap(), 0);
    }

    fn ingest_entry(records: u64) -> IngestRecord {
        IngestRecord {
            sha256: "abc".to_string(),
            path: "sites.vcf".to_string(),
            run_id: uuid::Uuid::new_v4(),
            records,
            merged_at: chrono::Utc::now(),
        }
    }

    #[rstest]
    #[case(5, 2)]
    #[case(4, 2)]
    #[case(1, 1000)]
    fn test_merge_logged_records_entry_with_last_batch(
        #[case] n: u64,
        #[case] size: usize,
    ) {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::new().with_batch_size(size)).unwrap();
        let input = (1..=n).map(|pos| Ok(record(pos, 1, 2)));

        let stats = aggregator
            .merge_logged::<_, MergeError, _>(&mut store, input, ingest_entry)
            .unwrap();
        assert_eq!(stats.records, n);

        let logged = store.find_ingest("abc").unwrap().unwrap();
        assert_eq!(logged.records, n);
    }

    #[test]
    fn test_merge_logged_empty_input_is_still_logged() {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::default()).unwrap();

        let stats = aggregator
            .merge_logged::<_, MergeError, _>(&mut store, std::iter::empty(), ingest_entry)
            .unwrap();
        assert_eq!(stats, MergeStats::default());
        assert_eq!(store.find_ingest("abc").unwrap().unwrap().records, 0);
    }

    #[test]
    fn test_merge_logged_failure_in_last_batch_leaves_input_unlogged() {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::new().with_batch_size(2)).unwrap();

        let mut bad = record(4, 1, 10);
        bad.quality = None;
        let input = vec![record(1, 1, 10), record(2, 1, 10), record(3, 1, 10), bad];

        let err = aggregator
            .merge_logged::<_, MergeError, _>(&mut store, input.into_iter().map(Ok), ingest_entry)
            .unwrap_err();
        assert!(matches!(err, MergeError::Store(StoreError::Write(_))));

        assert_eq!(store.row_count().unwrap(), 2);
        assert!(store.find_ingest("abc").unwrap().is_none());
    }

    #[test]
    fn test_error_aborts_containing_batch_only() {
        let mut store = VariantStore::open_in_memory().unwrap();
        let aggregator = BatchAggregator::new(MergeConfig::new().with_batch_size(2)).unwrap();

        let missing = NormalizeError::MissingStatistic {
            statistic: "AN",
            chromosome: "1".to_string(),
            position: 4,
        };
        let input: Vec<Result<VariantRecord, MergeError>> = vec![
            Ok(record(1, 1, 10)),
            Ok(record(2, 1, 10)),
            Ok(record(3, 1, 10)),
            Err(missing.into()),
            Ok(record(5, 1, 10)),
        ];

        let err = aggregator.merge(&mut store, input).unwrap_err();
        assert!(matches!(
            err,
            MergeError::Normalize(NormalizeError::MissingStatistic { .. })
        ));

        // first batch committed, second (3, error) discarded, third never read
        assert_eq!(store.row_count().unwrap(), 2);
        assert!(store.get(&VariantKey::new("1", 3, "C", "A")).unwrap().is_none());
    }
}
