//! Range updater
//!
//! Pulls values from a source iterator and writes them into a segment as
//! chunk files: fixed-size batches, a monotonic time check, the on-disk
//! crash marker, and optionally a producer/consumer pool writing chunks in
//! parallel while metadata is published in flush-index order.

use crate::chunk::ChunkWriter;
use crate::storage::SegmentTable;
use crate::{
    config, ChunkMeta, Result, SegmentedKey, SeriesError, StreamKey, Timestamp, ValueAdapter,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::debug;

/// One batch of values flushed as one chunk file
struct Batch<V> {
    values: Vec<V>,
    min_time: Timestamp,
    max_time: Timestamp,
}

/// Writes a stream of values into one segment.
///
/// The updater is lock-agnostic: callers hold the segment write lock for
/// the duration of `run` (the lifecycle manager does this for segment
/// initialization and promotion).
pub struct RangeUpdater<'a, K: StreamKey, V: Send> {
    table: &'a SegmentTable<K, V>,
    seg: SegmentedKey<K>,
    parallel: bool,
    redo_last_file: bool,
    batch_size: usize,
    min_time: Option<Timestamp>,
    max_time: Option<Timestamp>,
    count: usize,
}

impl<'a, K: StreamKey, V: Send> RangeUpdater<'a, K, V> {
    pub fn new(table: &'a SegmentTable<K, V>, seg: SegmentedKey<K>) -> Self {
        Self {
            table,
            seg,
            parallel: false,
            redo_last_file: true,
            batch_size: config::BATCH_FLUSH_INTERVAL,
            min_time: None,
            max_time: None,
            count: 0,
        }
    }

    /// Write chunks on a worker pool instead of inline
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Rewrite the last chunk file together with the new values
    pub fn with_redo_last_file(mut self, redo: bool) -> Self {
        self.redo_last_file = redo;
        self
    }

    #[cfg(test)]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Smallest time written by this update
    pub fn min_time(&self) -> Option<Timestamp> {
        self.min_time
    }

    /// Largest end time written by this update
    pub fn max_time(&self) -> Option<Timestamp> {
        self.max_time
    }

    /// Number of values written by this update
    pub fn count(&self) -> usize {
        self.count
    }

    /// Run the update. The crash marker is created first and removed only
    /// after all chunks and metadata have been written; a marker left
    /// behind by a crashed update surfaces as [`SeriesError::IncompleteUpdate`].
    pub fn run(&mut self, source: impl Iterator<Item = V> + Send) -> Result<()> {
        let lock_file = self.table.update_lock_path(&self.seg);
        if lock_file.exists() {
            return Err(SeriesError::IncompleteUpdate(format!(
                "incomplete update found for segment [{}], need to clean up and restore from scratch",
                self.seg
            )));
        }
        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::File::create(&lock_file)?;

        self.do_update(source)?;

        fs::remove_file(&lock_file)?;
        debug!(segment = %self.seg, count = self.count, "update finished");
        Ok(())
    }

    fn do_update(&mut self, source: impl Iterator<Item = V> + Send) -> Result<()> {
        let (update_from, last_values) = self
            .table
            .prepare_for_update(&self.seg, self.redo_last_file)?;
        let adapter = self.table.adapter().clone();
        // skip source elements the storage already holds
        let deduped = source.filter(move |v| {
            update_from.map_or(true, |from| adapter.extract_time(v) >= from)
        });
        let mut elements = last_values.into_iter().chain(deduped);
        if self.parallel {
            self.write_parallel(&mut elements)
        } else {
            self.write_serial(&mut elements)
        }
    }

    fn write_serial(&mut self, elements: &mut (impl Iterator<Item = V> + Send)) -> Result<()> {
        let mut last_max = None;
        let mut flush_index = 0usize;
        while let Some(batch) = self.fill_batch(elements, &mut last_max)? {
            let meta = write_chunk(self.table, &self.seg, &batch)?;
            self.table.finish_chunk(&self.seg, meta)?;
            debug!(
                segment = %self.seg,
                flush_index,
                batch_len = batch.values.len(),
                "flushed chunk"
            );
            flush_index += 1;
            self.track(&batch);
        }
        Ok(())
    }

    /// One producer fills batches into a bounded queue, workers write the
    /// chunk files, and metadata is registered in flush-index order
    /// through a reorder buffer regardless of completion order.
    fn write_parallel(&mut self, elements: &mut (impl Iterator<Item = V> + Send)) -> Result<()> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let seg = self.seg.clone();
        let table = self.table;

        let (batch_tx, batch_rx) = mpsc::sync_channel::<(usize, Batch<V>)>(config::BATCH_QUEUE_SIZE);
        let batch_rx = Arc::new(Mutex::new(batch_rx));
        let (meta_tx, meta_rx) = mpsc::channel::<(usize, Result<(ChunkMeta, Batch<V>)>)>();

        std::thread::scope(|scope| {
            let seg_ref = &seg;
            for _ in 0..workers {
                let rx = Arc::clone(&batch_rx);
                let tx = meta_tx.clone();
                scope.spawn(move || loop {
                    let msg = { rx.lock().recv() };
                    match msg {
                        Ok((idx, batch)) => {
                            let result =
                                write_chunk(table, seg_ref, &batch).map(|meta| (meta, batch));
                            if tx.send((idx, result)).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                });
            }
            drop(meta_tx);

            let mut produce_err = None;
            {
                let mut last_max = None;
                let mut flush_index = 0usize;
                loop {
                    let batch = match self.fill_batch(elements, &mut last_max) {
                        Ok(Some(batch)) => batch,
                        Ok(None) => break,
                        Err(e) => {
                            produce_err = Some(e);
                            break;
                        }
                    };
                    if batch_tx.send((flush_index, batch)).is_err() {
                        produce_err = Some(SeriesError::RetryLater(
                            "chunk writer workers terminated early".to_string(),
                        ));
                        break;
                    }
                    flush_index += 1;
                }
            }
            drop(batch_tx);

            // reorder buffer: publish metadata in flush-index order
            let mut pending: BTreeMap<usize, (ChunkMeta, Batch<V>)> = BTreeMap::new();
            let mut next_index = 0usize;
            let mut write_err = None;
            for (idx, result) in meta_rx {
                match result {
                    Ok(entry) => {
                        pending.insert(idx, entry);
                    }
                    Err(e) => {
                        if write_err.is_none() {
                            write_err = Some(e);
                        }
                    }
                }
                while let Some((meta, batch)) = pending.remove(&next_index) {
                    self.table.finish_chunk(&self.seg, meta)?;
                    self.track(&batch);
                    next_index += 1;
                }
            }
            if let Some(e) = produce_err {
                return Err(e);
            }
            if let Some(e) = write_err {
                return Err(e);
            }
            Ok(())
        })
    }

    fn fill_batch(
        &self,
        elements: &mut impl Iterator<Item = V>,
        last_max: &mut Option<Timestamp>,
    ) -> Result<Option<Batch<V>>> {
        let adapter = self.table.adapter();
        let mut values = Vec::new();
        let mut min_time = None;
        let mut max_time = None;
        while values.len() < self.batch_size {
            let value = match elements.next() {
                Some(value) => value,
                None => break,
            };
            let time = adapter.extract_time(&value);
            if let Some(max) = *last_max {
                if time < max {
                    return Err(SeriesError::Invariant(format!(
                        "new element time [{}] is not after or equal to previous element end time [{}] for segment [{}]",
                        time, max, self.seg
                    )));
                }
            }
            let end_time = adapter.extract_end_time(&value);
            *last_max = Some(end_time);
            if min_time.is_none() {
                min_time = Some(time);
            }
            max_time = Some(end_time);
            values.push(value);
        }
        match (min_time, max_time) {
            (Some(min_time), Some(max_time)) => Ok(Some(Batch {
                values,
                min_time,
                max_time,
            })),
            _ => Ok(None),
        }
    }

    fn track(&mut self, batch: &Batch<V>) {
        if self.min_time.is_none() {
            self.min_time = Some(batch.min_time);
        }
        self.max_time = Some(batch.max_time);
        self.count += batch.values.len();
    }
}

fn write_chunk<K: StreamKey, V>(
    table: &SegmentTable<K, V>,
    seg: &SegmentedKey<K>,
    batch: &Batch<V>,
) -> Result<ChunkMeta> {
    let adapter = table.adapter();
    let path = table.new_chunk_path(seg, batch.min_time)?;
    let mut writer = ChunkWriter::create(&path, adapter.fixed_length())?;
    let mut first_value = None;
    let mut last_value = Vec::new();
    for value in &batch.values {
        let encoded = adapter.encode(value)?;
        writer.append(&encoded)?;
        if first_value.is_none() {
            first_value = Some(encoded.clone());
        }
        last_value = encoded;
    }
    writer.close()?;
    Ok(ChunkMeta {
        path,
        first_time: batch.min_time,
        last_time: batch.max_time,
        first_value: first_value.unwrap_or_default(),
        last_value,
    })
}
