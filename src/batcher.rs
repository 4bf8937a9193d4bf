use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parquet_io::{read_table, write_table, ARTIFACT_EXTENSION};
use crate::record::{FlatRecord, NullMarker, Table, TableSchema};

/// An intermediate artifact written by [`ChunkedBatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub path: PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
}

/// Result of folding batch artifacts into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcatSummary {
    pub path: PathBuf,
    pub columns: Vec<String>,
    pub rows: usize,
    pub duplicates_removed: usize,
}

/// Buffers records and spills every `chunk_size` of them to its own artifact.
///
/// Each artifact's columns are the keys seen in that buffer only, so
/// artifacts of the same run may disagree on their column sets.
pub struct ChunkedBatcher {
    dir: PathBuf,
    stem: String,
    chunk_size: usize,
    null: NullMarker,
    run_tag: u32,
    buffer: Vec<FlatRecord>,
    handles: Vec<BatchHandle>,
}

impl ChunkedBatcher {
    pub fn new(dir: impl Into<PathBuf>, stem: &str, chunk_size: usize, null: NullMarker) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidChunkSize);
        }
        // Random suffix so two runs over the same feed never clash on a name.
        let run_tag = rand::rng().random_range(1000..=9999);
        Ok(Self {
            dir: dir.into(),
            stem: stem.to_string(),
            chunk_size,
            null,
            run_tag,
            buffer: Vec::with_capacity(chunk_size),
            handles: Vec::new(),
        })
    }

    pub fn push(&mut self, record: FlatRecord) -> Result<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.chunk_size {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let flushed = std::mem::take(&mut self.buffer);
        let table = Table::from_records(&flushed, self.null);
        if table.columns.is_empty() {
            debug!(stem = %self.stem, rows = flushed.len(), "dropping batch without any fields");
            return Ok(());
        }

        let path = self.dir.join(format!(
            "{}_chunk_{:05}_{}.{ARTIFACT_EXTENSION}",
            self.stem,
            self.handles.len(),
            self.run_tag
        ));
        write_table(&table, &path)?;
        debug!(path = %path.display(), rows = table.num_rows(), "flushed batch");

        self.handles.push(BatchHandle {
            path,
            rows: table.num_rows(),
            columns: table.columns,
        });
        self.buffer = Vec::with_capacity(self.chunk_size);
        Ok(())
    }

    /// Flushes the trailing partial buffer and returns every artifact written.
    pub fn finish(mut self) -> Result<Vec<BatchHandle>> {
        if !self.buffer.is_empty() {
            self.flush()?;
        }
        Ok(std::mem::take(&mut self.handles))
    }

    /// Deletes every artifact written so far.
    pub fn discard(mut self) {
        remove_artifacts(&std::mem::take(&mut self.handles));
    }
}

fn remove_artifacts(handles: &[BatchHandle]) {
    for handle in handles {
        if let Err(e) = fs::remove_file(&handle.path) {
            warn!(path = %handle.path.display(), error = %e, "could not remove batch artifact");
        }
    }
}

/// Drains `records` into batch artifacts under `dir`.
///
/// If the sequence yields an error, or a batch cannot be written, every
/// artifact produced so far is removed and the error is returned: a failed
/// flatten contributes no rows.
pub fn batch<I>(records: I, dir: &Path, stem: &str, chunk_size: usize, null: NullMarker) -> Result<Vec<BatchHandle>>
where
    I: IntoIterator<Item = Result<FlatRecord>>,
{
    let mut batcher = ChunkedBatcher::new(dir, stem, chunk_size, null)?;
    for record in records {
        let pushed = record.and_then(|r| batcher.push(r));
        if let Err(e) = pushed {
            batcher.discard();
            return Err(e);
        }
    }
    let handles = batcher.finish()?;
    info!(stem, batches = handles.len(), rows = handles.iter().map(|h| h.rows).sum::<usize>(), "batched records");
    Ok(handles)
}

/// Folds batch artifacts into a single artifact at `output`.
///
/// Columns are the sorted union over all batches, absent values padded with
/// `null`; rows equal on every column after padding are kept once. The
/// intermediate artifacts are deleted only after the output has been
/// written, so any read or write failure leaves them all in place.
pub fn concatenate(handles: &[BatchHandle], output: &Path, null: NullMarker) -> Result<ConcatSummary> {
    let mut tables = Vec::with_capacity(handles.len());
    for handle in handles {
        tables.push(read_table(&handle.path)?);
    }

    let schema = TableSchema::union("", tables.iter().map(|t| t.columns.as_slice()));
    let mut combined = Table::new(schema.columns);
    for table in &tables {
        combined.rows.extend(table.widen_to(&combined.columns, null).rows);
    }
    drop(tables);

    let duplicates_removed = combined.dedup_rows();
    write_table(&combined, output)?;
    remove_artifacts(handles);

    info!(
        path = %output.display(),
        rows = combined.num_rows(),
        columns = combined.columns.len(),
        duplicates_removed,
        "concatenated batches"
    );
    Ok(ConcatSummary {
        path: output.to_path_buf(),
        columns: combined.columns,
        rows: combined.rows.len(),
        duplicates_removed,
    })
}
