//! Parquet artifact files.
//!
//! Writes go to a sibling `.tmp` file that is renamed into place, so a
//! reader never observes a half-written artifact and a rerun overwrites
//! the previous artifact of the same name.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use arrow2::array::Array;
use arrow2::chunk::Chunk;
use arrow2::datatypes::Schema;
use arrow2::io::parquet::read::{self, FileReader};
use arrow2::io::parquet::write::{
    transverse, CompressionOptions, Encoding, FileWriter, RowGroupIterator, Version, WriteOptions,
};
use tracing::debug;

use crate::arrow_converter::{chunk_to_rows, table_to_chunk, text_schema};
use crate::error::{Error, Result};
use crate::record::{Row, Table};

pub const ARTIFACT_EXTENSION: &str = "parquet";

/// Rows decoded per chunk when reading an artifact back.
const READ_CHUNK_ROWS: usize = 8192;

fn write_options() -> WriteOptions {
    WriteOptions {
        write_statistics: true,
        compression: CompressionOptions::Snappy,
        version: Version::V2,
        data_pagesize_limit: None,
    }
}

/// `<dir>/<name>.parquet`
pub fn artifact_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{ARTIFACT_EXTENSION}"))
}

pub fn write_table(table: &Table, path: &Path) -> Result<()> {
    let schema = text_schema(&table.columns);
    let chunk = table_to_chunk(table);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::artifact(parent, e))?;
    }
    let tmp = path.with_extension(format!("{ARTIFACT_EXTENSION}.tmp"));
    if let Err(e) = write_chunk(&schema, chunk, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path).map_err(|e| Error::artifact(path, e))?;

    debug!(path = %path.display(), rows = table.num_rows(), columns = table.columns.len(), "wrote artifact");
    Ok(())
}

fn write_chunk(schema: &Schema, chunk: Chunk<Box<dyn Array>>, path: &Path) -> Result<()> {
    let encodings = schema
        .fields
        .iter()
        .map(|f| transverse(&f.data_type, |_| Encoding::Plain))
        .collect();

    let row_groups = RowGroupIterator::try_new(vec![Ok(chunk)].into_iter(), schema, write_options(), encodings)
        .map_err(|e| Error::artifact(path, e))?;

    let file = File::create(path).map_err(|e| Error::artifact(path, e))?;
    let mut writer =
        FileWriter::try_new(file, schema.clone(), write_options()).map_err(|e| Error::artifact(path, e))?;
    for group in row_groups {
        let group = group.map_err(|e| Error::artifact(path, e))?;
        writer.write(group).map_err(|e| Error::artifact(path, e))?;
    }
    writer.end(None).map_err(|e| Error::artifact(path, e))?;
    Ok(())
}

/// Streams an artifact back as pages of text rows.
pub struct ArtifactReader {
    path: PathBuf,
    columns: Vec<String>,
    chunks: FileReader<File>,
}

impl ArtifactReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| Error::artifact(&path, e))?;
        let metadata = read::read_metadata(&mut file).map_err(|e| Error::artifact(&path, e))?;
        let schema = read::infer_schema(&metadata).map_err(|e| Error::artifact(&path, e))?;
        let columns = schema.fields.iter().map(|f| f.name.clone()).collect();
        let chunks = FileReader::new(
            file,
            metadata.row_groups,
            schema,
            Some(READ_CHUNK_ROWS),
            None,
            None,
        );
        Ok(Self {
            path,
            columns,
            chunks,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Iterator for ArtifactReader {
    type Item = Result<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.chunks.next()?;
        let rows = chunk
            .map_err(|e| Error::artifact(&self.path, e))
            .and_then(|c| chunk_to_rows(&c, &self.columns).map_err(|e| Error::artifact(&self.path, e)));
        Some(rows)
    }
}

/// Reads a whole artifact into memory.
pub fn read_table(path: impl AsRef<Path>) -> Result<Table> {
    let reader = ArtifactReader::open(path)?;
    let mut table = Table::new(reader.columns().to_vec());
    for page in reader {
        table.rows.extend(page?);
    }
    Ok(table)
}
