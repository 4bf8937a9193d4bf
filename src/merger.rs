//! Schema-union merging of relational stores and parquet artifacts.
//!
//! Tables are matched by name. A table's merged columns are the sorted union
//! of every source's columns, all declared TEXT, and rows are moved in pages
//! and remapped by column name so positional order never matters.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::parquet_io::ArtifactReader;
use crate::record::{ColumnMap, NullMarker, Row, TableSchema};
use crate::report::{RunReport, UnitOutcome};
use crate::store::{
    copy_rows, create_text_table, drop_table_if_exists, rename_table, staging_name, table_columns, table_exists,
    RelationalStore, RowWriter,
};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const SCRAPED_DATE_COLUMN: &str = "scraped_date";

#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub page_size: usize,
    pub null: NullMarker,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            null: NullMarker::Null,
        }
    }
}

/// Merges every table of `a` and `b` into `out`.
///
/// Each table is rebuilt from scratch in `out` inside its own transaction;
/// a failing table is rolled back and reported without touching the others.
/// A table whose columns cannot be read from one source is merged from the
/// other source alone.
pub fn merge_into(
    a: &RelationalStore,
    b: &RelationalStore,
    out: &mut RelationalStore,
    opts: MergeOptions,
) -> Result<RunReport> {
    let mut tables = a.table_names()?;
    tables.extend(b.table_names()?);

    let mut report = RunReport::new();
    for table in &tables {
        info!(table, "merging table");
        let outcome = match merge_table(a, b, out, table, opts) {
            Ok(Some(rows)) => UnitOutcome::succeeded(table, rows),
            Ok(None) => UnitOutcome::skipped(table, "no columns in either source"),
            Err(e) => UnitOutcome::failed(table, &e),
        };
        report.record(outcome);
    }
    Ok(report)
}

fn merge_table(
    a: &RelationalStore,
    b: &RelationalStore,
    out: &mut RelationalStore,
    table: &str,
    opts: MergeOptions,
) -> Result<Option<usize>> {
    let cols_a = a.columns_or_empty(table);
    let cols_b = b.columns_or_empty(table);
    let schema = TableSchema::union(table, [cols_a.as_slice(), cols_b.as_slice()]);
    if schema.is_empty() {
        return Ok(None);
    }

    let tx = out.transaction()?;
    let reconcile = |source| Error::Reconciliation {
        table: table.to_string(),
        source,
    };
    drop_table_if_exists(&tx, table).map_err(reconcile)?;
    create_text_table(&tx, table, &schema.columns).map_err(reconcile)?;

    let rows_a = copy_rows(a.connection(), table, &cols_a, &tx, table, &schema.columns, opts.page_size, opts.null)?;
    let rows_b = copy_rows(b.connection(), table, &cols_b, &tx, table, &schema.columns, opts.page_size, opts.null)?;
    tx.commit()?;

    debug!(table, rows_a, rows_b, columns = schema.columns.len(), "table merged");
    Ok(Some(rows_a + rows_b))
}

/// Merges the stores at `a` and `b` into a fresh store at `output`,
/// removing any previous file there first.
pub fn merge_files(a: &Path, b: &Path, output: &Path, opts: MergeOptions) -> Result<(RelationalStore, RunReport)> {
    if output.exists() {
        warn!(path = %output.display(), "removing existing output store");
        fs::remove_file(output).map_err(|e| Error::artifact(output, e))?;
    }
    let store_a = RelationalStore::open(a)?;
    let store_b = RelationalStore::open(b)?;
    let mut out = RelationalStore::open(output)?;
    let report = merge_into(&store_a, &store_b, &mut out, opts)?;
    info!(output = %output.display(), tables = report.outcomes.len(), "merge complete");
    Ok((out, report))
}

#[derive(Debug, Clone)]
pub struct AppendOptions {
    pub page_size: usize,
    pub null: NullMarker,
    /// Leave out artifact columns that carry no value in any row.
    pub drop_empty_columns: bool,
    /// Stamp every appended row with this value under `scraped_date`.
    pub scraped_date: Option<String>,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            null: NullMarker::Null,
            drop_empty_columns: true,
            scraped_date: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendSummary {
    pub table: String,
    pub columns: Vec<String>,
    pub rows_appended: usize,
    /// Existing rows rewritten because the table gained columns.
    pub rows_widened: usize,
}

/// Indices of artifact columns holding at least one non-empty value.
fn populated_columns(path: &Path) -> Result<Vec<bool>> {
    let reader = ArtifactReader::open(path)?;
    let mut populated = vec![false; reader.columns().len()];
    for page in reader {
        for row in page? {
            for (flag, value) in populated.iter_mut().zip(&row) {
                if value.as_deref().is_some_and(|v| !v.is_empty()) {
                    *flag = true;
                }
            }
        }
        if populated.iter().all(|p| *p) {
            break;
        }
    }
    Ok(populated)
}

/// Appends the rows of the artifact at `artifact` to `table` in `dest`.
///
/// The table is created on first sight. When it already exists with fewer
/// columns, its rows are rewritten under the widened schema before the new
/// rows go in; the rewrite and the append share one transaction.
pub fn append(artifact: &Path, dest: &mut RelationalStore, table: &str, opts: &AppendOptions) -> Result<AppendSummary> {
    let keep = if opts.drop_empty_columns {
        populated_columns(artifact)?
    } else {
        vec![true; ArtifactReader::open(artifact)?.columns().len()]
    };

    let reader = ArtifactReader::open(artifact)?;
    // A fresh stamp replaces whatever date column the artifact carried.
    let kept_indices: Vec<usize> = reader
        .columns()
        .iter()
        .enumerate()
        .filter(|(i, c)| keep[*i] && !(opts.scraped_date.is_some() && c.as_str() == SCRAPED_DATE_COLUMN))
        .map(|(i, _)| i)
        .collect();
    let mut source_columns: Vec<String> = kept_indices.iter().map(|i| reader.columns()[*i].clone()).collect();
    if let Some(date) = &opts.scraped_date {
        debug!(table, date, "stamping scraped date");
        source_columns.push(SCRAPED_DATE_COLUMN.to_string());
    }
    if source_columns.is_empty() {
        return Err(Error::artifact(artifact, "artifact has no populated columns"));
    }

    let reconcile = |source| Error::Reconciliation {
        table: table.to_string(),
        source,
    };

    let tx = dest.transaction()?;
    let exists = table_exists(&tx, table)?;
    let existing = if exists {
        table_columns(&tx, table).map_err(|source| Error::SchemaIntrospection {
            table: table.to_string(),
            source,
        })?
    } else {
        Vec::new()
    };
    let schema = TableSchema::union(table, [existing.as_slice(), source_columns.as_slice()]);

    let mut rows_widened = 0;
    if !exists {
        create_text_table(&tx, table, &schema.columns).map_err(reconcile)?;
    } else if existing != schema.columns {
        let staging = staging_name(&tx, table, "widen").map_err(reconcile)?;
        create_text_table(&tx, &staging, &schema.columns).map_err(reconcile)?;
        rows_widened = copy_rows(&tx, table, &existing, &tx, &staging, &schema.columns, opts.page_size, opts.null)
            .map_err(reconcile)?;
        drop_table_if_exists(&tx, table).map_err(reconcile)?;
        rename_table(&tx, &staging, table).map_err(reconcile)?;
        info!(table, rows_widened, from = existing.len(), to = schema.columns.len(), "widened table");
    }

    let map = ColumnMap::new(&source_columns, &schema.columns);
    let page_size = opts.page_size.max(1);
    let rows_appended = {
        let mut writer = RowWriter::new(&tx, table, &schema.columns)?;
        let mut page: Vec<Row> = Vec::with_capacity(page_size);
        for chunk in reader {
            for row in chunk? {
                let mut values: Row = kept_indices.iter().map(|i| row.get(*i).cloned().flatten()).collect();
                if let Some(date) = &opts.scraped_date {
                    values.push(Some(date.clone()));
                }
                page.push(map.remap(&values, opts.null));
                if page.len() >= page_size {
                    writer.write_page(&mut page)?;
                }
            }
        }
        writer.write_page(&mut page)?;
        writer.written()
    };
    tx.commit()?;

    info!(table, rows_appended, columns = schema.columns.len(), "appended artifact");
    Ok(AppendSummary {
        table: table.to_string(),
        columns: schema.columns,
        rows_appended,
        rows_widened,
    })
}
