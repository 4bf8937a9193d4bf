//! Single-file SQLite store holding text-only tables.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rand::Rng;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, Statement, Transaction};
use tracing::warn;

use crate::error::{Error, Result};
use crate::record::{ColumnMap, NullMarker, Row};

pub struct RelationalStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl RelationalStore {
    /// Opens or creates the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA temp_store=MEMORY;")?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        Ok(self.conn.transaction()?)
    }

    /// User tables, sorted by name.
    pub fn table_names(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(names)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        table_exists(&self.conn, table).map_err(Error::from)
    }

    /// Declared columns of `table`, in table order.
    pub fn columns(&self, table: &str) -> Result<Vec<String>> {
        table_columns(&self.conn, table).map_err(|source| Error::SchemaIntrospection {
            table: table.to_string(),
            source,
        })
    }

    /// Like [`columns`](Self::columns), but an unreadable or missing table
    /// contributes no columns instead of failing.
    pub fn columns_or_empty(&self, table: &str) -> Vec<String> {
        match self.columns(table) {
            Ok(cols) => cols,
            Err(e) => {
                warn!(table, error = %e, "treating table as empty");
                Vec::new()
            }
        }
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Every row of `table` in storage order. Meant for inspection and tests;
    /// bulk movement goes through [`copy_rows`].
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let columns = self.columns(table)?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {} FROM {}", column_list(&columns), quote_ident(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_row(row, columns.len())?);
        }
        Ok(out)
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cols)
}

/// A table name of the form `<base>__<purpose>` that no table in `conn`
/// uses yet. Taken names get a random numeric suffix.
pub(crate) fn staging_name(conn: &Connection, base: &str, purpose: &str) -> rusqlite::Result<String> {
    let mut name = format!("{base}__{purpose}");
    let mut rng = rand::rng();
    while table_exists(conn, &name)? {
        name = format!("{base}__{purpose}_{}", rng.random_range(1000..=9999));
    }
    Ok(name)
}

/// Creates `table` with one unconstrained TEXT column per entry.
pub(crate) fn create_text_table(conn: &Connection, table: &str, columns: &[String]) -> rusqlite::Result<()> {
    let defs = columns
        .iter()
        .map(|c| format!("{} TEXT", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(&format!("CREATE TABLE {} ({defs})", quote_ident(table)), [])?;
    Ok(())
}

pub(crate) fn drop_table_if_exists(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    Ok(())
}

pub(crate) fn rename_table(conn: &Connection, from: &str, to: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to)),
        [],
    )?;
    Ok(())
}

fn value_to_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(hex::encode(b)),
    }
}

fn read_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Row> {
    (0..width).map(|i| row.get_ref(i).map(value_to_text)).collect()
}

/// Prepared multi-row sink for one destination table.
pub(crate) struct RowWriter<'conn> {
    insert: Statement<'conn>,
    written: usize,
}

impl<'conn> RowWriter<'conn> {
    pub(crate) fn new(conn: &'conn Connection, table: &str, columns: &[String]) -> rusqlite::Result<Self> {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote_ident(table),
            column_list(columns)
        );
        Ok(Self {
            insert: conn.prepare(&sql)?,
            written: 0,
        })
    }

    pub(crate) fn write_page(&mut self, page: &mut Vec<Row>) -> rusqlite::Result<()> {
        for row in page.drain(..) {
            self.insert.execute(params_from_iter(row.iter()))?;
            self.written += 1;
        }
        Ok(())
    }

    pub(crate) fn written(&self) -> usize {
        self.written
    }
}

/// Streams `src_columns` of `src_table` into `dst_table` under `unified`,
/// `page_size` rows at a time. Values land under their own column name;
/// unified columns the source lacks get `null`. Returns rows copied.
#[allow(clippy::too_many_arguments)]
pub(crate) fn copy_rows(
    src: &Connection,
    src_table: &str,
    src_columns: &[String],
    dst: &Connection,
    dst_table: &str,
    unified: &[String],
    page_size: usize,
    null: NullMarker,
) -> rusqlite::Result<usize> {
    if src_columns.is_empty() {
        return Ok(0);
    }
    let page_size = page_size.max(1);
    let map = ColumnMap::new(src_columns, unified);
    let sql = format!("SELECT {} FROM {}", column_list(src_columns), quote_ident(src_table));
    let mut stmt = src.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut writer = RowWriter::new(dst, dst_table, unified)?;

    let mut page = Vec::with_capacity(page_size);
    while let Some(row) = rows.next()? {
        let values = read_row(row, src_columns.len())?;
        page.push(map.remap(&values, null));
        if page.len() >= page_size {
            writer.write_page(&mut page)?;
        }
    }
    writer.write_page(&mut page)?;
    Ok(writer.written())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds `table(columns)` in `store` and fills it with `rows`.
    pub(crate) fn seed(store: &RelationalStore, table: &str, columns: &[&str], rows: &[&[Option<&str>]]) {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        create_text_table(store.connection(), table, &columns).unwrap();
        let mut writer = RowWriter::new(store.connection(), table, &columns).unwrap();
        let mut page: Vec<Row> = rows
            .iter()
            .map(|r| r.iter().map(|v| v.map(str::to_string)).collect())
            .collect();
        writer.write_page(&mut page).unwrap();
    }

    #[test]
    fn introspects_tables_and_columns() {
        let store = RelationalStore::open_in_memory().unwrap();
        seed(&store, "incidents", &["id", "severity"], &[&[Some("1"), Some("high")]]);

        assert_eq!(store.table_names().unwrap().into_iter().collect::<Vec<_>>(), vec!["incidents"]);
        assert_eq!(store.columns("incidents").unwrap(), vec!["id", "severity"]);
        assert!(store.columns("missing").unwrap().is_empty());
        assert!(store.columns_or_empty("missing").is_empty());
        assert!(store.table_exists("incidents").unwrap());
        assert!(!store.table_exists("missing").unwrap());
        assert_eq!(store.row_count("incidents").unwrap(), 1);
    }

    #[test]
    fn quoting_handles_awkward_names() {
        let store = RelationalStore::open_in_memory().unwrap();
        seed(&store, "traffic-speed \"v2\"", &["lane id"], &[&[Some("3")]]);
        assert_eq!(store.rows("traffic-speed \"v2\"").unwrap(), vec![vec![Some("3".to_string())]]);
    }

    #[test]
    fn non_text_values_read_back_as_text() {
        let store = RelationalStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE t (a, b, c, d); INSERT INTO t VALUES (42, 1.5, NULL, X'ff00a1');")
            .unwrap();
        assert_eq!(
            store.rows("t").unwrap(),
            vec![vec![Some("42".to_string()), Some("1.5".to_string()), None, Some("ff00a1".to_string())]]
        );
    }

    #[test]
    fn staging_name_skips_existing_tables() {
        let store = RelationalStore::open_in_memory().unwrap();
        assert_eq!(staging_name(store.connection(), "t", "dedup").unwrap(), "t__dedup");

        seed(&store, "t__dedup", &["v"], &[&[Some("keep-me")]]);
        let name = staging_name(store.connection(), "t", "dedup").unwrap();
        assert!(name.starts_with("t__dedup_"));
        assert!(!store.table_exists(&name).unwrap());
    }

    #[test]
    fn broken_view_fails_introspection() {
        let store = RelationalStore::open_in_memory().unwrap();
        store
            .connection()
            .execute_batch("CREATE TABLE gone (a TEXT); CREATE VIEW t AS SELECT a FROM gone; DROP TABLE gone;")
            .unwrap();
        assert!(matches!(store.columns("t"), Err(Error::SchemaIntrospection { .. })));
        assert!(store.columns_or_empty("t").is_empty());
    }

    #[test]
    fn copy_rows_remaps_by_name_in_pages() {
        let src = RelationalStore::open_in_memory().unwrap();
        let rows: Vec<[Option<&str>; 2]> = (0..5).map(|_| [Some("v"), Some("k")]).collect();
        let rows: Vec<&[Option<&str>]> = rows.iter().map(|r| r.as_slice()).collect();
        seed(&src, "t", &["b", "a"], &rows);

        let dst = RelationalStore::open_in_memory().unwrap();
        let unified = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        create_text_table(dst.connection(), "t", &unified).unwrap();

        let copied = copy_rows(
            src.connection(),
            "t",
            &["b".to_string(), "a".to_string()],
            dst.connection(),
            "t",
            &unified,
            2,
            NullMarker::Null,
        )
        .unwrap();
        assert_eq!(copied, 5);
        assert_eq!(dst.rows("t").unwrap()[0], vec![Some("k".into()), Some("v".into()), None]);
    }
}
