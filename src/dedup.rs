//! Collapses duplicate rows in every table of a store.
//!
//! Each table is rebuilt as `SELECT DISTINCT` over all of its columns into a
//! staging table that then replaces it. Two rows are duplicates only when
//! every column matches; a NULL and an empty string are distinct values.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::report::{RunReport, UnitOutcome};
use crate::store::{
    column_list, create_text_table, drop_table_if_exists, quote_ident, rename_table, staging_name, table_columns,
    RelationalStore,
};

/// Deduplicates every table in `store`, each in its own transaction.
///
/// A table that fails is rolled back to its previous contents and reported;
/// the remaining tables are still processed.
pub fn collapse_duplicates(store: &mut RelationalStore) -> Result<RunReport> {
    let tables = store.table_names()?;
    let mut report = RunReport::new();
    for table in &tables {
        let outcome = match collapse_table(store, table) {
            Ok(Some((before, after))) => {
                debug!(table, removed = before - after, "deduplicated table");
                UnitOutcome::succeeded(table, after)
            }
            Ok(None) => UnitOutcome::skipped(table, "table has no columns"),
            Err(e) => UnitOutcome::failed(table, &e),
        };
        report.record(outcome);
    }
    report.log_summary("dedup");
    Ok(report)
}

/// Row counts before and after, or `None` for a table without columns.
fn collapse_table(store: &mut RelationalStore, table: &str) -> Result<Option<(usize, usize)>> {
    let before = store.row_count(table)?;
    let tx = store.transaction()?;
    let columns = table_columns(&tx, table).map_err(|source| Error::SchemaIntrospection {
        table: table.to_string(),
        source,
    })?;
    if columns.is_empty() {
        return Ok(None);
    }

    let reconcile = |source| Error::Reconciliation {
        table: table.to_string(),
        source,
    };
    let staging = staging_name(&tx, table, "dedup").map_err(reconcile)?;
    let cols = column_list(&columns);
    create_text_table(&tx, &staging, &columns).map_err(reconcile)?;
    let after = tx
        .execute(
            &format!(
                "INSERT INTO {} ({cols}) SELECT DISTINCT {cols} FROM {}",
                quote_ident(&staging),
                quote_ident(table)
            ),
            [],
        )
        .map_err(reconcile)?;
    drop_table_if_exists(&tx, table).map_err(reconcile)?;
    rename_table(&tx, &staging, table).map_err(reconcile)?;
    tx.commit()?;

    if before != after {
        info!(table, before, after, "collapsed duplicate rows");
    }
    Ok(Some((before, after)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Status;
    use crate::store::tests::seed;

    #[test]
    fn removes_exact_duplicates_only() {
        let mut store = RelationalStore::open_in_memory().unwrap();
        seed(
            &store,
            "incidents",
            &["id", "severity"],
            &[
                &[Some("1"), Some("high")],
                &[Some("1"), Some("high")],
                &[Some("1"), None],
                &[Some("1"), Some("")],
            ],
        );
        let report = collapse_duplicates(&mut store).unwrap();
        assert_eq!(report.get("incidents").unwrap().status, Status::Succeeded { rows: 3 });
        assert_eq!(store.row_count("incidents").unwrap(), 3);
        assert_eq!(store.columns("incidents").unwrap(), vec!["id", "severity"]);
    }

    #[test]
    fn is_idempotent() {
        let mut store = RelationalStore::open_in_memory().unwrap();
        seed(&store, "t", &["a"], &[&[Some("x")], &[Some("x")], &[Some("y")]]);
        collapse_duplicates(&mut store).unwrap();
        let once = store.rows("t").unwrap();
        collapse_duplicates(&mut store).unwrap();
        assert_eq!(store.rows("t").unwrap(), once);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn leaves_sibling_tables_alone() {
        let mut store = RelationalStore::open_in_memory().unwrap();
        seed(&store, "a", &["v"], &[&[Some("1")], &[Some("1")]]);
        seed(&store, "b", &["v"], &[&[Some("2")], &[Some("3")]]);
        collapse_duplicates(&mut store).unwrap();
        assert_eq!(store.row_count("a").unwrap(), 1);
        assert_eq!(store.row_count("b").unwrap(), 2);
        assert_eq!(store.table_names().unwrap().len(), 2);
    }

    #[test]
    fn tables_named_like_staging_survive() {
        let mut store = RelationalStore::open_in_memory().unwrap();
        seed(&store, "t", &["a", "b"], &[&[Some("1"), Some("1")], &[Some("1"), Some("1")]]);
        seed(&store, "t__dedup", &["v"], &[&[Some("keep-me")]]);

        let report = collapse_duplicates(&mut store).unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(
            store.table_names().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["t", "t__dedup"]
        );
        assert_eq!(store.row_count("t").unwrap(), 1);
        assert_eq!(store.rows("t__dedup").unwrap(), vec![vec![Some("keep-me".to_string())]]);
    }

    #[test]
    fn failing_table_rolls_back_and_siblings_proceed() {
        let mut store = RelationalStore::open_in_memory().unwrap();
        // Dropping `parent` violates the foreign key held by `refs`, which is
        // processed after it, so the rebuild of `parent` fails halfway.
        store
            .connection()
            .execute_batch(
                "PRAGMA foreign_keys = ON;
                 CREATE TABLE parent (id TEXT PRIMARY KEY);
                 INSERT INTO parent VALUES ('x');
                 CREATE TABLE refs (pid TEXT REFERENCES parent(id));
                 INSERT INTO refs VALUES ('x'), ('x');",
            )
            .unwrap();
        seed(&store, "other", &["v"], &[&[Some("1")], &[Some("1")]]);

        let report = collapse_duplicates(&mut store).unwrap();

        let parent = report.get("parent").unwrap();
        assert!(matches!(parent.status, Status::Failed { kind: "reconciliation", .. }));
        assert_eq!(store.rows("parent").unwrap(), vec![vec![Some("x".to_string())]]);
        assert_eq!(
            store.table_names().unwrap().into_iter().collect::<Vec<_>>(),
            vec!["other", "parent", "refs"]
        );
        assert_eq!(report.get("refs").unwrap().status, Status::Succeeded { rows: 1 });
        assert_eq!(report.get("other").unwrap().status, Status::Succeeded { rows: 1 });
        assert_eq!(store.row_count("other").unwrap(), 1);
    }
}
