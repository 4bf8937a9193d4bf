use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ahash::{AHashMap, AHashSet};
use serde::Deserialize;

/// One flattened subtree: path key → text value.
///
/// Key sets vary freely between records of the same feed. A schema only
/// appears once records are gathered into a [`Table`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlatRecord {
    fields: BTreeMap<String, String>,
}

impl FlatRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any earlier value under the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FlatRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut rec = FlatRecord::new();
        for (k, v) in iter {
            rec.insert(k, v);
        }
        rec
    }
}

impl fmt::Display for FlatRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlatRecord(")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}={v:?}")?;
        }
        write!(f, ")")
    }
}

/// Value written into a unified column that a source row never had.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullMarker {
    /// SQL `NULL` / parquet null.
    #[default]
    Null,
    /// The empty string.
    Empty,
}

impl NullMarker {
    pub fn fill(self) -> Option<String> {
        match self {
            NullMarker::Null => None,
            NullMarker::Empty => Some(String::new()),
        }
    }
}

/// A table name plus its ordered text columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Union of every source's columns, sorted lexicographically so the
    /// result does not depend on source order.
    pub fn union<'a, I, S>(name: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = &'a [S]>,
        S: AsRef<str> + 'a,
    {
        let mut set = BTreeSet::new();
        for cols in sources {
            for c in cols {
                set.insert(c.as_ref().to_string());
            }
        }
        Self::new(name, set.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Positional mapping from a unified column list back into a source row.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    slots: Vec<Option<usize>>,
}

impl ColumnMap {
    pub fn new<S: AsRef<str>>(source: &[S], unified: &[String]) -> Self {
        let index: AHashMap<&str, usize> = source
            .iter()
            .enumerate()
            .map(|(i, c)| (c.as_ref(), i))
            .collect();
        let slots = unified.iter().map(|c| index.get(c.as_str()).copied()).collect();
        Self { slots }
    }

    /// Places each source value under its column name in the unified row,
    /// padding the rest with `null`.
    pub fn remap(&self, row: &[Option<String>], null: NullMarker) -> Vec<Option<String>> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Some(i) => row.get(*i).cloned().flatten(),
                None => null.fill(),
            })
            .collect()
    }
}

pub type Row = Vec<Option<String>>;

/// A materialized batch of rows under one column list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Columns are the sorted union of keys seen in `records`.
    pub fn from_records(records: &[FlatRecord], null: NullMarker) -> Self {
        let columns: Vec<String> = records
            .iter()
            .flat_map(FlatRecord::keys)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();

        let rows = records
            .iter()
            .map(|rec| {
                columns
                    .iter()
                    .map(|c| rec.get(c).map(str::to_string).or_else(|| null.fill()))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Re-expresses every row under `unified`.
    pub fn widen_to(&self, unified: &[String], null: NullMarker) -> Table {
        let map = ColumnMap::new(&self.columns, unified);
        Table {
            columns: unified.to_vec(),
            rows: self.rows.iter().map(|r| map.remap(r, null)).collect(),
        }
    }

    /// Removes rows equal on every column to an earlier row. Survivors keep
    /// their first-seen order. Returns the number removed.
    pub fn dedup_rows(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen: AHashSet<Row> = AHashSet::with_capacity(before);
        self.rows.retain(|row| seen.insert(row.clone()));
        before - self.rows.len()
    }
}
