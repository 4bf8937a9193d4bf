//! Conversions between [`Table`] rows and arrow2 chunks.
//!
//! Every column is a nullable `Utf8` array. Artifacts produced elsewhere may
//! carry other types; those are rendered to text when read back. Binary
//! cells become hex, except in the geometry column where WKB becomes WKT.

use arrow2::array::{get_display, Array, BinaryArray, MutableUtf8Array, Utf8Array};
use arrow2::chunk::Chunk;
use arrow2::datatypes::{DataType, Field, Schema};

use crate::geometry::{wkb_to_wkt, GEOMETRY_COLUMN};
use crate::record::{Row, Table};

pub fn text_schema(columns: &[String]) -> Schema {
    Schema::from(
        columns
            .iter()
            .map(|c| Field::new(c.as_str(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    )
}

pub fn table_to_chunk(table: &Table) -> Chunk<Box<dyn Array>> {
    let arrays = (0..table.columns.len())
        .map(|i| {
            let mut col = MutableUtf8Array::<i32>::with_capacity(table.rows.len());
            for row in &table.rows {
                col.push(row.get(i).and_then(|v| v.as_deref()));
            }
            let col: Utf8Array<i32> = col.into();
            col.boxed()
        })
        .collect();
    Chunk::new(arrays)
}

fn binary_to_text<'a>(values: impl Iterator<Item = Option<&'a [u8]>>, name: &str) -> Vec<Option<String>> {
    let geometry = name == GEOMETRY_COLUMN;
    values
        .map(|v| {
            v.and_then(|bytes| {
                if geometry {
                    wkb_to_wkt(bytes)
                } else {
                    Some(hex::encode(bytes))
                }
            })
        })
        .collect()
}

fn column_to_text(array: &dyn Array, name: &str) -> Result<Vec<Option<String>>, std::fmt::Error> {
    let any = array.as_any();
    if let Some(utf8) = any.downcast_ref::<Utf8Array<i32>>() {
        return Ok(utf8.iter().map(|v| v.map(str::to_string)).collect());
    }
    if let Some(utf8) = any.downcast_ref::<Utf8Array<i64>>() {
        return Ok(utf8.iter().map(|v| v.map(str::to_string)).collect());
    }
    if let Some(bin) = any.downcast_ref::<BinaryArray<i32>>() {
        return Ok(binary_to_text(bin.iter(), name));
    }
    if let Some(bin) = any.downcast_ref::<BinaryArray<i64>>() {
        return Ok(binary_to_text(bin.iter(), name));
    }

    let display = get_display::<String>(array, "");
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                return Ok(None);
            }
            let mut text = String::new();
            display(&mut text, i)?;
            Ok(Some(text))
        })
        .collect()
}

/// Transposes a chunk into rows of text. `names` are the chunk's column
/// names, in order.
pub fn chunk_to_rows(chunk: &Chunk<Box<dyn Array>>, names: &[String]) -> Result<Vec<Row>, std::fmt::Error> {
    let columns = chunk
        .arrays()
        .iter()
        .enumerate()
        .map(|(i, a)| column_to_text(a.as_ref(), names.get(i).map_or("", String::as_str)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows: Vec<Row> = (0..chunk.len())
        .map(|_| Vec::with_capacity(columns.len()))
        .collect();
    for column in columns {
        for (row, value) in rows.iter_mut().zip(column) {
            row.push(value);
        }
    }
    Ok(rows)
}
