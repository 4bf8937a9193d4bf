//! Streams nested XML feeds into parquet artifacts and merges them into
//! SQLite stores whose tables widen as new columns show up.

pub mod arrow_converter;
pub mod batcher;
pub mod config;
pub mod dedup;
pub mod error;
pub mod flattener;
pub mod geometry;
pub mod log;
pub mod merger;
pub mod parquet_io;
pub mod pipeline;
pub mod record;
pub mod report;
pub mod simple_flattener;
pub mod store;

pub use batcher::{batch, concatenate, BatchHandle, ChunkedBatcher, ConcatSummary};
pub use config::{FeedConfig, Settings};
pub use dedup::collapse_duplicates;
pub use error::{Error, Result};
pub use flattener::{flatten, Flattener};
pub use merger::{append, merge_files, merge_into, AppendOptions, AppendSummary, MergeOptions};
pub use record::{FlatRecord, NullMarker, Table, TableSchema};
pub use report::{RunReport, Status, UnitOutcome};
pub use simple_flattener::{FieldSelection, SimpleFlattener};
pub use store::RelationalStore;
