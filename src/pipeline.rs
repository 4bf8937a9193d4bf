//! Feed → artifact → store driver.
//!
//! Every feed, artifact and table is an independent unit: a failure is
//! recorded in the [`RunReport`] and the run moves on to the next unit.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, info_span, warn};

use crate::batcher::{batch, concatenate, ConcatSummary};
use crate::config::{FeedConfig, Settings};
use crate::dedup::collapse_duplicates;
use crate::error::{Error, Result};
use crate::flattener::Flattener;
use crate::merger::{append, AppendOptions};
use crate::parquet_io::{artifact_path, ARTIFACT_EXTENSION};
use crate::report::{RunReport, UnitOutcome};
use crate::simple_flattener::SimpleFlattener;
use crate::store::RelationalStore;

/// Batch files live here under the artifact directory until concatenated.
pub const SCRATCH_DIR: &str = ".batches";

pub const DATE_FORMAT: &str = "%d-%m-%Y";

/// Today's date as stamped into `scraped_date`.
pub fn today_stamp() -> String {
    chrono::Local::now().format(DATE_FORMAT).to_string()
}

/// Flattens one feed and folds it into `<artifact_dir>/<name>.parquet`.
///
/// Returns `None` when the feed holds no records with any fields, in which
/// case no artifact is written and a previous one is left as is.
pub fn ingest_feed(feed: &FeedConfig, settings: &Settings) -> Result<Option<ConcatSummary>> {
    let scratch = settings.artifact_dir.join(SCRATCH_DIR);
    fs::create_dir_all(&scratch).map_err(|e| Error::artifact(&scratch, e))?;

    let handles = match feed.selection() {
        Some(selection) => {
            let records = SimpleFlattener::from_path(&feed.path, &feed.record_tag, &selection)?;
            batch(records, &scratch, &feed.name, settings.chunk_size, settings.null_marker)?
        }
        None => {
            let records = Flattener::from_path(&feed.path, &feed.record_tag)?.with_separator(&settings.separator);
            batch(records, &scratch, &feed.name, settings.chunk_size, settings.null_marker)?
        }
    };
    if handles.is_empty() {
        return Ok(None);
    }

    let output = artifact_path(&settings.artifact_dir, &feed.name);
    concatenate(&handles, &output, settings.null_marker).map(Some)
}

/// Runs [`ingest_feed`] over every configured feed.
///
/// Also returns the artifacts written by this run. Artifacts left over from
/// earlier runs, including those of feeds that failed or were skipped now,
/// are not among them.
pub fn ingest_feeds(settings: &Settings) -> (RunReport, Vec<PathBuf>) {
    let mut report = RunReport::new();
    let mut written = Vec::new();
    for feed in &settings.feeds {
        let _span = info_span!("feed", name = %feed.name).entered();
        let outcome = match ingest_feed(feed, settings) {
            Ok(Some(summary)) => {
                let outcome = UnitOutcome::succeeded(&feed.name, summary.rows);
                written.push(summary.path);
                outcome
            }
            Ok(None) => UnitOutcome::skipped(&feed.name, "no records"),
            Err(e) => UnitOutcome::failed(&feed.name, &e),
        };
        report.record(outcome);
    }
    report.log_summary("ingest");
    (report, written)
}

/// Table name for an artifact: its file stem.
pub fn table_name(artifact: &Path) -> Option<String> {
    artifact.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Every `*.parquet` file under `dir`, recursively, sorted by path.
/// Hidden directories (the batch scratch area among them) are skipped.
pub fn find_artifacts(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = fs::read_dir(&current).map_err(|e| Error::artifact(&current, e))?;
        for entry in entries {
            let path = entry.map_err(|e| Error::artifact(&current, e))?.path();
            if path.is_dir() {
                let hidden = path.file_name().is_some_and(|n| n.to_string_lossy().starts_with('.'));
                if !hidden {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|e| e == ARTIFACT_EXTENSION) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Appends each artifact to the table named after it.
pub fn append_artifacts(artifacts: &[PathBuf], store: &mut RelationalStore, opts: &AppendOptions) -> RunReport {
    let mut report = RunReport::new();
    for path in artifacts {
        let unit = path.display().to_string();
        let Some(table) = table_name(path) else {
            report.record(UnitOutcome::skipped(unit, "no file stem"));
            continue;
        };
        let outcome = match append(path, store, &table, opts) {
            Ok(summary) => UnitOutcome::succeeded(unit, summary.rows_appended),
            Err(e) => UnitOutcome::failed(unit, &e),
        };
        report.record(outcome);
    }
    report.log_summary("append");
    report
}

/// The `ingest` command: flatten every feed, append the artifacts this run
/// wrote to the store, then collapse duplicates.
///
/// A feed that fails leaves its table untouched, even when an artifact from
/// an earlier run is still on disk. Only failing to open the store aborts
/// the run.
pub fn run_ingest(settings: &Settings, date: Option<String>) -> Result<RunReport> {
    let (mut report, artifacts) = ingest_feeds(settings);
    if artifacts.is_empty() {
        warn!("no artifacts written this run");
    }

    let mut store = RelationalStore::open(&settings.db_path)?;
    let opts = AppendOptions {
        page_size: settings.page_size,
        null: settings.null_marker,
        drop_empty_columns: settings.drop_empty_columns,
        scraped_date: Some(date.unwrap_or_else(today_stamp)),
    };
    report.extend(append_artifacts(&artifacts, &mut store, &opts));
    report.extend(collapse_duplicates(&mut store)?);

    info!(
        db = %settings.db_path.display(),
        units = report.outcomes.len(),
        failed = report.failures().count(),
        "ingest run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Status;

    fn settings_in(dir: &Path) -> Settings {
        Settings {
            chunk_size: 2,
            artifact_dir: dir.join("artifacts"),
            db_path: dir.join("feeds.db"),
            ..Settings::default()
        }
    }

    fn feed(dir: &Path, name: &str, xml: &str) -> FeedConfig {
        let path = dir.join(format!("{name}.xml"));
        fs::write(&path, xml).unwrap();
        FeedConfig {
            name: name.to_string(),
            path,
            record_tag: "situation".to_string(),
            fields: Vec::new(),
            nested_fields: Vec::new(),
        }
    }

    #[test]
    fn today_stamp_is_day_month_year() {
        let stamp = today_stamp();
        assert_eq!(stamp.len(), 10);
        assert!(chrono::NaiveDate::parse_from_str(&stamp, DATE_FORMAT).is_ok());
    }

    #[test]
    fn find_artifacts_walks_subdirectories_but_not_scratch() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("ndw/2024")).unwrap();
        fs::create_dir_all(dir.path().join(SCRATCH_DIR)).unwrap();
        fs::write(dir.path().join("ndw/2024/incidents.parquet"), b"").unwrap();
        fs::write(dir.path().join("bridges.parquet"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        fs::write(dir.path().join(SCRATCH_DIR).join("x_chunk_00000_1234.parquet"), b"").unwrap();

        let found = find_artifacts(dir.path()).unwrap();
        let names: Vec<_> = found.iter().filter_map(|p| table_name(p)).collect();
        assert_eq!(names, vec!["bridges", "incidents"]);
    }

    #[test]
    fn one_bad_feed_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.feeds = vec![
            feed(dir.path(), "broken", "<r><situation><a>1</b></situation></r>"),
            feed(dir.path(), "empty", "<r/>"),
            feed(
                dir.path(),
                "incidents",
                r#"<r><situation id="1"><severity>high</severity></situation>
                   <situation id="2"><severity>low</severity></situation>
                   <situation id="1"><severity>high</severity></situation></r>"#,
            ),
        ];

        let (report, written) = ingest_feeds(&settings);
        assert_eq!(written, vec![artifact_path(&settings.artifact_dir, "incidents")]);
        assert!(report.get("broken").unwrap().is_failed());
        assert!(matches!(report.get("empty").unwrap().status, Status::Skipped { .. }));
        assert_eq!(report.get("incidents").unwrap().status, Status::Succeeded { rows: 2 });
        assert!(!artifact_path(&settings.artifact_dir, "broken").exists());
        assert_eq!(fs::read_dir(settings.artifact_dir.join(SCRATCH_DIR)).unwrap().count(), 0);
    }

    #[test]
    fn run_ingest_lands_feeds_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.feeds = vec![feed(
            dir.path(),
            "incidents",
            r#"<r><situation id="1"><loc><road>A1</road></loc></situation></r>"#,
        )];

        let report = run_ingest(&settings, Some("01-02-2024".into())).unwrap();
        assert!(report.failures().next().is_none());

        let store = RelationalStore::open(&settings.db_path).unwrap();
        assert_eq!(store.columns("incidents").unwrap(), vec!["id", "loc_road", "scraped_date"]);
        assert_eq!(
            store.rows("incidents").unwrap(),
            vec![vec![Some("1".into()), Some("A1".into()), Some("01-02-2024".into())]]
        );

        // A second run over the same feed adds nothing new after dedup.
        run_ingest(&settings, Some("01-02-2024".into())).unwrap();
        assert_eq!(store.row_count("incidents").unwrap(), 1);
    }

    #[test]
    fn failed_feed_does_not_reappend_its_old_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_in(dir.path());
        settings.feeds = vec![feed(
            dir.path(),
            "incidents",
            r#"<r><situation id="1"><severity>high</severity></situation></r>"#,
        )];
        run_ingest(&settings, Some("01-01-2026".into())).unwrap();
        assert!(artifact_path(&settings.artifact_dir, "incidents").exists());

        fs::write(&settings.feeds[0].path, "<r><situation id=\"1\"><severity>high</b></r>").unwrap();
        let report = run_ingest(&settings, Some("02-01-2026".into())).unwrap();

        assert!(report.get("incidents").unwrap().is_failed());
        assert!(artifact_path(&settings.artifact_dir, "incidents").exists());
        let store = RelationalStore::open(&settings.db_path).unwrap();
        assert_eq!(store.columns("incidents").unwrap(), vec!["id", "scraped_date", "severity"]);
        assert_eq!(
            store.rows("incidents").unwrap(),
            vec![vec![Some("1".into()), Some("01-01-2026".into()), Some("high".into())]]
        );
    }
}
