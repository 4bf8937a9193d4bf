//! Single-level flattener driven by an explicit field allow-list.
//!
//! Older feeds were converted by naming the interesting elements up front
//! instead of walking every path. Each record keeps the boundary's `id`
//! attribute under the boundary tag name, the text of every `fields`
//! element, and for every `nested_fields` element the last text found
//! anywhere beneath it. Everything else is ignored.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use crate::error::{Error, Result};
use crate::flattener::{EventSource, Step};
use crate::record::FlatRecord;

#[derive(Debug, Clone, Default)]
pub struct FieldSelection {
    pub fields: Vec<String>,
    pub nested_fields: Vec<String>,
}

impl FieldSelection {
    pub fn new(fields: Vec<String>, nested_fields: Vec<String>) -> Self {
        Self {
            fields,
            nested_fields,
        }
    }
}

enum Capture {
    Field(String),
    Nested { name: String, value: String },
}

pub struct SimpleFlattener<R: BufRead> {
    events: EventSource<R>,
    record_tag: String,
    fields: HashSet<String>,
    nested: HashSet<String>,
    /// Open elements inside the current record, the boundary included.
    /// Zero when outside any record.
    depth: usize,
    /// Active capture and the depth of the element that started it.
    capture: Option<(usize, Capture)>,
    current: FlatRecord,
    emitted: usize,
    done: bool,
}

impl SimpleFlattener<BufReader<File>> {
    pub fn from_path(
        path: impl AsRef<Path>,
        record_tag: &str,
        selection: &FieldSelection,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::artifact(path, e))?;
        debug!(path = %path.display(), record_tag, "opening document with field selection");
        Ok(Self::from_reader(BufReader::new(file), record_tag, selection))
    }
}

impl<R: BufRead> SimpleFlattener<R> {
    pub fn from_reader(source: R, record_tag: &str, selection: &FieldSelection) -> Self {
        Self {
            events: EventSource::new(source),
            record_tag: record_tag.to_string(),
            fields: selection.fields.iter().cloned().collect(),
            nested: selection.nested_fields.iter().cloned().collect(),
            depth: 0,
            capture: None,
            current: FlatRecord::new(),
            emitted: 0,
            done: false,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn finish_record(&mut self) -> FlatRecord {
        self.capture = None;
        self.emitted += 1;
        std::mem::take(&mut self.current)
    }

    fn open(&mut self, name: String, attrs: Vec<(String, String)>, empty: bool) -> Option<FlatRecord> {
        if self.depth == 0 {
            if name != self.record_tag {
                return None;
            }
            let id = attrs
                .into_iter()
                .find(|(k, _)| k == "id")
                .map(|(_, v)| v)
                .unwrap_or_default();
            self.current = FlatRecord::new();
            self.current.insert(self.record_tag.clone(), id);
            if empty {
                return Some(self.finish_record());
            }
            self.depth = 1;
            return None;
        }

        if let Some((_, capture)) = &mut self.capture {
            // Every element opened under a nested field restarts its value,
            // self-closing ones included, so the innermost, last text wins.
            if let Capture::Nested { value, .. } = capture {
                value.clear();
            }
            if !empty {
                self.depth += 1;
            }
            return None;
        }

        if empty {
            if self.fields.contains(&name) || self.nested.contains(&name) {
                self.current.insert(name, "");
            }
            return None;
        }

        self.depth += 1;

        if self.fields.contains(&name) {
            self.current.insert(name.clone(), "");
            self.capture = Some((self.depth, Capture::Field(name)));
        } else if self.nested.contains(&name) {
            let value = String::new();
            self.capture = Some((self.depth, Capture::Nested { name, value }));
        }
        None
    }

    fn close(&mut self) -> Option<FlatRecord> {
        if self.depth == 0 {
            return None;
        }
        if self.capture.as_ref().is_some_and(|(d, _)| *d == self.depth) {
            if let Some((_, Capture::Nested { name, value })) = self.capture.take() {
                self.current.insert(name, value);
            }
        }
        self.depth -= 1;
        if self.depth == 0 {
            return Some(self.finish_record());
        }
        None
    }

    fn text(&mut self, text: &str) {
        let piece = text.trim();
        match &mut self.capture {
            Some((_, Capture::Field(name))) => {
                let mut joined = self.current.get(name).unwrap_or_default().to_string();
                joined.push_str(piece);
                self.current.insert(name.clone(), joined);
            }
            Some((_, Capture::Nested { value, .. })) => value.push_str(piece),
            None => {}
        }
    }
}

impl<R: BufRead> Iterator for SimpleFlattener<R> {
    type Item = Result<FlatRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let capturing = self.capture.is_some();
            let step = match self.events.next_step(capturing, &self.record_tag) {
                Ok(step) => step,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match step {
                Step::Open { name, attrs, empty } => {
                    if let Some(rec) = self.open(name, attrs, empty) {
                        return Some(Ok(rec));
                    }
                }
                Step::Close => {
                    if let Some(rec) = self.close() {
                        return Some(Ok(rec));
                    }
                }
                Step::Text(text) => self.text(&text),
                Step::Eof => {
                    self.done = true;
                    debug!(records = self.emitted, "document exhausted");
                    return None;
                }
                Step::Skip => {}
            }
        }
    }
}
