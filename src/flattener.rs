//! Streaming flattener for nested XML feeds.
//!
//! The document is read with a quick-xml pull reader, one event at a time.
//! Only the chain of open nodes between the current record boundary and the
//! innermost open element is kept; everything else is dropped as soon as its
//! end tag has been seen. Records come out in document order as a lazy,
//! single-pass iterator.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::FlatRecord;

pub const DEFAULT_SEPARATOR: &str = "_";

/// One open element inside the active record.
#[derive(Debug)]
struct Frame {
    /// Path key relative to the record boundary. Empty for the boundary itself.
    key: String,
    text: String,
    has_children: bool,
}

pub(crate) enum Step {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        empty: bool,
    },
    Close,
    Text(String),
    Eof,
    Skip,
}

/// Pull-reader wrapper shared by the flatteners. Turns quick-xml events into
/// owned [`Step`]s so the caller can mutate its own state freely, and only
/// pays for attribute and text decoding while a record is being captured.
pub(crate) struct EventSource<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
}

impl<R: BufRead> EventSource<R> {
    pub(crate) fn new(source: R) -> Self {
        Self {
            reader: Reader::from_reader(source),
            buf: Vec::with_capacity(4096),
            depth: 0,
        }
    }

    /// Reads the next event. Attributes are decoded when `capturing` or when
    /// the element is `record_tag`; character data only when `capturing`.
    pub(crate) fn next_step(&mut self, capturing: bool, record_tag: &str) -> Result<Step> {
        self.buf.clear();
        let event = match self.reader.read_event_into(&mut self.buf) {
            Ok(ev) => ev,
            Err(e) => {
                let offset = self.reader.error_position() as u64;
                return Err(parse_error_at(offset)(e));
            }
        };
        let decoder = self.reader.decoder();
        let offset = self.reader.buffer_position() as u64;

        let step = match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                if !empty {
                    self.depth += 1;
                }
                let name = decoder
                    .decode(e.local_name().as_ref())
                    .map_err(parse_error_at(offset))?
                    .into_owned();
                let attrs = if capturing || name == record_tag {
                    read_attributes(e, offset)?
                } else {
                    Vec::new()
                };
                Step::Open { name, attrs, empty }
            }
            Event::End(_) => {
                self.depth = self.depth.saturating_sub(1);
                Step::Close
            }
            Event::Text(ref e) if capturing => {
                Step::Text(decoder.decode(e).map_err(parse_error_at(offset))?.into_owned())
            }
            Event::CData(ref e) if capturing => {
                Step::Text(decoder.decode(e).map_err(parse_error_at(offset))?.into_owned())
            }
            Event::GeneralRef(ref e) if capturing => {
                let resolved = match e.resolve_char_ref() {
                    Ok(Some(ch)) => ch.to_string(),
                    Ok(None) => {
                        let name = decoder.decode(e).map_err(parse_error_at(offset))?;
                        match resolve_predefined_entity(&name) {
                            Some(s) => s.to_string(),
                            None => format!("&{name};"),
                        }
                    }
                    Err(err) => return Err(parse_error_at(offset)(err)),
                };
                Step::Text(resolved)
            }
            Event::Eof if self.depth > 0 => {
                return Err(parse_error_at(offset)("unexpected end of document"));
            }
            Event::Eof => Step::Eof,
            _ => Step::Skip,
        };
        Ok(step)
    }
}

/// Lazy sequence of [`FlatRecord`]s, one per `record_tag` subtree.
///
/// Flattening rules, for a node `N` under path `P`:
/// * every attribute `k` of `N` becomes `P_N_k`
/// * a childless `N` with non-blank text becomes `P_N`
/// * children are flattened under `P_N`; later keys overwrite earlier ones
///
/// Keys are relative to the record boundary: its attributes are keyed by
/// bare name and its own text (only when it has no children) by the tag name.
/// Namespace prefixes are stripped from element and attribute names.
///
/// A boundary tag nested inside an open record is treated as an ordinary
/// child of the outer record.
///
/// After the first error the iterator is exhausted. Records already handed
/// out before the error must be discarded by the caller.
pub struct Flattener<R: BufRead> {
    events: EventSource<R>,
    record_tag: String,
    separator: String,
    frames: Vec<Frame>,
    current: FlatRecord,
    emitted: usize,
    done: bool,
}

impl Flattener<BufReader<File>> {
    pub fn from_path(path: impl AsRef<Path>, record_tag: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::artifact(path, e))?;
        debug!(path = %path.display(), record_tag, "opening document");
        Ok(Self::from_reader(BufReader::new(file), record_tag))
    }
}

impl<R: BufRead> Flattener<R> {
    pub fn from_reader(source: R, record_tag: &str) -> Self {
        Self {
            events: EventSource::new(source),
            record_tag: record_tag.to_string(),
            separator: DEFAULT_SEPARATOR.to_string(),
            frames: Vec::new(),
            current: FlatRecord::new(),
            emitted: 0,
            done: false,
        }
    }

    pub fn with_separator(mut self, separator: &str) -> Self {
        self.separator = separator.to_string();
        self
    }

    /// Number of elements currently held open inside the active record.
    pub fn open_nodes(&self) -> usize {
        self.frames.len()
    }

    /// Records yielded so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    fn child_key(&self, parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}{}{name}", self.separator)
        }
    }

    /// Returns a finished record when a childless boundary element closes
    /// immediately (`<tag/>`).
    fn open(&mut self, name: String, attrs: Vec<(String, String)>, empty: bool) -> Option<FlatRecord> {
        let key = match self.frames.last_mut() {
            Some(parent) => {
                parent.has_children = true;
                let parent_key = parent.key.clone();
                self.child_key(&parent_key, &name)
            }
            None if name == self.record_tag => {
                self.current = FlatRecord::new();
                String::new()
            }
            None => return None,
        };

        for (attr, value) in attrs {
            let attr_key = self.child_key(&key, &attr);
            self.current.insert(attr_key, value);
        }

        self.frames.push(Frame {
            key,
            text: String::new(),
            has_children: false,
        });

        if empty {
            self.close_frame()
        } else {
            None
        }
    }

    fn close_frame(&mut self) -> Option<FlatRecord> {
        let frame = self.frames.pop()?;
        if !frame.has_children {
            let text = frame.text.trim();
            if !text.is_empty() {
                let key = if frame.key.is_empty() {
                    self.record_tag.clone()
                } else {
                    frame.key
                };
                self.current.insert(key, text);
            }
        }

        if self.frames.is_empty() {
            self.emitted += 1;
            Some(std::mem::take(&mut self.current))
        } else {
            None
        }
    }
}

pub(crate) fn parse_error_at<E: std::fmt::Display>(offset: u64) -> impl Fn(E) -> Error {
    move |err| Error::Parse {
        offset,
        message: err.to_string(),
    }
}

fn read_attributes(e: &BytesStart<'_>, offset: u64) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(parse_error_at(offset))?;
        if attr.key.as_namespace_binding().is_some() {
            continue;
        }
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(parse_error_at(offset))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

impl<R: BufRead> Iterator for Flattener<R> {
    type Item = Result<FlatRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let capturing = !self.frames.is_empty();
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
                    if let Some(rec) = self.close_frame() {
                        return Some(Ok(rec));
                    }
                }
                Step::Text(text) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.text.push_str(&text);
                    }
                }
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

/// Flattens every `record_tag` subtree of `source`.
pub fn flatten<R: BufRead>(source: R, record_tag: &str) -> Flattener<R> {
    Flattener::from_reader(source, record_tag)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn collect(xml: &str, tag: &str) -> Vec<FlatRecord> {
        flatten(xml.as_bytes(), tag)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn flattens_nested_children_and_attributes() {
        let xml = r#"<root>
            <situation id="s1" version="2">
                <overallSeverity>high</overallSeverity>
                <record>
                    <location lat="52.1" lon="4.3"/>
                    <source><name>NDW</name></source>
                </record>
            </situation>
        </root>"#;
        let recs = collect(xml, "situation");
        assert_eq!(recs.len(), 1);
        let r = &recs[0];
        assert_eq!(r.get("id"), Some("s1"));
        assert_eq!(r.get("version"), Some("2"));
        assert_eq!(r.get("overallSeverity"), Some("high"));
        assert_eq!(r.get("record_location_lat"), Some("52.1"));
        assert_eq!(r.get("record_location_lon"), Some("4.3"));
        assert_eq!(r.get("record_source_name"), Some("NDW"));
        assert_eq!(r.len(), 6);
    }

    #[test]
    fn records_follow_document_order_with_varying_keys() {
        let xml = "<events><event><a>1</a></event><other/><event><b>2</b></event></events>";
        let recs = collect(xml, "event");
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].keys().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(recs[1].keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn repeated_siblings_last_write_wins() {
        let xml = "<r><event><lane>1</lane><lane>2</lane></event></r>";
        let recs = collect(xml, "event");
        assert_eq!(recs[0].get("lane"), Some("2"));
    }

    #[test]
    fn child_keys_override_parent_attributes() {
        let xml = r#"<r><event><sign code="a"><code>b</code></sign></event></r>"#;
        let recs = collect(xml, "event");
        assert_eq!(recs[0].get("sign_code"), Some("b"));
    }

    #[test]
    fn text_of_nodes_with_children_is_ignored() {
        let xml = "<r><event>stray<km>12</km></event><event>solo</event></r>";
        let recs = collect(xml, "event");
        assert_eq!(recs[0].get("event"), None);
        assert_eq!(recs[0].get("km"), Some("12"));
        assert_eq!(recs[1].get("event"), Some("solo"));
    }

    #[test]
    fn strips_namespaces_and_resolves_entities() {
        let xml = r#"<d:root xmlns:d="urn:x"><d:event d:kind="x"><d:road>A1 &amp; A2&#33;</d:road><d:note><![CDATA[<raw>]]></d:note></d:event></d:root>"#;
        let recs = collect(xml, "event");
        assert_eq!(recs[0].get("kind"), Some("x"));
        assert_eq!(recs[0].get("road"), Some("A1 & A2!"));
        assert_eq!(recs[0].get("note"), Some("<raw>"));
    }

    #[test]
    fn self_closing_boundary_is_a_record() {
        let recs = collect(r#"<r><event id="7"/></r>"#, "event");
        assert_eq!(recs, vec![FlatRecord::from_iter([("id", "7")])]);
    }

    #[test]
    fn custom_separator() {
        let recs: Vec<_> = flatten("<r><e><a><b>x</b></a></e></r>".as_bytes(), "e")
            .with_separator(".")
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(recs[0].get("a.b"), Some("x"));
    }

    #[test]
    fn flatten_is_deterministic() {
        let xml = "<r><e x='1'><a>1</a><b><c>2</c></b></e><e><a>3</a></e></r>";
        assert_eq!(collect(xml, "e"), collect(xml, "e"));
    }

    #[test]
    fn mismatched_tags_fail_with_offset() {
        let xml = "<r><e><a>1</b></e></r>";
        let mut it = flatten(xml.as_bytes(), "e");
        match it.next() {
            Some(Err(Error::Parse { offset, .. })) => assert!(offset > 0),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(it.next().is_none());
    }

    #[test]
    fn truncated_document_fails() {
        let xml = "<r><e><a>1</a></e><e><a>2</a>";
        let results: Vec<_> = flatten(xml.as_bytes(), "e").collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Parse { .. })));
    }

    /// Generates `<feed><e><id>N</id><v><w>..</w></v></e>...</feed>` on the
    /// fly so the whole document never exists in memory.
    struct GeneratedFeed {
        next: usize,
        total: usize,
        pending: Vec<u8>,
        closed: bool,
    }

    impl GeneratedFeed {
        fn new(total: usize) -> Self {
            Self {
                next: 0,
                total,
                pending: b"<feed>".to_vec(),
                closed: false,
            }
        }
    }

    impl Read for GeneratedFeed {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.is_empty() {
                if self.next < self.total {
                    self.pending = format!(
                        "<e n=\"{0}\"><id>{0}</id><v><w>{1}</w></v></e>",
                        self.next,
                        self.next * 2
                    )
                    .into_bytes();
                    self.next += 1;
                } else if !self.closed {
                    self.pending = b"</feed>".to_vec();
                    self.closed = true;
                } else {
                    return Ok(0);
                }
            }
            let n = out.len().min(self.pending.len());
            out[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Ok(n)
        }
    }

    #[test]
    fn open_nodes_stay_bounded_by_depth() {
        for total in [10, 1_000, 20_000] {
            let mut it = flatten(BufReader::new(GeneratedFeed::new(total)), "e");
            let mut count = 0;
            while let Some(rec) = it.next() {
                let rec = rec.unwrap();
                assert_eq!(it.open_nodes(), 0);
                assert_eq!(rec.get("id"), Some(count.to_string().as_str()));
                count += 1;
            }
            assert_eq!(count, total);
            assert_eq!(it.emitted(), total);
        }
    }

    #[test]
    fn stopping_early_leaves_remaining_input_unread() {
        let mut it = flatten(BufReader::new(GeneratedFeed::new(1_000_000)), "e");
        let first: Vec<_> = it.by_ref().take(3).collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(it.emitted(), 3);
    }
}
