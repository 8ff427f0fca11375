//! Page rendering: MARC-XML collections, OAI-PMH record fragments and the
//! deletes list, each chunked and gzip-compressed.

use super::chain::{DumpManifest, PageKind};
use super::delta::DeltaPlan;
use crate::error::{HarvestError, Result};
use crate::types::{Record, RecordKey, StreamId, Timestamp};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing::warn;

/// MARC 21 slim namespace.
pub const MARC_NAMESPACE: &str = "http://www.loc.gov/MARC21/slim";

/// Media type of every stored page.
pub const PAGE_CONTENT_TYPE: &str = "application/gzip";

/// Default upper bound (exclusive) on entries per page.
pub const DEFAULT_MAX_RECORDS_PER_PAGE: usize = 5000;

/// Builds OAI identifiers and set specs for one stream.
#[derive(Clone, Debug)]
pub struct OaiIdentity {
    /// Repository identifier, e.g. `pod.example.org`.
    pub namespace: String,
    pub organization: String,
    pub stream: StreamId,
}

impl OaiIdentity {
    /// `oai:{namespace}:{organization}:{stream}:{key}`
    pub fn identifier(&self, key: &RecordKey) -> String {
        format!(
            "oai:{}:{}:{}:{}",
            self.namespace, self.organization, self.stream, key
        )
    }

    pub fn set_spec(&self) -> String {
        self.stream.to_string()
    }
}

/// A record dropped from a run because its MARC-XML is unusable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordDiagnostic {
    pub key: RecordKey,
    pub reason: String,
}

/// One rendered, compressed page.
#[derive(Clone, Debug)]
pub struct Page {
    pub kind: PageKind,
    pub content: Vec<u8>,
    pub records: usize,
}

/// Everything a dump run writes, before it is stored.
#[derive(Clone, Debug, Default)]
pub struct PaginatedDump {
    pub marcxml_pages: Vec<Page>,
    pub deletes_page: Option<Page>,
    pub oai_pages: Vec<Page>,

    /// What the dump publishes; excludes dropped records.
    pub manifest: DumpManifest,

    pub diagnostics: Vec<RecordDiagnostic>,
}

struct NormalizedRecord {
    record: Arc<Record>,
    xml: String,
}

enum OaiEntry<'a> {
    Added(&'a NormalizedRecord),
    Deleted(&'a RecordKey),
}

/// Splits dump contents into pages of strictly fewer than
/// `max_records_per_page` entries.
#[derive(Clone, Copy, Debug)]
pub struct XmlPager {
    max_records_per_page: usize,
}

impl XmlPager {
    pub fn new(max_records_per_page: usize) -> Result<Self> {
        if max_records_per_page < 2 {
            return Err(HarvestError::Config(format!(
                "max_records_per_page must be at least 2, got {max_records_per_page}"
            )));
        }
        Ok(Self {
            max_records_per_page,
        })
    }

    /// Largest number of entries written to one page.
    pub fn chunk_len(&self) -> usize {
        self.max_records_per_page - 1
    }

    /// Render a plan into pages.
    ///
    /// Additions with malformed MARC-XML are left out and reported as
    /// diagnostics; the rest of the run is unaffected.
    pub fn paginate(
        &self,
        plan: &DeltaPlan,
        identity: &OaiIdentity,
        at: Timestamp,
    ) -> Result<PaginatedDump> {
        let mut diagnostics = Vec::new();
        let mut accepted = Vec::with_capacity(plan.additions.len());

        for record in &plan.additions {
            match normalize_record(&record.marcxml) {
                Ok(xml) => accepted.push(NormalizedRecord {
                    record: Arc::clone(record),
                    xml,
                }),
                Err(reason) => {
                    warn!(
                        stream = %record.stream,
                        key = %record.key,
                        %reason,
                        "skipping malformed record"
                    );
                    diagnostics.push(RecordDiagnostic {
                        key: record.key.clone(),
                        reason,
                    });
                }
            }
        }

        let marcxml_pages = accepted
            .chunks(self.chunk_len())
            .map(|chunk| {
                Ok(Page {
                    kind: PageKind::MarcXml,
                    content: gzip(&marcxml_collection(chunk)?)?,
                    records: chunk.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let deletes_page = if plan.deletions.is_empty() {
            None
        } else {
            Some(Page {
                kind: PageKind::Deletes,
                content: gzip(deletes_list(&plan.deletions).as_bytes())?,
                records: plan.deletions.len(),
            })
        };

        let entries: Vec<OaiEntry<'_>> = accepted
            .iter()
            .map(OaiEntry::Added)
            .chain(plan.deletions.iter().map(OaiEntry::Deleted))
            .collect();
        let oai_pages = entries
            .chunks(self.chunk_len())
            .map(|chunk| {
                Ok(Page {
                    kind: PageKind::OaiXml,
                    content: gzip(&oai_fragments(chunk, identity, at)?)?,
                    records: chunk.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let manifest = DumpManifest {
            additions: accepted
                .iter()
                .map(|n| (n.record.key.clone(), n.record.checksum))
                .collect(),
            deletions: plan.deletions.clone(),
        };

        Ok(PaginatedDump {
            marcxml_pages,
            deletes_page,
            oai_pages,
            manifest,
            diagnostics,
        })
    }
}

/// Check that `xml` is a single well-formed `<record>` element and return it
/// without XML declaration, with the MARC namespace on the root if it had
/// none.
pub fn normalize_record(xml: &str) -> std::result::Result<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + MARC_NAMESPACE.len() + 16));

    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {e}", reader.buffer_position()))?;

        match event {
            Event::Eof => break,
            Event::Decl(_) | Event::DocType(_) | Event::PI(_) if depth == 0 => {}
            Event::Comment(_) if depth == 0 => {}
            Event::Text(text) if depth == 0 => {
                if !text.iter().all(u8::is_ascii_whitespace) {
                    return Err("text outside the record element".into());
                }
            }
            Event::Start(start) if depth == 0 => {
                let root = root_element(start, seen_root)?;
                seen_root = true;
                depth = 1;
                write(&mut writer, Event::Start(root))?;
            }
            Event::Empty(start) if depth == 0 => {
                let root = root_element(start, seen_root)?;
                seen_root = true;
                write(&mut writer, Event::Empty(root))?;
            }
            Event::Start(start) => {
                depth += 1;
                write(&mut writer, Event::Start(start))?;
            }
            Event::End(end) => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unexpected closing tag".to_string())?;
                write(&mut writer, Event::End(end))?;
            }
            other if depth == 0 => {
                return Err(format!("unexpected content outside the record: {other:?}"));
            }
            other => write(&mut writer, other)?,
        }
    }

    if !seen_root {
        return Err("no record element".into());
    }
    if depth != 0 {
        return Err("record element is not closed".into());
    }

    String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())
}

fn root_element(start: BytesStart<'_>, seen_root: bool) -> std::result::Result<BytesStart<'static>, String> {
    if seen_root {
        return Err("more than one root element".into());
    }
    if start.local_name().as_ref() != b"record" {
        return Err(format!(
            "root element is <{}>, expected <record>",
            String::from_utf8_lossy(start.name().as_ref())
        ));
    }

    let mut has_namespace = start.name().prefix().is_some();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.key.as_ref() == b"xmlns" {
            has_namespace = true;
        }
    }

    let mut root = start.into_owned();
    if !has_namespace {
        root.push_attribute(("xmlns", MARC_NAMESPACE));
    }
    Ok(root)
}

fn write<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> std::result::Result<(), String> {
    writer.write_event(event).map_err(|e| e.to_string())
}

fn xml_error(e: impl std::fmt::Display) -> HarvestError {
    HarvestError::Xml(e.to_string())
}

fn marcxml_collection(records: &[NormalizedRecord]) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::Start(
            BytesStart::new("collection").with_attributes([("xmlns", MARC_NAMESPACE)]),
        ))
        .map_err(xml_error)?;
    for record in records {
        writer
            .write_event(Event::Text(BytesText::from_escaped(record.xml.as_str())))
            .map_err(xml_error)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("collection")))
        .map_err(xml_error)?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn oai_fragments(entries: &[OaiEntry<'_>], identity: &OaiIdentity, at: Timestamp) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    let set_spec = identity.set_spec();

    for entry in entries {
        let (key, datestamp, deleted) = match entry {
            OaiEntry::Added(n) => (&n.record.key, n.record.created_at.date_string(), false),
            OaiEntry::Deleted(key) => (*key, at.date_string(), true),
        };

        let header = if deleted {
            BytesStart::new("header").with_attributes([("status", "deleted")])
        } else {
            BytesStart::new("header")
        };

        writer
            .write_event(Event::Start(BytesStart::new("record")))
            .map_err(xml_error)?;
        writer.write_event(Event::Start(header)).map_err(xml_error)?;
        for (name, value) in [
            ("identifier", identity.identifier(key)),
            ("datestamp", datestamp),
            ("setSpec", set_spec.clone()),
        ] {
            writer
                .write_event(Event::Start(BytesStart::new(name)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::new(&value)))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesEnd::new(name)))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("header")))
            .map_err(xml_error)?;

        if let OaiEntry::Added(n) = entry {
            writer
                .write_event(Event::Start(BytesStart::new("metadata")))
                .map_err(xml_error)?;
            writer
                .write_event(Event::Text(BytesText::from_escaped(n.xml.as_str())))
                .map_err(xml_error)?;
            writer
                .write_event(Event::End(BytesEnd::new("metadata")))
                .map_err(xml_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("record")))
            .map_err(xml_error)?;
    }

    Ok(writer.into_inner())
}

fn deletes_list(keys: &[RecordKey]) -> String {
    let mut out = String::new();
    for key in keys {
        out.push_str(key.as_str());
        out.push('\n');
    }
    out
}

/// Gzip-compress a page body.
pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Decompress a stored page.
pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}
