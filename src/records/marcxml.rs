//! Splitting upload files into record inputs.

use crate::error::{HarvestError, Result};
use crate::types::{RecordInput, RecordKey};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

struct OpenRecord {
    start: usize,
    depth: usize,
    key: Option<String>,
    in_key_field: bool,
}

/// Split a MARC-XML document into its `<record>` elements, keyed by the 001
/// control field. Each input keeps the record's original bytes.
pub fn split_collection(xml: &str) -> Result<Vec<RecordInput>> {
    let mut reader = Reader::from_str(xml);
    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut open: Option<OpenRecord> = None;

    loop {
        let before = reader.buffer_position();
        let event = reader.read_event().map_err(|e| {
            HarvestError::MalformedRecord(format!("at byte {}: {e}", reader.buffer_position()))
        })?;

        match event {
            Event::Eof => break,
            Event::Start(start) => {
                depth += 1;
                if let Some(record) = open.as_mut() {
                    record.in_key_field = is_key_field(&start)?;
                } else if start.local_name().as_ref() == b"record" {
                    open = Some(OpenRecord {
                        start: before,
                        depth,
                        key: None,
                        in_key_field: false,
                    });
                }
            }
            Event::Empty(start) if open.is_none() && start.local_name().as_ref() == b"record" => {
                return Err(missing_key(records.len()));
            }
            Event::Text(text) => {
                if let Some(record) = open.as_mut().filter(|r| r.in_key_field) {
                    let value = text
                        .unescape()
                        .map_err(|e| HarvestError::MalformedRecord(e.to_string()))?;
                    record.key = Some(value.trim().to_string());
                }
            }
            Event::End(_) => {
                if let Some(record) = open.as_mut() {
                    record.in_key_field = false;
                    if record.depth == depth {
                        let record = open.take().ok_or_else(|| missing_key(records.len()))?;
                        let key = record
                            .key
                            .filter(|k| !k.is_empty())
                            .ok_or_else(|| missing_key(records.len()))?;
                        let end = reader.buffer_position();
                        records.push(RecordInput::new(key, &xml[record.start..end]));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }

    if open.is_some() {
        return Err(HarvestError::MalformedRecord("unterminated record".into()));
    }
    Ok(records)
}

/// Keys of a delete file: one per line, blank lines ignored.
pub fn parse_deletes(text: &str) -> Vec<RecordKey> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(RecordKey::from)
        .collect()
}

fn is_key_field(start: &BytesStart<'_>) -> Result<bool> {
    if start.local_name().as_ref() != b"controlfield" {
        return Ok(false);
    }
    for attr in start.attributes() {
        let attr = attr.map_err(|e| HarvestError::MalformedRecord(e.to_string()))?;
        if attr.key.as_ref() == b"tag" && attr.value.as_ref() == b"001" {
            return Ok(true);
        }
    }
    Ok(false)
}

fn missing_key(index: usize) -> HarvestError {
    HarvestError::MalformedRecord(format!("record {index} has no 001 control field"))
}
