//! Write-ahead journal for dump commits.
//!
//! A dump run writes `Begin` before storing any attachment and `Commit` once
//! the catalog naming its dump is on disk. A `Begin` without `Commit` found
//! on open means a run died part-way: its attachments may exist but nothing
//! references them, so the repository sweeps them and clears the journal.
//! Whenever the last open operation commits, the file is truncated back to
//! its header.

use crate::dumps::DumpKind;
use crate::error::{HarvestError, Result};
use crate::types::{StreamId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"JRN\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Upper bound for a single entry.
const MAX_ENTRY_LEN: usize = 1024 * 1024;

/// Work announced by a `Begin` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalOperation {
    GenerateDump {
        stream: StreamId,
        kind: DumpKind,
        as_of: Timestamp,
    },
}

/// A begun, not yet committed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub operation: JournalOperation,
    pub started_at: Timestamp,
}

#[derive(Serialize, Deserialize)]
enum JournalRecord {
    Begin(JournalEntry),
    Commit { seq: u64 },
}

/// Append-only journal of dump commits.
pub struct DumpJournal {
    path: PathBuf,

    /// Next sequence number.
    next_seq: Mutex<u64>,

    writer: Mutex<BufWriter<File>>,

    /// Begun, uncommitted sequence numbers. Only changed with `writer` held.
    open: Mutex<BTreeSet<u64>>,
}

impl DumpJournal {
    /// Open or create a journal.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, open) = if path.exists() {
            let records = Self::read_records(&path)?;
            let next_seq = records
                .iter()
                .map(|r| match r {
                    JournalRecord::Begin(entry) => entry.seq,
                    JournalRecord::Commit { seq } => *seq,
                })
                .max()
                .unwrap_or(0)
                + 1;
            let open = Self::uncommitted(records).into_keys().collect();
            (next_seq, open)
        } else {
            Self::write_header(&path)?;
            (1, BTreeSet::new())
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(BufWriter::new(file)),
            open: Mutex::new(open),
        })
    }

    /// Record the start of an operation and return its sequence number.
    pub fn begin(&self, operation: JournalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        let mut writer = self.writer.lock();
        Self::append(
            &mut writer,
            &JournalRecord::Begin(JournalEntry {
                seq,
                operation,
                started_at: Timestamp::now(),
            }),
        )?;
        self.open.lock().insert(seq);

        *next_seq += 1;
        Ok(seq)
    }

    /// Mark an operation as committed, compacting the journal if nothing
    /// else is open.
    pub fn commit(&self, seq: u64) -> Result<()> {
        let mut writer = self.writer.lock();
        Self::append(&mut writer, &JournalRecord::Commit { seq })?;

        let mut open = self.open.lock();
        open.remove(&seq);
        if open.is_empty() {
            writer.flush()?;
            Self::write_header(&self.path)?;
            *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        }
        Ok(())
    }

    /// Operations begun but never committed, in sequence order.
    pub fn pending(&self) -> Result<Vec<JournalEntry>> {
        let records = Self::read_records(&self.path)?;
        Ok(Self::uncommitted(records).into_values().collect())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending()?.is_empty())
    }

    /// Truncate the journal back to its header.
    pub fn clear(&self) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();
        writer.flush()?;

        Self::write_header(&self.path)?;
        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.open.lock().clear();
        *next_seq = 1;

        Ok(())
    }

    /// Size of the journal file in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn uncommitted(records: Vec<JournalRecord>) -> BTreeMap<u64, JournalEntry> {
        let mut begun = BTreeMap::new();
        for record in records {
            match record {
                JournalRecord::Begin(entry) => {
                    begun.insert(entry.seq, entry);
                }
                JournalRecord::Commit { seq } => {
                    begun.remove(&seq);
                }
            }
        }
        begun
    }

    fn append(writer: &mut BufWriter<File>, record: &JournalRecord) -> Result<()> {
        let encoded = rmp_serde::to_vec(record)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Read every intact record. A torn trailing record (crash during
    /// append) ends the scan.
    fn read_records(path: &Path) -> Result<Vec<JournalRecord>> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(HarvestError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(HarvestError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut records = Vec::new();
        while let Some(record) = Self::read_record(&mut reader) {
            records.push(record);
        }
        Ok(records)
    }

    fn read_record(reader: &mut impl Read) -> Option<JournalRecord> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).ok()?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_LEN {
            return None;
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded).ok()?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes).ok()?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&encoded) {
            return None;
        }

        rmp_serde::from_slice(&encoded).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn generate(stream: u64) -> JournalOperation {
        JournalOperation::GenerateDump {
            stream: StreamId(stream),
            kind: DumpKind::Delta,
            as_of: Timestamp(100),
        }
    }

    #[test]
    fn test_begin_and_commit() {
        let dir = TempDir::new().unwrap();
        let journal = DumpJournal::open(dir.path().join("journal")).unwrap();

        let first = journal.begin(generate(1)).unwrap();
        let second = journal.begin(generate(2)).unwrap();
        assert_eq!((first, second), (1, 2));

        journal.commit(first).unwrap();

        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
        assert_eq!(pending[0].operation, generate(2));
    }

    #[test]
    fn test_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let journal = DumpJournal::open(&path).unwrap();
            journal.begin(generate(1)).unwrap();
        }

        let journal = DumpJournal::open(&path).unwrap();
        assert!(journal.has_pending().unwrap());
        assert_eq!(journal.begin(generate(1)).unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let journal = DumpJournal::open(&path).unwrap();
            let seq = journal.begin(generate(1)).unwrap();
            journal.commit(seq).unwrap();
            journal.begin(generate(2)).unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 2]).unwrap();

        let journal = DumpJournal::open(&path).unwrap();
        assert!(!journal.has_pending().unwrap());
    }

    #[test]
    fn test_commit_compacts_when_nothing_is_open() {
        let dir = TempDir::new().unwrap();
        let journal = DumpJournal::open(dir.path().join("journal")).unwrap();
        let header = journal.size_bytes().unwrap();

        for stream in 0..50 {
            let seq = journal.begin(generate(stream)).unwrap();
            journal.commit(seq).unwrap();
        }
        assert_eq!(journal.size_bytes().unwrap(), header);

        // An overlapping run keeps the file until it commits too.
        let first = journal.begin(generate(1)).unwrap();
        let second = journal.begin(generate(2)).unwrap();
        journal.commit(first).unwrap();
        assert!(journal.size_bytes().unwrap() > header);
        assert_eq!(journal.pending().unwrap()[0].seq, second);

        journal.commit(second).unwrap();
        assert_eq!(journal.size_bytes().unwrap(), header);
        assert!(!journal.has_pending().unwrap());
        assert_eq!(journal.begin(generate(3)).unwrap(), 53);
    }

    #[test]
    fn test_reopened_pending_blocks_compaction() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");

        {
            let journal = DumpJournal::open(&path).unwrap();
            journal.begin(generate(1)).unwrap();
        }

        let journal = DumpJournal::open(&path).unwrap();
        let seq = journal.begin(generate(2)).unwrap();
        journal.commit(seq).unwrap();

        let pending = journal.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 1);
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let journal = DumpJournal::open(dir.path().join("journal")).unwrap();

        journal.begin(generate(1)).unwrap();
        journal.clear().unwrap();

        assert!(!journal.has_pending().unwrap());
        assert_eq!(journal.begin(generate(1)).unwrap(), 1);
    }
}
