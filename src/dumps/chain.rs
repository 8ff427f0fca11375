//! Dump chains and the catalog that persists them.

use crate::attachments::AttachmentStore;
use crate::error::{HarvestError, Result};
use crate::snapshot;
use crate::types::{DumpId, Hash, RecordKey, StreamId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Magic bytes for the catalog file.
const CATALOG_MAGIC: &[u8; 4] = b"DMP\0";

/// Current catalog format version.
const CATALOG_VERSION: u8 = 1;

/// Media type of stored manifests.
pub const MANIFEST_CONTENT_TYPE: &str = "application/msgpack";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpKind {
    Full,
    Delta,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    /// Gzip MARC-XML `<collection>` of added records.
    MarcXml,
    /// Gzip OAI-PMH `<record>` fragments, additions and deletions.
    OaiXml,
    /// Gzip newline-terminated list of deleted keys.
    Deletes,
}

/// A stored page of a dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub kind: PageKind,
    pub attachment: Hash,
    /// Number of entries on the page.
    pub records: usize,
}

/// One snapshot of a stream: a full dump or a delta over a window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedDump {
    pub id: DumpId,
    pub stream: StreamId,
    pub kind: DumpKind,

    /// Previous dump in the chain; `None` for full dumps.
    pub parent: Option<DumpId>,

    /// Inclusive start of the covered window.
    pub window_start: Timestamp,

    /// Exclusive end of the covered window, and the chain boundary after
    /// this dump.
    pub created_at: Timestamp,

    /// Attachment holding the [`DumpManifest`].
    pub manifest: Hash,

    pub marcxml_pages: Vec<PageRef>,
    pub deletes_page: Option<PageRef>,
    pub oai_pages: Vec<PageRef>,
}

impl NormalizedDump {
    /// Boundary the next delta starts from.
    pub fn last_delta_dump_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn is_full(&self) -> bool {
        self.kind == DumpKind::Full
    }

    /// Records listed as additions.
    pub fn addition_count(&self) -> usize {
        self.marcxml_pages.iter().map(|p| p.records).sum()
    }

    /// Keys listed as deletions.
    pub fn deletion_count(&self) -> usize {
        self.deletes_page.as_ref().map_or(0, |p| p.records)
    }

    /// Every attachment the dump references.
    pub fn attachments(&self) -> impl Iterator<Item = Hash> + '_ {
        std::iter::once(self.manifest)
            .chain(self.marcxml_pages.iter().map(|p| p.attachment))
            .chain(self.deletes_page.iter().map(|p| p.attachment))
            .chain(self.oai_pages.iter().map(|p| p.attachment))
    }
}

/// What one dump published: added `(key, checksum)` pairs and deleted keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpManifest {
    pub additions: Vec<(RecordKey, Hash)>,
    pub deletions: Vec<RecordKey>,
}

impl DumpManifest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Records harvesters have been told about, by key.
#[derive(Clone, Debug, Default)]
pub struct PublishedSet {
    entries: HashMap<RecordKey, Hash>,
}

impl PublishedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one manifest into the set.
    pub fn apply(&mut self, manifest: &DumpManifest) {
        for (key, checksum) in &manifest.additions {
            self.entries.insert(key.clone(), *checksum);
        }
        for key in &manifest.deletions {
            self.entries.remove(key);
        }
    }

    /// Replay every manifest of a chain, oldest first.
    pub fn replay(chain: &DumpChain, attachments: &AttachmentStore) -> Result<Self> {
        let mut published = Self::new();
        for dump in chain.dumps() {
            let attachment = attachments.read(&dump.manifest)?;
            published.apply(&DumpManifest::decode(&attachment.content)?);
        }
        Ok(published)
    }

    pub fn checksum(&self, key: &RecordKey) -> Option<&Hash> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A full dump followed by its deltas in window order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpChain {
    pub full: Arc<NormalizedDump>,
    pub deltas: Vec<Arc<NormalizedDump>>,
}

impl DumpChain {
    pub fn new(full: Arc<NormalizedDump>) -> Self {
        Self {
            full,
            deltas: Vec::new(),
        }
    }

    /// Most recent dump of the chain.
    pub fn head(&self) -> &Arc<NormalizedDump> {
        self.deltas.last().unwrap_or(&self.full)
    }

    /// Where the next delta's window begins.
    pub fn boundary(&self) -> Timestamp {
        self.head().last_delta_dump_at()
    }

    /// Full dump first, then deltas.
    pub fn dumps(&self) -> impl Iterator<Item = &Arc<NormalizedDump>> {
        std::iter::once(&self.full).chain(self.deltas.iter())
    }
}

/// All dump chains, persisted as one snapshot file.
///
/// The last chain of each stream is its current one. Superseded chains stay
/// in the catalog so their attachments remain referenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpCatalog {
    chains: BTreeMap<StreamId, Vec<DumpChain>>,
    next_id: u64,
}

impl Default for DumpCatalog {
    fn default() -> Self {
        Self {
            chains: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl DumpCatalog {
    /// Load the catalog, or an empty one if none was saved yet.
    pub fn load(path: &Path) -> Result<Self> {
        Ok(snapshot::load(path, CATALOG_MAGIC, CATALOG_VERSION)?.unwrap_or_default())
    }

    /// Atomically replace the catalog on disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        snapshot::save(path, CATALOG_MAGIC, CATALOG_VERSION, self)
    }

    /// Reserve the next dump ID.
    pub fn allocate_id(&mut self) -> DumpId {
        let id = DumpId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn current_chain(&self, stream: StreamId) -> Option<&DumpChain> {
        self.chains.get(&stream).and_then(|chains| chains.last())
    }

    /// Start a new chain for the dump's stream.
    pub fn start_chain(&mut self, full: Arc<NormalizedDump>) -> Result<()> {
        if !full.is_full() || full.parent.is_some() {
            return Err(HarvestError::InvalidOperation(format!(
                "dump {} cannot start a chain",
                full.id
            )));
        }
        self.chains
            .entry(full.stream)
            .or_default()
            .push(DumpChain::new(full));
        Ok(())
    }

    /// Append a delta to its stream's current chain.
    ///
    /// The delta must start exactly at the chain boundary and end after it.
    pub fn append_delta(&mut self, delta: Arc<NormalizedDump>) -> Result<()> {
        let chain = self
            .chains
            .get_mut(&delta.stream)
            .and_then(|chains| chains.last_mut())
            .ok_or_else(|| {
                HarvestError::InvalidOperation(format!(
                    "stream {} has no full dump to extend",
                    delta.stream
                ))
            })?;

        let head = chain.head();
        if delta.kind != DumpKind::Delta
            || delta.parent != Some(head.id)
            || delta.window_start != head.last_delta_dump_at()
            || delta.created_at <= delta.window_start
        {
            return Err(HarvestError::InvalidOperation(format!(
                "delta {} does not continue chain at {}",
                delta.id,
                head.last_delta_dump_at()
            )));
        }

        chain.deltas.push(delta);
        Ok(())
    }

    /// Every chain of a stream, oldest first.
    pub fn chains_for(&self, stream: StreamId) -> &[DumpChain] {
        self.chains.get(&stream).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Streams that have at least one chain.
    pub fn streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.chains.keys().copied()
    }

    /// Look up any dump, current or superseded.
    pub fn dump(&self, id: DumpId) -> Option<&Arc<NormalizedDump>> {
        self.chains
            .values()
            .flatten()
            .flat_map(|chain| chain.dumps())
            .find(|dump| dump.id == id)
    }

    /// Attachments referenced by any dump in the catalog.
    pub fn referenced_attachments(&self) -> HashSet<Hash> {
        self.chains
            .values()
            .flatten()
            .flat_map(|chain| chain.dumps())
            .flat_map(|dump| dump.attachments())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dump(id: u64, kind: DumpKind, parent: Option<u64>, start: i64, end: i64) -> Arc<NormalizedDump> {
        Arc::new(NormalizedDump {
            id: DumpId(id),
            stream: StreamId(1),
            kind,
            parent: parent.map(DumpId),
            window_start: Timestamp(start),
            created_at: Timestamp(end),
            manifest: Hash::from_bytes(format!("manifest {id}").as_bytes()),
            marcxml_pages: Vec::new(),
            deletes_page: None,
            oai_pages: Vec::new(),
        })
    }

    #[test]
    fn test_chain_boundaries() {
        let mut catalog = DumpCatalog::default();
        catalog.start_chain(dump(1, DumpKind::Full, None, 0, 100)).unwrap();
        assert_eq!(catalog.current_chain(StreamId(1)).unwrap().boundary(), Timestamp(100));

        catalog
            .append_delta(dump(2, DumpKind::Delta, Some(1), 100, 200))
            .unwrap();
        let chain = catalog.current_chain(StreamId(1)).unwrap();
        assert_eq!(chain.boundary(), Timestamp(200));
        assert_eq!(chain.dumps().count(), 2);
    }

    #[test]
    fn test_rejects_gaps_and_overlaps() {
        let mut catalog = DumpCatalog::default();
        catalog.start_chain(dump(1, DumpKind::Full, None, 0, 100)).unwrap();

        for bad in [
            dump(2, DumpKind::Delta, Some(1), 90, 200),
            dump(2, DumpKind::Delta, Some(1), 110, 200),
            dump(2, DumpKind::Delta, Some(7), 100, 200),
            dump(2, DumpKind::Delta, Some(1), 100, 100),
            dump(2, DumpKind::Full, Some(1), 100, 200),
        ] {
            assert!(matches!(
                catalog.append_delta(bad),
                Err(HarvestError::InvalidOperation(_))
            ));
        }

        assert!(catalog
            .append_delta(dump(3, DumpKind::Delta, Some(1), 0, 100))
            .is_err());
    }

    #[test]
    fn test_new_chain_supersedes_but_keeps_attachments() {
        let mut catalog = DumpCatalog::default();
        catalog.start_chain(dump(1, DumpKind::Full, None, 0, 100)).unwrap();
        catalog.start_chain(dump(2, DumpKind::Full, None, 0, 300)).unwrap();

        assert_eq!(catalog.current_chain(StreamId(1)).unwrap().full.id, DumpId(2));
        assert!(catalog.dump(DumpId(1)).is_some());
        assert_eq!(catalog.referenced_attachments().len(), 2);
    }

    #[test]
    fn test_catalog_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dumps.bin");

        let mut catalog = DumpCatalog::default();
        let id = catalog.allocate_id();
        catalog.start_chain(dump(id.0, DumpKind::Full, None, 0, 100)).unwrap();
        catalog.save(&path).unwrap();

        let mut loaded = DumpCatalog::load(&path).unwrap();
        assert_eq!(loaded.current_chain(StreamId(1)).unwrap().full.id, id);
        assert_eq!(loaded.allocate_id(), DumpId(2));
    }

    #[test]
    fn test_published_set_replay_order() {
        let a = Hash::from_bytes(b"a");
        let b = Hash::from_bytes(b"b");

        let mut published = PublishedSet::new();
        published.apply(&DumpManifest {
            additions: vec![(RecordKey::new("x"), a), (RecordKey::new("y"), a)],
            deletions: vec![],
        });
        published.apply(&DumpManifest {
            additions: vec![(RecordKey::new("x"), b)],
            deletions: vec![RecordKey::new("y")],
        });

        assert_eq!(published.len(), 1);
        assert_eq!(published.checksum(&RecordKey::new("x")), Some(&b));
        assert!(!published.contains(&RecordKey::new("y")));
    }
}
