//! The repository: streams, uploads and dump chains behind one directory.

use crate::attachments::AttachmentStore;
use crate::dumps::{
    delta, gunzip, DeltaPlan, DumpCatalog, DumpChain, DumpKind, DumpManifest, NormalizedDump,
    OaiIdentity, Page, PageRef, PaginatedDump, PublishedSet, RecordDiagnostic, Window, XmlPager,
    DEFAULT_MAX_RECORDS_PER_PAGE, MANIFEST_CONTENT_TYPE, PAGE_CONTENT_TYPE,
};
use crate::error::{HarvestError, Result};
use crate::journal::{DumpJournal, JournalOperation};
use crate::records::{LiveSet, RecordStore};
use crate::streams::StreamRegistry;
use crate::types::{
    DefaultStreamHistory, DumpId, Stream, StreamId, StreamStatus, Timestamp, Upload, UploadInput,
};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Repository configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Base directory.
    pub path: PathBuf,

    /// Attachment cache size (number of pages).
    pub attachment_cache_size: usize,

    /// Whether to create the repository if it doesn't exist.
    pub create_if_missing: bool,

    /// Exclusive upper bound on entries per MARC-XML or OAI-XML page.
    pub max_records_per_page: usize,

    /// Repository identifier used in OAI record identifiers, which are
    /// baked into stored pages.
    pub repository_identifier: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./pod-data"),
            attachment_cache_size: 256,
            create_if_missing: true,
            max_records_per_page: DEFAULT_MAX_RECORDS_PER_PAGE,
            repository_identifier: "pod.example.org".to_string(),
        }
    }
}

/// Outcome of a dump generation request.
#[derive(Clone, Debug)]
pub struct DumpReport {
    /// The new dump, or the existing head if nothing was due.
    pub dump: Arc<NormalizedDump>,

    /// Whether this call committed `dump`.
    pub created: bool,

    /// Records left out of the dump.
    pub diagnostics: Vec<RecordDiagnostic>,
}

/// Repository statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoryStats {
    pub stream_count: usize,
    pub upload_count: usize,
    pub dump_count: usize,
    pub attachment_count: usize,
    pub upload_log_bytes: u64,
}

/// Magic bytes for the repository manifest.
const REPOSITORY_MAGIC: &[u8; 4] = b"POD\0";

/// Current repository format version.
const REPOSITORY_VERSION: u8 = 1;

const CATALOG_FILE: &str = "dumps.bin";

/// Versioned dumps of MARC record streams.
///
/// Uploads and dump generation for one stream are serialized by a per-stream
/// writer lock; different streams proceed in parallel. Readers only ever see
/// committed dumps.
pub struct Repository {
    config: RepositoryConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    records: RecordStore,
    streams: StreamRegistry,
    attachments: AttachmentStore,
    journal: DumpJournal,
    pager: XmlPager,

    /// Committed dump chains.
    catalog: RwLock<DumpCatalog>,

    /// One writer lock per stream.
    writers: Mutex<HashMap<StreamId, Arc<Mutex<()>>>>,

    /// Serializes catalog rewrites across streams.
    commit_lock: Mutex<()>,
}

impl Repository {
    /// Open an existing repository or create a new one.
    pub fn open_or_create(config: RepositoryConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(HarvestError::NotInitialized)
        }
    }

    /// Create a new repository.
    pub fn create(config: RepositoryConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        Self::open(config)
    }

    /// Open an existing repository, recovering from an interrupted commit.
    pub fn open(config: RepositoryConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let pager = XmlPager::new(config.max_records_per_page)?;
        let records = RecordStore::open(config.path.join("uploads.log"))?;
        let streams = StreamRegistry::open(config.path.join("streams.bin"))?;
        let attachments = AttachmentStore::new(
            config.path.join("attachments"),
            config.attachment_cache_size,
        )?;
        let catalog = DumpCatalog::load(&config.path.join(CATALOG_FILE))?;
        let journal = DumpJournal::open(config.path.join("journal"))?;

        let pending = journal.pending()?;
        if !pending.is_empty() {
            let removed = attachments.sweep(&catalog.referenced_attachments())?;
            warn!(
                interrupted = pending.len(),
                removed, "recovered from interrupted dump commit"
            );
        }
        journal.clear()?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            records,
            streams,
            attachments,
            journal,
            pager,
            catalog: RwLock::new(catalog),
            writers: Mutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        })
    }

    // --- Streams ---

    /// Create a stream; the first stream of an organization becomes default.
    pub fn create_stream(&self, organization: &str, name: &str) -> Result<Stream> {
        self.create_stream_at(organization, name, Timestamp::now())
    }

    pub fn create_stream_at(&self, organization: &str, name: &str, at: Timestamp) -> Result<Stream> {
        let stream = self.streams.create_stream(organization, name, at)?;
        info!(stream = %stream.id, organization, default = stream.default, "created stream");
        Ok(stream)
    }

    /// Make a stream its organization's default.
    pub fn make_default(&self, stream: StreamId) -> Result<Stream> {
        self.make_default_at(stream, Timestamp::now())
    }

    pub fn make_default_at(&self, stream: StreamId, at: Timestamp) -> Result<Stream> {
        self.streams.make_default(stream, at)
    }

    pub fn archive_stream(&self, stream: StreamId) -> Result<Stream> {
        self.streams.archive(stream)
    }

    pub fn stream(&self, id: StreamId) -> Result<Stream> {
        self.streams.get(id)
    }

    pub fn streams(&self) -> Vec<Stream> {
        self.streams.list()
    }

    /// Streams that scheduled dump runs should cover.
    pub fn active_streams(&self) -> Vec<Stream> {
        self.streams
            .list()
            .into_iter()
            .filter(|s| s.status == StreamStatus::Active)
            .collect()
    }

    pub fn default_stream(&self, organization: &str) -> Option<Stream> {
        self.streams.default_for(organization)
    }

    pub fn default_history(&self, stream: StreamId) -> Vec<DefaultStreamHistory> {
        self.streams.history(stream)
    }

    // --- Ingestion ---

    /// Store an upload for a stream, timestamped now.
    ///
    /// The clock is read under the stream's writer lock, and never earlier
    /// than the dump boundary, so a concurrent dump run cannot close the
    /// window under the upload.
    pub fn ingest(&self, stream: StreamId, input: UploadInput) -> Result<Arc<Upload>> {
        self.ingest_locked(stream, input, None)
    }

    /// Store an upload with an explicit timestamp.
    ///
    /// Uploads dated before the stream's dump boundary are refused: that
    /// window is closed and already published.
    pub fn ingest_at(&self, stream: StreamId, input: UploadInput, at: Timestamp) -> Result<Arc<Upload>> {
        self.ingest_locked(stream, input, Some(at))
    }

    fn ingest_locked(
        &self,
        stream: StreamId,
        input: UploadInput,
        at: Option<Timestamp>,
    ) -> Result<Arc<Upload>> {
        self.streams.get(stream)?;

        let writer = self.writer(stream);
        let _guard = writer.lock();

        let boundary = self.boundary(stream);
        let at = match (at, boundary) {
            (Some(at), Some(boundary)) if at < boundary => {
                return Err(HarvestError::InvalidOperation(format!(
                    "upload at {at} precedes stream {stream} dump boundary {boundary}"
                )));
            }
            (Some(at), _) => at,
            (None, boundary) => Timestamp::now().max(boundary.unwrap_or(Timestamp::EPOCH)),
        };

        self.records.ingest(stream, input, at)
    }

    /// Uploads of a stream in timeline order.
    pub fn uploads(&self, stream: StreamId) -> Vec<Arc<Upload>> {
        self.records.uploads(stream)
    }

    /// Time of the stream's newest upload.
    pub fn latest_upload_at(&self, stream: StreamId) -> Option<Timestamp> {
        self.records.latest_upload_at(stream)
    }

    /// Live records of a stream just before `at`.
    pub fn live_records_at(&self, stream: StreamId, at: Timestamp) -> LiveSet {
        self.records.live_at(stream, at, Timestamp::EPOCH)
    }

    // --- Dump generation ---

    /// Start a new chain with a full dump of everything live now.
    pub fn generate_full_dump(&self, stream: StreamId) -> Result<DumpReport> {
        self.generate_full_dump_locked(stream, None)
    }

    /// Start a new chain with a full dump of everything live before `as_of`.
    pub fn generate_full_dump_at(&self, stream: StreamId, as_of: Timestamp) -> Result<DumpReport> {
        self.generate_full_dump_locked(stream, Some(as_of))
    }

    fn generate_full_dump_locked(
        &self,
        stream: StreamId,
        as_of: Option<Timestamp>,
    ) -> Result<DumpReport> {
        let stream = self.streams.get(stream)?;

        let writer = self.writer(stream.id);
        let _guard = writer.lock();

        let boundary = self.boundary(stream.id);
        let as_of = match (as_of, boundary) {
            (Some(as_of), Some(boundary)) if as_of < boundary => {
                return Err(HarvestError::InvalidOperation(format!(
                    "full dump at {as_of} precedes stream {} dump boundary {boundary}",
                    stream.id
                )));
            }
            (Some(as_of), _) => as_of,
            (None, boundary) => Timestamp::now().max(boundary.unwrap_or(Timestamp::EPOCH)),
        };

        let live = self.records.live_at(stream.id, as_of, Timestamp::EPOCH);
        let plan = delta::plan_full(&live);
        let paginated = self.pager.paginate(&plan, &self.identity(&stream), as_of)?;
        let diagnostics = paginated.diagnostics.clone();

        let dump = self.commit(
            &stream,
            DumpKind::Full,
            None,
            Window::new(Timestamp::EPOCH, as_of),
            paginated,
        )?;

        Ok(DumpReport {
            dump,
            created: true,
            diagnostics,
        })
    }

    /// Append a delta covering everything since the chain boundary.
    ///
    /// `as_of` is read once the stream's writer lock is held.
    pub fn compute_delta(&self, stream: StreamId) -> Result<DumpReport> {
        self.compute_delta_locked(stream, None)
    }

    /// Append a delta covering `[boundary, as_of)`.
    ///
    /// A stream without any full dump first gets an empty full dump anchored
    /// at the epoch. If `as_of` does not advance past the boundary, the
    /// existing head is returned and nothing is written, so retried runs are
    /// harmless.
    pub fn compute_delta_at(&self, stream: StreamId, as_of: Timestamp) -> Result<DumpReport> {
        self.compute_delta_locked(stream, Some(as_of))
    }

    fn compute_delta_locked(&self, stream: StreamId, as_of: Option<Timestamp>) -> Result<DumpReport> {
        let stream = self.streams.get(stream)?;

        let writer = self.writer(stream.id);
        let _guard = writer.lock();
        let as_of = as_of.unwrap_or_else(Timestamp::now);

        let chain = match self.current_chain(stream.id) {
            Some(chain) => chain,
            None => {
                self.commit(
                    &stream,
                    DumpKind::Full,
                    None,
                    Window::new(Timestamp::EPOCH, Timestamp::EPOCH),
                    PaginatedDump::default(),
                )?;
                self.current_chain(stream.id)
                    .ok_or(HarvestError::StreamNotFound(stream.id))?
            }
        };

        let head = Arc::clone(chain.head());
        let boundary = chain.boundary();
        if as_of <= boundary {
            return Ok(DumpReport {
                dump: head,
                created: false,
                diagnostics: Vec::new(),
            });
        }

        let published = PublishedSet::replay(&chain, &self.attachments)?;
        let live = self.records.live_at(stream.id, as_of, boundary);
        let plan: DeltaPlan = delta::plan(&published, &live, Window::new(boundary, as_of));
        let paginated = self.pager.paginate(&plan, &self.identity(&stream), as_of)?;
        let diagnostics = paginated.diagnostics.clone();

        let dump = self.commit(
            &stream,
            DumpKind::Delta,
            Some(head.id),
            Window::new(boundary, as_of),
            paginated,
        )?;

        Ok(DumpReport {
            dump,
            created: true,
            diagnostics,
        })
    }

    /// Store pages and manifest, then publish the dump in the catalog.
    fn commit(
        &self,
        stream: &Stream,
        kind: DumpKind,
        parent: Option<DumpId>,
        window: Window,
        paginated: PaginatedDump,
    ) -> Result<Arc<NormalizedDump>> {
        let seq = self.journal.begin(JournalOperation::GenerateDump {
            stream: stream.id,
            kind,
            as_of: window.end,
        })?;

        let marcxml_pages = self.store_pages(&paginated.marcxml_pages)?;
        let oai_pages = self.store_pages(&paginated.oai_pages)?;
        let deletes_page = match &paginated.deletes_page {
            Some(page) => Some(self.store_page(page)?),
            None => None,
        };
        let manifest = self
            .attachments
            .put(&paginated.manifest.encode()?, MANIFEST_CONTENT_TYPE)?;

        let dump = {
            let _commit = self.commit_lock.lock();
            let mut next = self.catalog.read().clone();

            let dump = Arc::new(NormalizedDump {
                id: next.allocate_id(),
                stream: stream.id,
                kind,
                parent,
                window_start: window.start,
                created_at: window.end,
                manifest,
                marcxml_pages,
                deletes_page,
                oai_pages,
            });

            match kind {
                DumpKind::Full => next.start_chain(Arc::clone(&dump))?,
                DumpKind::Delta => next.append_delta(Arc::clone(&dump))?,
            }

            next.save(&self.config.path.join(CATALOG_FILE))?;
            *self.catalog.write() = next;
            dump
        };

        self.journal.commit(seq)?;

        info!(
            stream = %stream.id,
            dump = %dump.id,
            kind = ?dump.kind,
            window_start = %dump.window_start,
            window_end = %dump.created_at,
            additions = dump.addition_count(),
            deletions = dump.deletion_count(),
            oai_pages = dump.oai_pages.len(),
            "committed dump"
        );

        Ok(dump)
    }

    fn store_pages(&self, pages: &[Page]) -> Result<Vec<PageRef>> {
        pages.iter().map(|page| self.store_page(page)).collect()
    }

    fn store_page(&self, page: &Page) -> Result<PageRef> {
        Ok(PageRef {
            kind: page.kind,
            attachment: self.attachments.put(&page.content, PAGE_CONTENT_TYPE)?,
            records: page.records,
        })
    }

    // --- Reading dumps ---

    /// The stream's current chain, if it has ever been dumped.
    pub fn current_chain(&self, stream: StreamId) -> Option<DumpChain> {
        self.catalog.read().current_chain(stream).cloned()
    }

    /// The current full dump of a stream.
    pub fn current_full_dump(&self, stream: StreamId) -> Option<Arc<NormalizedDump>> {
        self.catalog
            .read()
            .current_chain(stream)
            .map(|chain| Arc::clone(&chain.full))
    }

    /// The current full dump followed by its deltas.
    pub fn current_dumps(&self, stream: StreamId) -> Vec<Arc<NormalizedDump>> {
        self.catalog
            .read()
            .current_chain(stream)
            .map(|chain| chain.dumps().cloned().collect())
            .unwrap_or_default()
    }

    /// Where the next delta of a stream would start.
    pub fn boundary(&self, stream: StreamId) -> Option<Timestamp> {
        self.catalog
            .read()
            .current_chain(stream)
            .map(DumpChain::boundary)
    }

    pub fn dump(&self, id: DumpId) -> Result<Arc<NormalizedDump>> {
        self.catalog
            .read()
            .dump(id)
            .cloned()
            .ok_or(HarvestError::DumpNotFound(id))
    }

    /// Decompressed content of a stored page.
    pub fn read_page(&self, page: &PageRef) -> Result<Vec<u8>> {
        let attachment = self.attachments.read(&page.attachment)?;
        gunzip(&attachment.content)
    }

    /// Compressed content of a stored page, as served for download.
    pub fn read_page_compressed(&self, page: &PageRef) -> Result<Arc<Vec<u8>>> {
        Ok(self.attachments.read(&page.attachment)?.content)
    }

    pub fn read_manifest(&self, dump: &NormalizedDump) -> Result<DumpManifest> {
        DumpManifest::decode(&self.attachments.read(&dump.manifest)?.content)
    }

    /// What harvesters of the stream's current chain have been told.
    pub fn published_set(&self, stream: StreamId) -> Result<PublishedSet> {
        match self.current_chain(stream) {
            Some(chain) => PublishedSet::replay(&chain, &self.attachments),
            None => Ok(PublishedSet::new()),
        }
    }

    // --- Harvesting views ---

    /// Streams offered to harvesters: ever a default, and with at least one
    /// dump that has OAI pages.
    pub fn harvestable_streams(&self) -> Vec<Stream> {
        let catalog = self.catalog.read();
        self.streams
            .list()
            .into_iter()
            .filter(|s| self.streams.has_default_history(s.id))
            .filter(|s| Self::oai_dumps(&catalog, s.id).next().is_some())
            .collect()
    }

    /// Creation time of the earliest dump with OAI pages among harvestable
    /// streams.
    pub fn earliest_datestamp(&self) -> Option<Timestamp> {
        let catalog = self.catalog.read();
        self.streams
            .list()
            .into_iter()
            .filter(|s| self.streams.has_default_history(s.id))
            .flat_map(|s| Self::oai_dumps(&catalog, s.id).map(|d| d.created_at).collect::<Vec<_>>())
            .min()
    }

    fn oai_dumps(catalog: &DumpCatalog, stream: StreamId) -> impl Iterator<Item = &Arc<NormalizedDump>> {
        catalog
            .chains_for(stream)
            .iter()
            .flat_map(|chain| chain.dumps())
            .filter(|dump| !dump.oai_pages.is_empty())
    }

    // --- Maintenance ---

    pub fn stats(&self) -> Result<RepositoryStats> {
        let catalog = self.catalog.read();
        Ok(RepositoryStats {
            stream_count: self.streams.list().len(),
            upload_count: self.records.upload_count(),
            dump_count: catalog
                .streams()
                .map(|s| catalog.chains_for(s).iter().map(|c| c.dumps().count()).sum::<usize>())
                .sum(),
            attachment_count: self.attachments.list()?.len(),
            upload_log_bytes: self.records.size_bytes()?,
        })
    }

    /// Write the catalog again. Every commit already persists it; this is a
    /// checkpoint for callers that want one.
    pub fn sync(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        self.catalog
            .read()
            .save(&self.config.path.join(CATALOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    // --- Private Helpers ---

    fn writer(&self, stream: StreamId) -> Arc<Mutex<()>> {
        Arc::clone(self.writers.lock().entry(stream).or_default())
    }

    fn identity(&self, stream: &Stream) -> OaiIdentity {
        OaiIdentity {
            namespace: self.config.repository_identifier.clone(),
            organization: stream.organization.clone(),
            stream: stream.id,
        }
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(REPOSITORY_MAGIC)?;
        file.write_all(&[REPOSITORY_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        if !manifest_path.exists() {
            return Err(HarvestError::NotInitialized);
        }
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REPOSITORY_MAGIC {
            return Err(HarvestError::InvalidFormat("Invalid repository magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REPOSITORY_VERSION {
            return Err(HarvestError::InvalidFormat(format!(
                "Unsupported repository version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| HarvestError::Locked)?;
        Ok(lock_file)
    }
}
