//! Normalized dumps: full snapshots and deltas of a stream's records.
//!
//! A stream's current chain is one full dump followed by deltas whose windows
//! tile time without gaps or overlaps. Each dump stores gzip pages plus a
//! manifest of what it published; replaying the manifests gives the set a
//! harvester following the chain knows about.

mod chain;
pub mod delta;
mod pager;

pub use chain::{
    DumpCatalog, DumpChain, DumpKind, DumpManifest, NormalizedDump, PageKind, PageRef,
    PublishedSet, MANIFEST_CONTENT_TYPE,
};
pub use delta::{DeltaPlan, Window};
pub use pager::{
    gunzip, gzip, normalize_record, OaiIdentity, Page, PaginatedDump, RecordDiagnostic, XmlPager,
    DEFAULT_MAX_RECORDS_PER_PAGE, MARC_NAMESPACE, PAGE_CONTENT_TYPE,
};
