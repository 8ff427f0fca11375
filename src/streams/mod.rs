//! Streams: named partitions of an organization's records.
//!
//! Each organization has at most one default stream; every change of default
//! designation is kept as a history entry. Only streams that have been a
//! default are offered to harvesters.

mod registry;

pub use registry::StreamRegistry;
