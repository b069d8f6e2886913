//! BUFR descriptor entities and table lookup.
//!
//! Descriptors are the six-digit `FXXYYY` ids that make up a BUFR template.
//! Table B defines element descriptors (width, scale, reference value,
//! units), Table D defines sequence expansions, and the code/flag tables map
//! code values to their meanings. A [`TableGroup`] is an immutable snapshot
//! of those tables for one version key; groups are cheap to share across
//! threads behind `Arc` and are produced by a bounded [`Tables`] cache.

mod descriptors;
mod group;

pub use descriptors::{
    fxy, BufrTemplate, Descriptor, ElementDescriptor, ElementKind, OperatorDescriptor,
    SequenceDescriptor, UNITS_CODE_TABLE, UNITS_FLAG_TABLE, UNITS_STRING,
};
pub use group::{TableGroup, TableGroupKey, Tables, DEFAULT_MASTER_VERSION};

use thiserror::Error;

/// Error type for table loading and descriptor lookup.
#[derive(Debug, Error)]
pub enum TablesError {
    #[error("unknown descriptor {0:06}")]
    UnknownDescriptor(u32),
    #[error("cyclic sequence definition through {0:06}")]
    CyclicSequence(u32),
    #[error("replication {0:06} is missing members in the descriptor list")]
    TruncatedReplication(u32),
    #[error("delayed replication {0:06} must be followed by a class 31 factor, found {1:06}")]
    BadReplicationFactor(u32, u32),
    #[error("malformed table entry for {0}: {1}")]
    MalformedEntry(String, String),
    #[error("table file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("table file {0}: {1}")]
    Json(String, #[source] serde_json::Error),
}
