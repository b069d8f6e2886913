//! Error type shared by the decode and encode paths.

use bufr_bits::BitsError;
use bufr_tables::TablesError;
use thiserror::Error;

/// Error type for BUFR decoding and encoding.
///
/// The engine surfaces the first failure; walk errors are wrapped with the
/// stream bit offset and the descriptor trail leading to the failing
/// descriptor.
#[derive(Debug, Error)]
pub enum BufrError {
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("validation failed: expected {expected}, found {found}")]
    ValidationFailed { expected: String, found: String },
    #[error("unbalanced operator: {0}")]
    UnbalancedOperator(String),
    #[error("bitmap mismatch: {0}")]
    BitmapMismatch(String),
    #[error(transparent)]
    InsufficientBits(#[from] BitsError),
    #[error("{nbits} unread non-pad bits at end of section")]
    ExcessBits { nbits: usize },
    #[error("cannot encode {found} for descriptor {descriptor:06}: expected {expected}")]
    EncodeTypeMismatch {
        descriptor: u32,
        expected: &'static str,
        found: String,
    },
    #[error("inconsistent compressed data: {0}")]
    Compression(String),
    #[error("bad replication factor: {0}")]
    Replication(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Tables(#[from] TablesError),
    #[error("{source} (bit {bit_pos}, descriptor trail [{trail}])")]
    Walk {
        bit_pos: usize,
        trail: String,
        #[source]
        source: Box<BufrError>,
    },
}

impl BufrError {
    /// Wraps an error with the walk context, unless it is already wrapped.
    pub(crate) fn with_context(self, bit_pos: usize, trail: &[u32]) -> BufrError {
        match self {
            BufrError::Walk { .. } => self,
            other => BufrError::Walk {
                bit_pos,
                trail: trail
                    .iter()
                    .map(|id| format!("{id:06}"))
                    .collect::<Vec<_>>()
                    .join(" > "),
                source: Box::new(other),
            },
        }
    }
}
