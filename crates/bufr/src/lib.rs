//! BUFR (FM-94) toolkit facade.
//!
//! Re-exports the codec, tables and query crates and adds renderers: a
//! hierarchical text dump for humans and a JSON form that [`json::message_from_json`]
//! turns back into encoder input, so `decode -> JSON -> encode` round-trips.

pub mod json;
pub mod render;

pub use bufr_core::{
    BufrError, BufrMessage, DecodeOptions, Decoder, Encoder, Value,
};
pub use bufr_query::{DataQuerent, NodePathParser, PathError, QueryResult, QueryValues};
pub use bufr_tables::{TableGroupKey, Tables, TablesError};
