//! Bidirectional codec for WMO BUFR (FM-94) messages.
//!
//! Decoding walks the section 3 template against the section 4 bit stream
//! and yields a [`BufrMessage`] whose data is available both as flat
//! per-subset lists and as a wired hierarchical tree. Encoding consumes the
//! flat lists in template order and reproduces the wire form byte for byte,
//! modulo canonical section padding.
//!
//! ```
//! use bufr_core::{Decoder, Encoder};
//! # fn roundtrip(input: &[u8]) -> Result<(), bufr_core::BufrError> {
//! let mut decoder = Decoder::new();
//! let message = decoder.decode(input)?;
//! let bytes = Encoder::new().encode(&message)?;
//! # Ok(())
//! # }
//! ```

mod coder;
mod compiler;
mod decoder;
mod encoder;
mod engine;
mod error;
mod message;
mod sections;
mod templatedata;
mod values;

pub use coder::{BsrModifier, CoderState, DecodedDescriptor};
pub use compiler::{compile_template, CompiledTemplate, CompiledTemplateManager};
pub use decoder::{DecodeOptions, DecodePolicy, Decoder};
pub use encoder::{EncodePolicy, Encoder};
pub use engine::{process_members, process_template, LeafPolicy};
pub use error::BufrError;
pub use message::BufrMessage;
pub use sections::{
    decode_section5, encode_section5, Section0, Section1, Section2, Section3, START_SIGNATURE,
    STOP_SIGNATURE,
};
pub use templatedata::{
    AttrKind, NodeArena, NodeId, NodeKind, TemplateData, Wired, WiredNode,
};
pub use values::Value;
