//! The decode leaf policy and the message-level decode driver.

use bufr_bits::{missing_value, BitReader, NBITS_PER_BYTE};
use bufr_tables::{TableGroup, Tables};
use std::sync::Arc;
use tracing::debug;

use crate::coder::{CoderState, DecodedDescriptor};
use crate::compiler::CompiledTemplateManager;
use crate::engine::{process_template, LeafPolicy};
use crate::error::BufrError;
use crate::message::BufrMessage;
use crate::sections::{
    decode_section5, skip_to_section_end, Section0, Section1, Section2, Section3, START_SIGNATURE,
};
use crate::templatedata::TemplateData;
use crate::values::Value;

/// Number of bits carrying the per-subset delta width of a compressed leaf.
pub(crate) const NBITS_FOR_NBITS_DIFF: usize = 6;

/// Knobs of one decode run.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Scan the input for the `BUFR` signature instead of requiring it at
    /// offset zero.
    pub scan_for_signature: bool,
    /// Stop before the section 4 payload; the message carries no template
    /// data.
    pub info_only: bool,
    /// Wire the decoded flat lists into the hierarchical tree.
    pub wire: bool,
    /// Do not fail on a wrong terminator or total-length mismatch.
    pub ignore_value_expectation: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            scan_for_signature: true,
            info_only: false,
            wire: true,
            ignore_value_expectation: false,
        }
    }
}

/// Decodes BUFR byte streams into [`BufrMessage`] values.
///
/// The decoder owns its table snapshots and, optionally, a compiled template
/// cache; independent decoders can run on separate threads against shared
/// `Arc` table groups.
pub struct Decoder {
    tables: Tables,
    compiled: Option<CompiledTemplateManager>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// A decoder over the embedded default tables.
    pub fn new() -> Self {
        Self {
            tables: Tables::new(),
            compiled: None,
        }
    }

    /// A decoder loading tables from the given provider.
    pub fn with_tables(tables: Tables) -> Self {
        Self {
            tables,
            compiled: None,
        }
    }

    /// Enables template compilation with a bounded cache.
    pub fn with_template_compilation(mut self, cache_max: usize) -> Self {
        self.compiled = Some(CompiledTemplateManager::new(cache_max));
        self
    }

    /// Decodes the first message in `input`.
    pub fn decode(&mut self, input: &[u8]) -> Result<BufrMessage, BufrError> {
        self.decode_with_options(input, &DecodeOptions::default())
    }

    /// Decodes every message in `input`, resuming at the next `BUFR`
    /// signature after each.
    pub fn decode_all(&mut self, input: &[u8]) -> Result<Vec<BufrMessage>, BufrError> {
        let options = DecodeOptions {
            scan_for_signature: false,
            ..DecodeOptions::default()
        };
        let mut messages = Vec::new();
        let mut offset = 0;
        while let Some(found) = find_signature(&input[offset.min(input.len())..]) {
            let start = offset + found;
            let message = self.decode_with_options(&input[start..], &options)?;
            offset = start + message.serialized.len();
            messages.push(message);
        }
        Ok(messages)
    }

    /// Decodes one message with explicit options.
    pub fn decode_with_options(
        &mut self,
        input: &[u8],
        options: &DecodeOptions,
    ) -> Result<BufrMessage, BufrError> {
        let input = if options.scan_for_signature {
            let start = find_signature(input).ok_or_else(|| {
                BufrError::MalformedHeader("cannot find start signature BUFR".into())
            })?;
            &input[start..]
        } else {
            input
        };

        let mut reader = BitReader::new(input);
        let section0 = Section0::decode(&mut reader)?;
        debug!(
            edition = section0.edition,
            total_length = section0.total_length,
            "decoding message"
        );
        let section1 = Section1::decode(&mut reader, section0.edition)?;
        let section2 = if section1.has_section2() {
            Some(Section2::decode(&mut reader)?)
        } else {
            None
        };
        let section3 = Section3::decode(&mut reader)?;

        let section4_start = reader.pos();
        let section4_length = reader.read_uint(24)? as usize;
        reader.skip(8)?;
        let template_data = if options.info_only {
            reader.skip(
                (section4_length * NBITS_PER_BYTE)
                    .checked_sub(reader.pos() - section4_start)
                    .ok_or_else(|| {
                        BufrError::MalformedHeader(format!(
                            "section 4 length {section4_length} too short"
                        ))
                    })?,
            )?;
            None
        } else {
            let data = self.process_template_data(&mut reader, &section1, &section3)?;
            skip_to_section_end(&mut reader, section4_start, section4_length)?;
            Some(data)
        };

        match decode_section5(&mut reader) {
            Err(error) if !options.ignore_value_expectation => return Err(error),
            _ => {}
        }

        let nbytes = reader.pos() / NBITS_PER_BYTE;
        if nbytes != section0.total_length && !options.ignore_value_expectation {
            return Err(BufrError::MalformedHeader(format!(
                "declared total length {} but sections span {} octets",
                section0.total_length, nbytes
            )));
        }

        let mut message = BufrMessage {
            section0,
            section1,
            section2,
            section3,
            section4_length,
            template_data,
            serialized: input[..nbytes].to_vec(),
        };
        if options.wire {
            message.wire()?;
        }
        Ok(message)
    }

    fn process_template_data(
        &mut self,
        reader: &mut BitReader<'_>,
        section1: &Section1,
        section3: &Section3,
    ) -> Result<TemplateData, BufrError> {
        let key = section1.table_group_key();
        let group: Arc<TableGroup> = self.tables.group(key)?;
        let template = group.template_from_ids(&section3.unexpanded_descriptors)?;

        let is_compressed = section3.is_compressed();
        let n_subsets = section3.n_subsets as usize;
        let mut state = CoderState::new(is_compressed, n_subsets, None);
        let mut policy = DecodePolicy { reader };

        let compiled = self
            .compiled
            .as_mut()
            .and_then(|manager| manager.get_or_compile(&template, key));

        match compiled {
            Some(compiled) => {
                if is_compressed {
                    compiled.run(&mut policy, &mut state)?;
                } else {
                    for idx_subset in 0..n_subsets {
                        state.switch_subset_context(idx_subset);
                        compiled.run(&mut policy, &mut state)?;
                    }
                }
            }
            None => {
                if is_compressed {
                    process_template(&mut policy, &mut state, &template)?;
                } else {
                    for idx_subset in 0..n_subsets {
                        state.switch_subset_context(idx_subset);
                        process_template(&mut policy, &mut state, &template)?;
                    }
                }
            }
        }

        Ok(TemplateData::new(
            template,
            is_compressed,
            n_subsets,
            state.descriptors_all_subsets,
            state.values_all_subsets,
            state.bitmap_links_all_subsets,
        ))
    }
}

fn find_signature(input: &[u8]) -> Option<usize> {
    input
        .windows(START_SIGNATURE.len())
        .position(|window| window == START_SIGNATURE)
}

/// The decode realisation of the leaf hooks: reads bits, appends values.
pub struct DecodePolicy<'r, 'a> {
    pub reader: &'r mut BitReader<'a>,
}

impl DecodePolicy<'_, '_> {
    fn read_uint_or_missing(&mut self, nbits: usize) -> Result<Option<u64>, BufrError> {
        let raw = self.reader.read_uint(nbits)?;
        if nbits > 1 && raw == missing_value(nbits) {
            Ok(None)
        } else {
            Ok(Some(raw))
        }
    }
}

/// Applies reference value and scale to a raw reading.
fn numeric_value(raw: u64, scale: i32, refval: i64) -> Value {
    let value = raw as i64 + refval;
    if scale != 0 {
        Value::Float(value as f64 / 10f64.powi(scale))
    } else {
        Value::Int(value)
    }
}

impl LeafPolicy for DecodePolicy<'_, '_> {
    fn process_numeric(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
        scale: i32,
        refval: i64,
    ) -> Result<(), BufrError> {
        state.push_descriptor(descriptor);
        if !state.is_compressed {
            let value = match self.read_uint_or_missing(nbits)? {
                Some(raw) => numeric_value(raw, scale, refval),
                None => Value::Missing,
            };
            state.push_value(value);
            return Ok(());
        }

        let min_raw = self.read_uint_or_missing(nbits)?;
        let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as usize;
        match min_raw {
            None => {
                if nbits_diff != 0 {
                    return Err(BufrError::Compression(
                        "all-missing minimum with a non-zero delta width".into(),
                    ));
                }
                state.push_value_all_subsets(vec![Value::Missing; state.n_subsets]);
            }
            Some(min_raw) if nbits_diff == 0 => {
                let value = numeric_value(min_raw, scale, refval);
                state.push_value_all_subsets(vec![value; state.n_subsets]);
            }
            Some(min_raw) => {
                let mut values = Vec::with_capacity(state.n_subsets);
                for _ in 0..state.n_subsets {
                    values.push(match self.read_uint_or_missing(nbits_diff)? {
                        Some(diff) => numeric_value(min_raw + diff, scale, refval),
                        None => Value::Missing,
                    });
                }
                state.push_value_all_subsets(values);
            }
        }
        Ok(())
    }

    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), BufrError> {
        state.push_descriptor(descriptor);
        if !state.is_compressed {
            let octets = self.reader.read_bytes(nbytes)?;
            state.push_value(Value::from_octets(octets));
            return Ok(());
        }

        let min_octets = self.reader.read_bytes(nbytes)?;
        let nbytes_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as usize;
        if nbytes_diff == 0 {
            let value = Value::from_octets(min_octets);
            state.push_value_all_subsets(vec![value; state.n_subsets]);
        } else {
            if min_octets.iter().any(|b| *b != 0) {
                return Err(BufrError::Compression(
                    "per-subset strings need an all-zero common value".into(),
                ));
            }
            let mut values = Vec::with_capacity(state.n_subsets);
            for _ in 0..state.n_subsets {
                values.push(Value::from_octets(self.reader.read_bytes(nbytes_diff)?));
            }
            state.push_value_all_subsets(values);
        }
        Ok(())
    }

    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
    ) -> Result<(), BufrError> {
        state.push_descriptor(descriptor);
        if !state.is_compressed {
            let value = match self.read_uint_or_missing(nbits)? {
                Some(raw) => Value::Int(raw as i64),
                None => Value::Missing,
            };
            state.push_value(value);
            return Ok(());
        }

        let min_raw = self.read_uint_or_missing(nbits)?;
        let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as usize;
        match min_raw {
            None => {
                if nbits_diff != 0 {
                    return Err(BufrError::Compression(
                        "all-missing minimum with a non-zero delta width".into(),
                    ));
                }
                state.push_value_all_subsets(vec![Value::Missing; state.n_subsets]);
            }
            Some(min_raw) if nbits_diff == 0 => {
                state.push_value_all_subsets(vec![Value::Int(min_raw as i64); state.n_subsets]);
            }
            Some(min_raw) => {
                let mut values = Vec::with_capacity(state.n_subsets);
                for _ in 0..state.n_subsets {
                    values.push(match self.read_uint_or_missing(nbits_diff)? {
                        Some(diff) => {
                            let raw = min_raw + diff;
                            // A reassembled code can still be the missing
                            // pattern at the element's own width.
                            if nbits > 1 && raw == missing_value(nbits) {
                                Value::Missing
                            } else {
                                Value::Int(raw as i64)
                            }
                        }
                        None => Value::Missing,
                    });
                }
                state.push_value_all_subsets(values);
            }
        }
        Ok(())
    }

    fn process_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
    ) -> Result<(), BufrError> {
        let id = descriptor.id();
        state.push_descriptor(descriptor);
        if !state.is_compressed {
            let value = self.reader.read_int(nbits)?;
            state.new_refvals.insert(id, value);
            state.push_value(Value::Int(value));
            return Ok(());
        }

        let value = self.reader.read_int(nbits)?;
        let nbits_diff = self.reader.read_uint(NBITS_FOR_NBITS_DIFF)? as usize;
        if nbits_diff != 0 {
            return Err(BufrError::Compression(format!(
                "new reference value for {id:06} must be identical across subsets"
            )));
        }
        state.new_refvals.insert(id, value);
        state.push_value_all_subsets(vec![Value::Int(value); state.n_subsets]);
        Ok(())
    }

    fn process_constant(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        value: i64,
    ) -> Result<(), BufrError> {
        state.push_descriptor(descriptor);
        if state.is_compressed {
            state.push_value_all_subsets(vec![Value::Int(value); state.n_subsets]);
        } else {
            state.push_value(Value::Int(value));
        }
        Ok(())
    }

    fn delayed_factor(&mut self, state: &CoderState) -> Result<usize, BufrError> {
        let value = if state.is_compressed {
            let mut per_subset = state
                .values_all_subsets
                .iter()
                .map(|values| values.last().cloned());
            let first = per_subset
                .next()
                .flatten()
                .ok_or_else(|| BufrError::Replication("no factor value decoded".into()))?;
            if per_subset.any(|v| v.as_ref() != Some(&first)) {
                return Err(BufrError::Compression(
                    "delayed replication factors differ across subsets".into(),
                ));
            }
            first
        } else {
            state
                .values()
                .last()
                .cloned()
                .ok_or_else(|| BufrError::Replication("no factor value decoded".into()))?
        };
        match value {
            Value::Int(v) if v >= 0 => Ok(v as usize),
            other => Err(BufrError::Replication(format!(
                "delayed replication factor must be a non-negative integer, got {other}"
            ))),
        }
    }

    fn define_bitmap(&mut self, state: &mut CoderState, reuse: bool) -> Result<(), BufrError> {
        let values = if state.is_compressed {
            &state.values_all_subsets[0]
        } else {
            state.values()
        };
        let bitmap = bitmap_from_tail(values, state.n_031031)?;
        if reuse {
            state.reusable_bitmap = Some(bitmap.clone());
        }
        state.build_bitmapped_descriptors(&bitmap)
    }

    fn bit_pos(&self) -> usize {
        self.reader.pos()
    }
}

/// Collects the last `n` decoded values as bitmap bits.
pub(crate) fn bitmap_from_tail(values: &[Value], n: usize) -> Result<Vec<u8>, BufrError> {
    if values.len() < n {
        return Err(BufrError::BitmapMismatch(format!(
            "bitmap of {n} bits but only {} values decoded",
            values.len()
        )));
    }
    values[values.len() - n..]
        .iter()
        .map(|value| match value {
            Value::Int(0) => Ok(0u8),
            Value::Int(1) => Ok(1u8),
            other => Err(BufrError::BitmapMismatch(format!(
                "bitmap bit must be 0 or 1, got {other}"
            ))),
        })
        .collect()
}
