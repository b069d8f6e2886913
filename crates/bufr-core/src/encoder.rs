//! The encode leaf policy and the message-level encode driver.

use bufr_bits::{missing_value, BitWriter, NBITS_PER_BYTE};
use bufr_tables::Tables;
use tracing::debug;

use crate::coder::{CoderState, DecodedDescriptor};
use crate::compiler::CompiledTemplateManager;
use crate::decoder::{bitmap_from_tail, NBITS_FOR_NBITS_DIFF};
use crate::engine::{process_template, LeafPolicy};
use crate::error::BufrError;
use crate::message::BufrMessage;
use crate::sections::{close_section, encode_section5};
use crate::values::Value;

/// Width in bits needed for `x`, reserving the all-ones missing pattern.
fn nbits_for_uint(x: u64) -> usize {
    let nbits = (64 - x.leading_zeros()) as usize;
    if x == missing_value(nbits) {
        nbits + 1
    } else {
        nbits.max(1)
    }
}

/// Encodes [`BufrMessage`] values back to the wire form.
///
/// Section and total lengths are always recomputed; round-tripping a decoded
/// message reproduces the input bytes modulo canonical pad bits.
pub struct Encoder {
    tables: Tables,
    compiled: Option<CompiledTemplateManager>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// An encoder over the embedded default tables.
    pub fn new() -> Self {
        Self {
            tables: Tables::new(),
            compiled: None,
        }
    }

    /// An encoder loading tables from the given provider.
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

    /// Encodes a message tree to bytes.
    pub fn encode(&mut self, message: &BufrMessage) -> Result<Vec<u8>, BufrError> {
        let edition = message.section0.edition;
        debug!(edition, "encoding message");
        let mut writer = BitWriter::new();

        message.section0.encode(&mut writer)?;
        let total_length_pos = 32;

        message.section1.encode(&mut writer, edition)?;
        match (&message.section2, message.section1.has_section2()) {
            (Some(section2), true) => {
                section2.encode(&mut writer, edition)?;
            }
            (None, false) => {}
            (Some(_), false) => {
                return Err(BufrError::MalformedHeader(
                    "section 2 present but section 1 does not flag it".into(),
                ))
            }
            (None, true) => {
                return Err(BufrError::MalformedHeader(
                    "section 1 flags an optional section 2 that is absent".into(),
                ))
            }
        }
        message.section3.encode(&mut writer, edition)?;

        let template_data = message.template_data.as_ref().ok_or_else(|| {
            BufrError::MalformedHeader("message carries no template data to encode".into())
        })?;

        let section4_start = writer.pos();
        let section4_length_pos = writer.pos();
        writer.write_uint(0, 24)?;
        writer.write_uint(0, 8)?;
        self.process_template_data(&mut writer, message, template_data.values_all_subsets())?;
        let nbytes = close_section(&mut writer, section4_start, edition);
        writer.patch_uint(nbytes as u64, 24, section4_length_pos)?;

        encode_section5(&mut writer)?;

        let total = writer.pos() / NBITS_PER_BYTE;
        writer.patch_uint(total as u64, 24, total_length_pos)?;
        Ok(writer.into_bytes())
    }

    fn process_template_data(
        &mut self,
        writer: &mut BitWriter,
        message: &BufrMessage,
        values_all_subsets: &[Vec<Value>],
    ) -> Result<(), BufrError> {
        let key = message.section1.table_group_key();
        let group = self.tables.group(key)?;
        let template = group.template_from_ids(&message.section3.unexpanded_descriptors)?;

        let is_compressed = message.section3.is_compressed();
        let n_subsets = message.section3.n_subsets as usize;
        let mut state = CoderState::new(
            is_compressed,
            n_subsets,
            Some(values_all_subsets.to_vec()),
        );
        let mut policy = EncodePolicy { writer };

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
        Ok(())
    }
}

/// The encode realisation of the leaf hooks: consumes values, writes bits.
pub struct EncodePolicy<'w> {
    pub writer: &'w mut BitWriter,
}

/// Converts a numeric value to its raw unsigned reading.
fn numeric_to_raw(
    value: &Value,
    descriptor: u32,
    nbits: usize,
    scale: i32,
    refval: i64,
) -> Result<u64, BufrError> {
    let mismatch = |found: &Value| BufrError::EncodeTypeMismatch {
        descriptor,
        expected: "numeric",
        found: found.to_string(),
    };
    let scaled = match value {
        Value::Int(v) if scale == 0 => *v,
        Value::Int(v) => (*v as f64 * 10f64.powi(scale)).round() as i64,
        Value::Float(v) => (*v * 10f64.powi(scale)).round() as i64,
        other => return Err(mismatch(other)),
    };
    let raw = scaled - refval;
    if raw < 0 || raw as u64 > missing_value(nbits) {
        return Err(BufrError::EncodeTypeMismatch {
            descriptor,
            expected: "value within the packable range",
            found: value.to_string(),
        });
    }
    Ok(raw as u64)
}

impl EncodePolicy<'_> {
    fn write_octets(&mut self, value: &Value, descriptor: u32, nbytes: usize) -> Result<(), BufrError> {
        match value {
            Value::Missing => {
                for _ in 0..nbytes {
                    self.writer.write_uint(0xff, 8)?;
                }
                Ok(())
            }
            other => {
                let octets = other.octets().ok_or_else(|| BufrError::EncodeTypeMismatch {
                    descriptor,
                    expected: "str or bytes",
                    found: other.to_string(),
                })?;
                self.writer.write_bytes(octets, nbytes)?;
                Ok(())
            }
        }
    }
}

/// Pulls the next input value for every subset and classifies the column.
fn next_values_all_subsets(
    state: &mut CoderState,
    descriptor: &DecodedDescriptor,
) -> Result<(Vec<Value>, bool, bool), BufrError> {
    let idx = state.idx_value;
    let mut values = Vec::with_capacity(state.n_subsets);
    for subset in &state.values_all_subsets {
        let value = subset.get(idx).cloned().ok_or_else(|| {
            BufrError::EncodeTypeMismatch {
                descriptor: descriptor.id(),
                expected: "a value for every subset",
                found: "end of values".into(),
            }
        })?;
        values.push(value);
    }
    state.idx_value += 1;
    let all_equal = values.iter().all(|v| *v == values[0]);
    let all_missing = all_equal && values[0].is_missing();
    Ok((values, all_equal, all_missing))
}

/// Pulls the next input value of the current subset.
fn next_value(state: &mut CoderState, descriptor: &DecodedDescriptor) -> Result<Value, BufrError> {
    let value = state
        .values()
        .get(state.idx_value)
        .cloned()
        .ok_or_else(|| BufrError::EncodeTypeMismatch {
            descriptor: descriptor.id(),
            expected: "another value in the subset",
            found: "end of values".into(),
        })?;
    state.idx_value += 1;
    Ok(value)
}

impl LeafPolicy for EncodePolicy<'_> {
    fn process_numeric(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
        scale: i32,
        refval: i64,
    ) -> Result<(), BufrError> {
        let id = descriptor.id();
        if !state.is_compressed {
            let value = next_value(state, &descriptor)?;
            state.push_descriptor(descriptor);
            let raw = match value {
                Value::Missing => missing_value(nbits),
                other => numeric_to_raw(&other, id, nbits, scale, refval)?,
            };
            self.writer.write_uint(raw, nbits)?;
            return Ok(());
        }

        let (values, all_equal, all_missing) = next_values_all_subsets(state, &descriptor)?;
        state.push_descriptor(descriptor);
        if all_missing {
            self.writer.write_uint(missing_value(nbits), nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }
        if all_equal {
            let raw = numeric_to_raw(&values[0], id, nbits, scale, refval)?;
            self.writer.write_uint(raw, nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }

        let mut raws = Vec::with_capacity(values.len());
        for value in &values {
            raws.push(match value {
                Value::Missing => None,
                other => Some(numeric_to_raw(other, id, nbits, scale, refval)?),
            });
        }
        let min = raws.iter().flatten().copied().min().unwrap_or(0);
        let max = raws.iter().flatten().copied().max().unwrap_or(0);
        let nbits_diff = nbits_for_uint(max - min + 1);
        self.writer.write_uint(min, nbits)?;
        self.writer.write_uint(nbits_diff as u64, NBITS_FOR_NBITS_DIFF)?;
        for raw in raws {
            let delta = match raw {
                Some(raw) => raw - min,
                None => missing_value(nbits_diff),
            };
            self.writer.write_uint(delta, nbits_diff)?;
        }
        Ok(())
    }

    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), BufrError> {
        let id = descriptor.id();
        if !state.is_compressed {
            let value = next_value(state, &descriptor)?;
            state.push_descriptor(descriptor);
            return self.write_octets(&value, id, nbytes);
        }

        let (values, all_equal, all_missing) = next_values_all_subsets(state, &descriptor)?;
        state.push_descriptor(descriptor);
        if all_missing || all_equal {
            self.write_octets(&values[0], id, nbytes)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }
        for _ in 0..nbytes {
            self.writer.write_uint(0, 8)?;
        }
        self.writer.write_uint(nbytes as u64, NBITS_FOR_NBITS_DIFF)?;
        for value in &values {
            self.write_octets(value, id, nbytes)?;
        }
        Ok(())
    }

    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
    ) -> Result<(), BufrError> {
        let id = descriptor.id();
        let to_raw = |value: &Value| -> Result<u64, BufrError> {
            match value {
                Value::Int(v) if *v >= 0 && (*v as u64) <= missing_value(nbits) => Ok(*v as u64),
                other => Err(BufrError::EncodeTypeMismatch {
                    descriptor: id,
                    expected: "code/flag value within width",
                    found: other.to_string(),
                }),
            }
        };
        if !state.is_compressed {
            let value = next_value(state, &descriptor)?;
            state.push_descriptor(descriptor);
            let raw = match value {
                Value::Missing => missing_value(nbits),
                other => to_raw(&other)?,
            };
            self.writer.write_uint(raw, nbits)?;
            return Ok(());
        }

        let (values, all_equal, all_missing) = next_values_all_subsets(state, &descriptor)?;
        state.push_descriptor(descriptor);
        if all_missing {
            self.writer.write_uint(missing_value(nbits), nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }
        if all_equal {
            self.writer.write_uint(to_raw(&values[0])?, nbits)?;
            self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
            return Ok(());
        }

        let mut raws = Vec::with_capacity(values.len());
        for value in &values {
            raws.push(match value {
                Value::Missing => None,
                other => Some(to_raw(other)?),
            });
        }
        let min = raws.iter().flatten().copied().min().unwrap_or(0);
        let max = raws.iter().flatten().copied().max().unwrap_or(0);
        let nbits_diff = nbits_for_uint(max - min + 1);
        self.writer.write_uint(min, nbits)?;
        self.writer.write_uint(nbits_diff as u64, NBITS_FOR_NBITS_DIFF)?;
        for raw in raws {
            let delta = match raw {
                Some(raw) => raw - min,
                None => missing_value(nbits_diff),
            };
            self.writer.write_uint(delta, nbits_diff)?;
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
        let as_int = |value: &Value| -> Result<i64, BufrError> {
            value.as_int().ok_or_else(|| BufrError::EncodeTypeMismatch {
                descriptor: id,
                expected: "integer reference value",
                found: value.to_string(),
            })
        };
        if !state.is_compressed {
            let value = next_value(state, &descriptor)?;
            state.push_descriptor(descriptor);
            let refval = as_int(&value)?;
            state.new_refvals.insert(id, refval);
            self.writer.write_int(refval, nbits)?;
            return Ok(());
        }

        let (values, all_equal, _) = next_values_all_subsets(state, &descriptor)?;
        state.push_descriptor(descriptor);
        if !all_equal {
            return Err(BufrError::Compression(format!(
                "new reference value for {id:06} must be identical across subsets"
            )));
        }
        let refval = as_int(&values[0])?;
        state.new_refvals.insert(id, refval);
        self.writer.write_int(refval, nbits)?;
        self.writer.write_uint(0, NBITS_FOR_NBITS_DIFF)?;
        Ok(())
    }

    fn process_constant(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        value: i64,
    ) -> Result<(), BufrError> {
        let id = descriptor.id();
        let check = |found: &Value| -> Result<(), BufrError> {
            if found.as_int() == Some(value) {
                Ok(())
            } else {
                Err(BufrError::EncodeTypeMismatch {
                    descriptor: id,
                    expected: "operator slot value 0",
                    found: found.to_string(),
                })
            }
        };
        if !state.is_compressed {
            let found = next_value(state, &descriptor)?;
            state.push_descriptor(descriptor);
            check(&found)
        } else {
            let (values, _, _) = next_values_all_subsets(state, &descriptor)?;
            state.push_descriptor(descriptor);
            for found in &values {
                check(found)?;
            }
            Ok(())
        }
    }

    fn delayed_factor(&mut self, state: &CoderState) -> Result<usize, BufrError> {
        if state.idx_value == 0 {
            return Err(BufrError::Replication("no factor value consumed".into()));
        }
        let idx = state.idx_value - 1;
        let value = if state.is_compressed {
            state.values_all_subsets[0].get(idx).cloned()
        } else {
            state.values().get(idx).cloned()
        };
        match value {
            Some(Value::Int(v)) if v >= 0 => Ok(v as usize),
            other => Err(BufrError::Replication(format!(
                "delayed replication factor must be a non-negative integer, got {}",
                other.map_or_else(|| "nothing".to_string(), |v| v.to_string())
            ))),
        }
    }

    fn define_bitmap(&mut self, state: &mut CoderState, reuse: bool) -> Result<(), BufrError> {
        let values = if state.is_compressed {
            &state.values_all_subsets[0]
        } else {
            state.values()
        };
        let bitmap = bitmap_from_tail(&values[..state.idx_value], state.n_031031)?;
        if reuse {
            state.reusable_bitmap = Some(bitmap.clone());
        }
        state.build_bitmapped_descriptors(&bitmap)
    }

    fn bit_pos(&self) -> usize {
        self.writer.pos()
    }
}
