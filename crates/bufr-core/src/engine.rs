//! The template processing engine.
//!
//! A template walk is plain recursion over the descriptor list, driving a
//! [`LeafPolicy`] at every point where bits are consumed or produced. Decode
//! and encode are two policies over the same control flow; the engine itself
//! never touches the bit stream.
//!
//! Operator precedence while walking a descriptor:
//! 1. an active 221 data-not-present count covers everything else,
//! 2. an active 203 capture turns element descriptors into new reference
//!    value reads,
//! 3. an active 206 width replaces the next descriptor with a skipped local,
//! 4. an open bitmap definition block observes the descriptor,
//! 5. normal processing.

use bufr_tables::{BufrTemplate, Descriptor, ElementDescriptor, ElementKind, OperatorDescriptor};
use std::sync::Arc;
use tracing::trace;

use crate::coder::{BitmapState, BsrModifier, CoderState, DecodedDescriptor, QaStatus};
use crate::error::BufrError;

/// The leaf hooks that distinguish decoding from encoding.
///
/// Every method appends exactly one flat descriptor entry and the matching
/// value slot(s); for compressed data a single call accounts for all
/// subsets.
pub trait LeafPolicy {
    /// A numeric leaf with effective width, scale and reference value.
    fn process_numeric(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
        scale: i32,
        refval: i64,
    ) -> Result<(), BufrError>;

    /// A character leaf of `nbytes` octets.
    fn process_string(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbytes: usize,
    ) -> Result<(), BufrError>;

    /// A code/flag leaf; no scale or reference value applies.
    fn process_codeflag(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
    ) -> Result<(), BufrError>;

    /// A new reference value captured under 203YYY, stored signed.
    fn process_new_refval(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        nbits: usize,
    ) -> Result<(), BufrError>;

    /// An operator entry that occupies a value slot without consuming bits.
    fn process_constant(
        &mut self,
        state: &mut CoderState,
        descriptor: DecodedDescriptor,
        value: i64,
    ) -> Result<(), BufrError>;

    /// The value of the delayed replication factor just processed.
    fn delayed_factor(&mut self, state: &CoderState) -> Result<usize, BufrError>;

    /// Materialises the bitmap from the last `state.n_031031` bit values and
    /// resolves it against the back-referenceable candidates.
    fn define_bitmap(&mut self, state: &mut CoderState, reuse: bool) -> Result<(), BufrError>;

    /// Current bit position, for error context.
    fn bit_pos(&self) -> usize;
}

/// Walks a whole template for the current subset.
pub fn process_template<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    template: &BufrTemplate,
) -> Result<(), BufrError> {
    process_members(policy, state, &template.members)?;
    if !state.nbits_of_associated.is_empty() {
        return Err(BufrError::UnbalancedOperator(format!(
            "{} unmatched 204YYY at end of template",
            state.nbits_of_associated.len()
        )));
    }
    Ok(())
}

/// Walks the member list of a template, sequence or replication group.
pub fn process_members<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    members: &[Descriptor],
) -> Result<(), BufrError> {
    for member in members {
        state.trail.push(member.id());
        let result = process_member(policy, state, member)
            .map_err(|e| e.with_context(policy.bit_pos(), &state.trail));
        state.trail.pop();
        result?;
    }
    Ok(())
}

fn process_member<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    member: &Descriptor,
) -> Result<(), BufrError> {
    trace!(descriptor = %member, "processing");

    // 221 YYY: data not present for the covered descriptors except
    // classes 1-9 and 31.
    if state.data_not_present_count > 0 {
        state.data_not_present_count -= 1;
        if let Descriptor::Element(element) = member {
            let x = element.class();
            if !((1..=9).contains(&x) || x == 31) {
                return Ok(());
            }
        }
    }

    // 203 YYY: element descriptors carry new reference values.
    if state.nbits_of_new_refval > 0 {
        if let Descriptor::Element(element) = member {
            return process_new_refval_capture(policy, state, element);
        }
    }

    // 206 YYY: the next descriptor is a local field of a known width.
    if state.nbits_of_skipped_local > 0 {
        let nbits = std::mem::take(&mut state.nbits_of_skipped_local);
        let descriptor = DecodedDescriptor::SkippedLocal {
            id: member.id(),
            nbits,
        };
        return policy.process_codeflag(state, descriptor, nbits);
    }

    // An open bitmap definition block observes every descriptor.
    if state.bitmap_state != BitmapState::Inactive {
        bitmap_definition_step(policy, state, member.id())?;
    }

    match member {
        Descriptor::Element(element) => process_element(policy, state, element, false),
        Descriptor::FixedReplication { members, .. } => {
            for _ in 0..member.n_repeats() {
                process_members(policy, state, members)?;
            }
            Ok(())
        }
        Descriptor::DelayedReplication {
            factor, members, ..
        } => process_delayed_replication(policy, state, factor, members),
        Descriptor::Operator(op) => process_operator(policy, state, *op),
        Descriptor::Sequence(seq) => process_members(policy, state, &seq.members),
        Descriptor::Undefined { id } => Err(BufrError::Tables(
            bufr_tables::TablesError::UnknownDescriptor(*id),
        )),
    }
}

fn process_element<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    element: &Arc<ElementDescriptor>,
    skip_associated: bool,
) -> Result<(), BufrError> {
    let x = element.class();

    // A non-zero 204 must introduce its significance before any other
    // element; reject instead of guessing.
    if state.expecting_assoc_significance {
        if element.id == 31021 {
            state.expecting_assoc_significance = false;
        } else {
            return Err(BufrError::UnbalancedOperator(format!(
                "204YYY must be followed by 031021, found {:06}; the associated \
                 field significance is undefined without it",
                element.id
            )));
        }
    }

    // Associated bits precede the element's own bits. Class 31 elements are
    // exempt.
    if !skip_associated && !state.nbits_of_associated.is_empty() && x != 31 {
        let nbits = state.associated_nbits();
        let descriptor = DecodedDescriptor::Associated {
            id: element.id,
            nbits,
        };
        policy.process_codeflag(state, descriptor, nbits)?;
    }

    // Class 33 elements after 222000 attach to bitmapped candidates.
    if x == 33 {
        if state.qa_status == QaStatus::Waiting {
            state.qa_status = QaStatus::Processing;
        }
        if state.qa_status == QaStatus::Processing {
            let (target, _) = state.next_bitmapped()?;
            state.link_bitmap(target);
        }
    } else if state.qa_status == QaStatus::Processing {
        state.qa_status = QaStatus::Inactive;
    }

    let descriptor = DecodedDescriptor::Element(element.clone());
    match element.kind() {
        ElementKind::String => {
            let nbytes = if state.new_nbytes != 0 {
                std::mem::take(&mut state.new_nbytes)
            } else {
                element.nbits / 8
            };
            policy.process_string(state, descriptor, nbytes)
        }
        ElementKind::CodeTable | ElementKind::FlagTable => {
            policy.process_codeflag(state, descriptor, element.nbits)
        }
        ElementKind::Numeric => {
            // Width and scale operators do not apply to class 31.
            if x == 31 {
                return policy.process_numeric(
                    state,
                    descriptor,
                    element.nbits,
                    element.scale,
                    element.refval,
                );
            }
            let (nbits, scale, refval) = effective_packing(
                state,
                element.id,
                element.nbits,
                element.scale,
                element.refval,
            )?;
            policy.process_numeric(state, descriptor, nbits, scale, refval)
        }
    }
}

/// Applies the live operator modifiers to an element's packing parameters.
fn effective_packing(
    state: &CoderState,
    id: u32,
    nbits: usize,
    scale: i32,
    refval: i64,
) -> Result<(usize, i32, i64), BufrError> {
    let eff_nbits = nbits as i32 + state.nbits_offset + state.bsr.nbits_increment;
    if !(1..=64).contains(&eff_nbits) {
        return Err(BufrError::UnbalancedOperator(format!(
            "operators make the width of {id:06} {eff_nbits} bits"
        )));
    }
    let eff_scale = scale + state.scale_offset + state.bsr.scale_increment;
    let eff_refval = match state.new_refvals.get(&id) {
        Some(new_refval) => new_refval * state.bsr.refval_factor,
        None => refval * state.bsr.refval_factor,
    };
    Ok((eff_nbits as usize, eff_scale, eff_refval))
}

fn process_new_refval_capture<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    element: &Arc<ElementDescriptor>,
) -> Result<(), BufrError> {
    if element.kind() == ElementKind::String {
        return Err(BufrError::UnbalancedOperator(format!(
            "203YYY cannot define a reference value for string element {:06}",
            element.id
        )));
    }
    // Associated bits still precede the reference value bits.
    if !state.nbits_of_associated.is_empty() && element.class() != 31 {
        let nbits = state.associated_nbits();
        let descriptor = DecodedDescriptor::Associated {
            id: element.id,
            nbits,
        };
        policy.process_codeflag(state, descriptor, nbits)?;
    }
    let nbits = state.nbits_of_new_refval;
    policy.process_new_refval(state, DecodedDescriptor::Element(element.clone()), nbits)
}

fn process_delayed_replication<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    factor: &Arc<ElementDescriptor>,
    members: &[Descriptor],
) -> Result<(), BufrError> {
    if factor.id == 31011 || factor.id == 31012 {
        return Err(BufrError::Unsupported(
            "delayed repetition factors 031011/031012".into(),
        ));
    }
    process_element(policy, state, factor, false)?;
    let count = policy.delayed_factor(state)?;
    for _ in 0..count {
        process_members(policy, state, members)?;
    }
    Ok(())
}

fn process_operator<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    op: OperatorDescriptor,
) -> Result<(), BufrError> {
    let operand = op.operand();
    match op.operator_code() {
        201 => {
            state.nbits_offset = if operand != 0 { operand as i32 - 128 } else { 0 };
            Ok(())
        }
        202 => {
            state.scale_offset = if operand != 0 { operand as i32 - 128 } else { 0 };
            Ok(())
        }
        203 => {
            // 255 concludes the capture but keeps the collected table;
            // 0 cancels and clears it.
            if operand == 255 {
                state.nbits_of_new_refval = 0;
            } else {
                state.nbits_of_new_refval = operand as usize;
                if operand == 0 {
                    state.new_refvals.clear();
                }
            }
            Ok(())
        }
        204 => {
            if operand == 0 {
                state.nbits_of_associated.pop().ok_or_else(|| {
                    BufrError::UnbalancedOperator("204000 without an open 204YYY".into())
                })?;
            } else {
                state.nbits_of_associated.push(operand as usize);
                state.expecting_assoc_significance = true;
            }
            Ok(())
        }
        205 => policy.process_string(
            state,
            DecodedDescriptor::Operator(op),
            operand as usize,
        ),
        206 => {
            state.nbits_of_skipped_local = operand as usize;
            Ok(())
        }
        207 => {
            state.bsr = if operand == 0 {
                BsrModifier::default()
            } else {
                BsrModifier {
                    nbits_increment: (10 * operand as i32 + 2) / 3,
                    scale_increment: operand as i32,
                    refval_factor: 10i64.pow(operand),
                }
            };
            Ok(())
        }
        208 => {
            state.new_nbytes = operand as usize;
            Ok(())
        }
        221 => {
            state.data_not_present_count = operand as usize;
            Ok(())
        }
        222 | 223 | 224 | 225 | 232 => {
            if operand == 0 {
                state.bitmap_state = BitmapState::Indicator;
                state.mark_back_reference_boundary();
                policy.process_constant(state, DecodedDescriptor::Operator(op), 0)?;
                if op.operator_code() == 222 {
                    state.qa_status = QaStatus::Waiting;
                }
                Ok(())
            } else {
                process_marker(policy, state, op.id)
            }
        }
        235 => {
            state.cancel_all_back_references();
            Ok(())
        }
        236 => policy.process_constant(state, DecodedDescriptor::Operator(op), 0),
        237 => {
            if operand == 0 {
                state.recall_bitmap()?;
            } else {
                state.cancel_reusable_bitmap();
            }
            policy.process_constant(state, DecodedDescriptor::Operator(op), 0)
        }
        _ => Err(BufrError::Unsupported(format!("operator {op}"))),
    }
}

/// Processes a marker value (223255, 224255, 225255, 232255): the next
/// bitmapped candidate supplies the packing, difference statistics widen it.
pub(crate) fn process_marker<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    marker_id: u32,
) -> Result<(), BufrError> {
    let (target, element) = state.next_bitmapped()?;
    state.link_bitmap(target);

    let (nbits, scale, refval) = if marker_id == 225_255 {
        (element.nbits + 1, element.scale, -(1i64 << element.nbits))
    } else {
        (element.nbits, element.scale, element.refval)
    };
    let descriptor = DecodedDescriptor::Marker {
        element: element.clone(),
        marker_id,
        nbits,
        scale,
        refval,
    };
    match element.kind() {
        ElementKind::String => policy.process_string(state, descriptor, nbits / 8),
        ElementKind::CodeTable | ElementKind::FlagTable => {
            policy.process_codeflag(state, descriptor, nbits)
        }
        ElementKind::Numeric => {
            let (eff_nbits, eff_scale, eff_refval) =
                effective_packing(state, element.id, nbits, scale, refval)?;
            // The difference-statistics reference overrides any 203 table
            // entry for the element.
            let eff_refval = if marker_id == 225_255 {
                refval * state.bsr.refval_factor
            } else {
                eff_refval
            };
            policy.process_numeric(state, descriptor, eff_nbits, eff_scale, eff_refval)
        }
    }
}

/// Advances the bitmap definition state machine by one observed descriptor.
fn bitmap_definition_step<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    id: u32,
) -> Result<(), BufrError> {
    match state.bitmap_state {
        BitmapState::Inactive => {}
        BitmapState::Indicator => match id {
            236_000 => {
                state.bitmap_for_reuse = true;
                state.bitmap_state = BitmapState::WaitingForBit;
                state.n_031031 = 0;
            }
            237_000 => {
                state.bitmap_state = BitmapState::Inactive;
            }
            _ => {
                state.bitmap_for_reuse = false;
                state.bitmap_state = BitmapState::WaitingForBit;
                state.n_031031 = 0;
            }
        },
        BitmapState::WaitingForBit => {
            if id == 31031 {
                state.bitmap_state = BitmapState::Counting;
                state.n_031031 = 1;
            }
        }
        BitmapState::Counting => {
            if id == 31031 {
                state.n_031031 += 1;
            } else {
                trace!(nbits = state.n_031031, "bitmap defined");
                policy.define_bitmap(state, state.bitmap_for_reuse)?;
                state.bitmap_state = BitmapState::Inactive;
            }
        }
    }
    Ok(())
}
