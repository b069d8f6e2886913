//! Template compilation: a dry run of the operator state machine over a
//! template, recorded as an explicit instruction list.
//!
//! Replaying the instructions skips descriptor lookup and operator
//! interpretation; only delayed replication counts, bitmap contents and the
//! 203 reference-value table remain runtime decisions, and those run through
//! the same [`LeafPolicy`] hooks as the interpreted walk. Compilation is
//! conservative: any template the compiler cannot model statically reports
//! an error and the caller falls back to interpretation.

use std::collections::HashMap;
use std::sync::Arc;

use bufr_tables::{
    BufrTemplate, Descriptor, ElementDescriptor, ElementKind, OperatorDescriptor, TableGroupKey,
};
use tracing::debug;

use crate::coder::{BsrModifier, CoderState, DecodedDescriptor};
use crate::engine::{process_marker, LeafPolicy};
use crate::error::BufrError;

/// One pre-resolved leaf action or control point.
#[derive(Debug, Clone)]
pub(crate) enum Instr {
    Numeric {
        element: Arc<ElementDescriptor>,
        nbits: usize,
        scale: i32,
        refval: i64,
    },
    /// Numeric whose reference value comes from the runtime 203 table,
    /// falling back to the Table B value when nothing was captured.
    NumericNewRefval {
        element: Arc<ElementDescriptor>,
        nbits: usize,
        scale: i32,
        refval_factor: i64,
    },
    String {
        element: Arc<ElementDescriptor>,
        nbytes: usize,
    },
    OperatorString {
        op: OperatorDescriptor,
        nbytes: usize,
    },
    Codeflag {
        element: Arc<ElementDescriptor>,
        nbits: usize,
    },
    Associated {
        id: u32,
        nbits: usize,
    },
    SkippedLocal {
        id: u32,
        nbits: usize,
    },
    NewRefval {
        element: Arc<ElementDescriptor>,
        nbits: usize,
    },
    Constant {
        op: OperatorDescriptor,
        value: i64,
    },
    QaBitmapLink,
    MarkBackReferenceBoundary,
    DefineBitmap {
        reuse: bool,
    },
    RecallBitmap,
    CancelReusableBitmap,
    CancelAllBackReferences,
    Marker {
        marker_id: u32,
        nbits_offset: i32,
        scale_offset: i32,
        bsr: BsrModifier,
    },
    InitBitmapCount,
    IncrementBitmapCount,
    FixedLoop {
        n_repeats: usize,
        body: Vec<Instr>,
    },
    DelayedLoop {
        factor: Vec<Instr>,
        body: Vec<Instr>,
    },
}

/// A compiled template, replayable against any leaf policy.
#[derive(Debug)]
pub struct CompiledTemplate {
    instrs: Vec<Instr>,
}

impl CompiledTemplate {
    /// Replays the recorded actions for the current subset.
    pub fn run<P: LeafPolicy>(
        &self,
        policy: &mut P,
        state: &mut CoderState,
    ) -> Result<(), BufrError> {
        run_instrs(policy, state, &self.instrs)
    }
}

fn run_instrs<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    instrs: &[Instr],
) -> Result<(), BufrError> {
    for instr in instrs {
        run_instr(policy, state, instr)?;
    }
    Ok(())
}

fn run_instr<P: LeafPolicy>(
    policy: &mut P,
    state: &mut CoderState,
    instr: &Instr,
) -> Result<(), BufrError> {
    match instr {
        Instr::Numeric {
            element,
            nbits,
            scale,
            refval,
        } => policy.process_numeric(
            state,
            DecodedDescriptor::Element(element.clone()),
            *nbits,
            *scale,
            *refval,
        ),
        Instr::NumericNewRefval {
            element,
            nbits,
            scale,
            refval_factor,
        } => {
            let refval = state
                .new_refvals
                .get(&element.id)
                .copied()
                .unwrap_or(element.refval);
            policy.process_numeric(
                state,
                DecodedDescriptor::Element(element.clone()),
                *nbits,
                *scale,
                refval * refval_factor,
            )
        }
        Instr::String { element, nbytes } => {
            policy.process_string(state, DecodedDescriptor::Element(element.clone()), *nbytes)
        }
        Instr::OperatorString { op, nbytes } => {
            policy.process_string(state, DecodedDescriptor::Operator(*op), *nbytes)
        }
        Instr::Codeflag { element, nbits } => {
            policy.process_codeflag(state, DecodedDescriptor::Element(element.clone()), *nbits)
        }
        Instr::Associated { id, nbits } => policy.process_codeflag(
            state,
            DecodedDescriptor::Associated {
                id: *id,
                nbits: *nbits,
            },
            *nbits,
        ),
        Instr::SkippedLocal { id, nbits } => policy.process_codeflag(
            state,
            DecodedDescriptor::SkippedLocal {
                id: *id,
                nbits: *nbits,
            },
            *nbits,
        ),
        Instr::NewRefval { element, nbits } => {
            policy.process_new_refval(state, DecodedDescriptor::Element(element.clone()), *nbits)
        }
        Instr::Constant { op, value } => {
            policy.process_constant(state, DecodedDescriptor::Operator(*op), *value)
        }
        Instr::QaBitmapLink => {
            let (target, _) = state.next_bitmapped()?;
            state.link_bitmap(target);
            Ok(())
        }
        Instr::MarkBackReferenceBoundary => {
            state.mark_back_reference_boundary();
            Ok(())
        }
        Instr::DefineBitmap { reuse } => policy.define_bitmap(state, *reuse),
        Instr::RecallBitmap => state.recall_bitmap(),
        Instr::CancelReusableBitmap => {
            state.cancel_reusable_bitmap();
            Ok(())
        }
        Instr::CancelAllBackReferences => {
            state.cancel_all_back_references();
            Ok(())
        }
        Instr::Marker {
            marker_id,
            nbits_offset,
            scale_offset,
            bsr,
        } => {
            // Replay under the modifiers that were live at this point.
            let saved = (state.nbits_offset, state.scale_offset, state.bsr);
            state.nbits_offset = *nbits_offset;
            state.scale_offset = *scale_offset;
            state.bsr = *bsr;
            let result = process_marker(policy, state, *marker_id);
            (state.nbits_offset, state.scale_offset, state.bsr) = saved;
            result
        }
        Instr::InitBitmapCount => {
            state.n_031031 = 0;
            Ok(())
        }
        Instr::IncrementBitmapCount => {
            state.n_031031 += 1;
            Ok(())
        }
        Instr::FixedLoop { n_repeats, body } => {
            for _ in 0..*n_repeats {
                run_instrs(policy, state, body)?;
            }
            Ok(())
        }
        Instr::DelayedLoop { factor, body } => {
            run_instrs(policy, state, factor)?;
            let count = policy.delayed_factor(state)?;
            for _ in 0..count {
                run_instrs(policy, state, body)?;
            }
            Ok(())
        }
    }
}

/// Compile-time mirror of the operator state machine.
struct TemplateCompiler {
    out: Vec<Instr>,
    nbits_offset: i32,
    scale_offset: i32,
    nbits_new_refval: usize,
    refval_new_ids: Vec<u32>,
    nbits_of_associated: Vec<usize>,
    expecting_assoc_significance: bool,
    nbits_skipped_local: usize,
    bsr: BsrModifier,
    new_nbytes: usize,
    data_not_present_count: usize,
    qa_waiting: bool,
    qa_processing: bool,
    bitmap_stage: BitmapStage,
    bitmap_for_reuse: bool,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum BitmapStage {
    Inactive,
    Indicator,
    WaitingForBit,
    Counting,
}

impl TemplateCompiler {
    fn new() -> Self {
        Self {
            out: Vec::new(),
            nbits_offset: 0,
            scale_offset: 0,
            nbits_new_refval: 0,
            refval_new_ids: Vec::new(),
            nbits_of_associated: Vec::new(),
            expecting_assoc_significance: false,
            nbits_skipped_local: 0,
            bsr: BsrModifier::default(),
            new_nbytes: 0,
            data_not_present_count: 0,
            qa_waiting: false,
            qa_processing: false,
            bitmap_stage: BitmapStage::Inactive,
            bitmap_for_reuse: false,
        }
    }

    fn emit(&mut self, instr: Instr) {
        self.out.push(instr);
    }

    /// Compiles `members` into a fresh instruction block.
    fn compile_block(&mut self, members: &[Descriptor]) -> Result<Vec<Instr>, BufrError> {
        let saved = std::mem::take(&mut self.out);
        self.compile_members(members)?;
        Ok(std::mem::replace(&mut self.out, saved))
    }

    fn compile(mut self, template: &BufrTemplate) -> Result<CompiledTemplate, BufrError> {
        self.compile_members(&template.members)?;
        if !self.nbits_of_associated.is_empty() {
            return Err(BufrError::UnbalancedOperator(
                "unmatched 204YYY at end of template".into(),
            ));
        }
        Ok(CompiledTemplate { instrs: self.out })
    }

    fn compile_members(&mut self, members: &[Descriptor]) -> Result<(), BufrError> {
        for member in members {
            if self.data_not_present_count > 0 {
                self.data_not_present_count -= 1;
                if let Descriptor::Element(element) = member {
                    let x = element.class();
                    if !((1..=9).contains(&x) || x == 31) {
                        continue;
                    }
                }
            }

            if self.nbits_new_refval > 0 {
                if let Descriptor::Element(element) = member {
                    self.compile_new_refval(element)?;
                    continue;
                }
            }

            if self.nbits_skipped_local > 0 {
                let nbits = std::mem::take(&mut self.nbits_skipped_local);
                self.emit(Instr::SkippedLocal {
                    id: member.id(),
                    nbits,
                });
                continue;
            }

            if self.bitmap_stage != BitmapStage::Inactive {
                self.compile_bitmap_definition(member.id());
            }

            match member {
                Descriptor::Element(element) => self.compile_element(element)?,
                Descriptor::FixedReplication { members, .. } => {
                    // A 221 count crossing into the repeated body cannot be
                    // resolved statically.
                    if self.data_not_present_count > 0 {
                        return Err(BufrError::Unsupported(
                            "221YYY spanning a replication".into(),
                        ));
                    }
                    let body = self.compile_block(members)?;
                    self.emit(Instr::FixedLoop {
                        n_repeats: member.n_repeats(),
                        body,
                    });
                }
                Descriptor::DelayedReplication {
                    factor, members, ..
                } => {
                    if factor.id == 31011 || factor.id == 31012 {
                        return Err(BufrError::Unsupported(
                            "delayed repetition factors 031011/031012".into(),
                        ));
                    }
                    if self.data_not_present_count > 0 {
                        return Err(BufrError::Unsupported(
                            "221YYY spanning a replication".into(),
                        ));
                    }
                    let saved = std::mem::take(&mut self.out);
                    self.compile_element(factor)?;
                    let factor_instrs = std::mem::replace(&mut self.out, saved);
                    let body = self.compile_block(members)?;
                    self.emit(Instr::DelayedLoop {
                        factor: factor_instrs,
                        body,
                    });
                }
                Descriptor::Operator(op) => self.compile_operator(*op)?,
                Descriptor::Sequence(seq) => self.compile_members(&seq.members)?,
                Descriptor::Undefined { id } => {
                    return Err(BufrError::Tables(
                        bufr_tables::TablesError::UnknownDescriptor(*id),
                    ))
                }
            }
        }
        Ok(())
    }

    fn compile_element(&mut self, element: &Arc<ElementDescriptor>) -> Result<(), BufrError> {
        let x = element.class();

        if self.expecting_assoc_significance {
            if element.id == 31021 {
                self.expecting_assoc_significance = false;
            } else {
                return Err(BufrError::UnbalancedOperator(format!(
                    "204YYY must be followed by 031021, found {:06}",
                    element.id
                )));
            }
        }

        if !self.nbits_of_associated.is_empty() && x != 31 {
            let nbits = self.nbits_of_associated.iter().sum();
            self.emit(Instr::Associated {
                id: element.id,
                nbits,
            });
        }

        if x == 33 {
            if self.qa_waiting {
                self.qa_waiting = false;
                self.qa_processing = true;
            }
            if self.qa_processing {
                self.emit(Instr::QaBitmapLink);
            }
        } else {
            self.qa_processing = false;
        }

        match element.kind() {
            ElementKind::String => {
                let nbytes = if self.new_nbytes != 0 {
                    std::mem::take(&mut self.new_nbytes)
                } else {
                    element.nbits / 8
                };
                self.emit(Instr::String {
                    element: element.clone(),
                    nbytes,
                });
            }
            ElementKind::CodeTable | ElementKind::FlagTable => {
                self.emit(Instr::Codeflag {
                    element: element.clone(),
                    nbits: element.nbits,
                });
            }
            ElementKind::Numeric => {
                if x == 31 {
                    self.emit(Instr::Numeric {
                        element: element.clone(),
                        nbits: element.nbits,
                        scale: element.scale,
                        refval: element.refval,
                    });
                    return Ok(());
                }
                let eff_nbits =
                    element.nbits as i32 + self.nbits_offset + self.bsr.nbits_increment;
                if !(1..=64).contains(&eff_nbits) {
                    return Err(BufrError::UnbalancedOperator(format!(
                        "operators make the width of {:06} {eff_nbits} bits",
                        element.id
                    )));
                }
                let scale = element.scale + self.scale_offset + self.bsr.scale_increment;
                if self.refval_new_ids.contains(&element.id) {
                    self.emit(Instr::NumericNewRefval {
                        element: element.clone(),
                        nbits: eff_nbits as usize,
                        scale,
                        refval_factor: self.bsr.refval_factor,
                    });
                } else {
                    self.emit(Instr::Numeric {
                        element: element.clone(),
                        nbits: eff_nbits as usize,
                        scale,
                        refval: element.refval * self.bsr.refval_factor,
                    });
                }
            }
        }
        Ok(())
    }

    fn compile_new_refval(&mut self, element: &Arc<ElementDescriptor>) -> Result<(), BufrError> {
        if element.kind() == ElementKind::String {
            return Err(BufrError::UnbalancedOperator(format!(
                "203YYY cannot define a reference value for string element {:06}",
                element.id
            )));
        }
        if !self.nbits_of_associated.is_empty() && element.class() != 31 {
            let nbits = self.nbits_of_associated.iter().sum();
            self.emit(Instr::Associated {
                id: element.id,
                nbits,
            });
        }
        self.refval_new_ids.push(element.id);
        self.emit(Instr::NewRefval {
            element: element.clone(),
            nbits: self.nbits_new_refval,
        });
        Ok(())
    }

    fn compile_operator(&mut self, op: OperatorDescriptor) -> Result<(), BufrError> {
        let operand = op.operand();
        match op.operator_code() {
            201 => {
                self.nbits_offset = if operand != 0 { operand as i32 - 128 } else { 0 };
            }
            202 => {
                self.scale_offset = if operand != 0 { operand as i32 - 128 } else { 0 };
            }
            203 => {
                if operand == 255 {
                    self.nbits_new_refval = 0;
                } else {
                    self.nbits_new_refval = operand as usize;
                    if operand == 0 {
                        self.refval_new_ids.clear();
                    }
                }
            }
            204 => {
                if operand == 0 {
                    self.nbits_of_associated.pop().ok_or_else(|| {
                        BufrError::UnbalancedOperator("204000 without an open 204YYY".into())
                    })?;
                } else {
                    self.nbits_of_associated.push(operand as usize);
                    self.expecting_assoc_significance = true;
                }
            }
            205 => {
                self.emit(Instr::OperatorString {
                    op,
                    nbytes: operand as usize,
                });
            }
            206 => {
                self.nbits_skipped_local = operand as usize;
            }
            207 => {
                self.bsr = if operand == 0 {
                    BsrModifier::default()
                } else {
                    BsrModifier {
                        nbits_increment: (10 * operand as i32 + 2) / 3,
                        scale_increment: operand as i32,
                        refval_factor: 10i64.pow(operand),
                    }
                };
            }
            208 => {
                self.new_nbytes = operand as usize;
            }
            221 => {
                self.data_not_present_count = operand as usize;
            }
            222 | 223 | 224 | 225 | 232 => {
                if operand == 0 {
                    self.bitmap_stage = BitmapStage::Indicator;
                    self.emit(Instr::MarkBackReferenceBoundary);
                    self.emit(Instr::Constant { op, value: 0 });
                    if op.operator_code() == 222 {
                        self.qa_waiting = true;
                    }
                } else {
                    self.emit(Instr::Marker {
                        marker_id: op.id,
                        nbits_offset: self.nbits_offset,
                        scale_offset: self.scale_offset,
                        bsr: self.bsr,
                    });
                }
            }
            235 => {
                self.emit(Instr::CancelAllBackReferences);
                self.qa_waiting = false;
                self.qa_processing = false;
            }
            236 => {
                self.emit(Instr::Constant { op, value: 0 });
            }
            237 => {
                if operand == 0 {
                    self.emit(Instr::RecallBitmap);
                } else {
                    self.emit(Instr::CancelReusableBitmap);
                }
                self.emit(Instr::Constant { op, value: 0 });
            }
            _ => {
                return Err(BufrError::Unsupported(format!("operator {op}")));
            }
        }
        Ok(())
    }

    fn compile_bitmap_definition(&mut self, id: u32) {
        match self.bitmap_stage {
            BitmapStage::Inactive => {}
            BitmapStage::Indicator => match id {
                236_000 => {
                    self.bitmap_for_reuse = true;
                    self.bitmap_stage = BitmapStage::WaitingForBit;
                    self.emit(Instr::InitBitmapCount);
                }
                237_000 => {
                    self.bitmap_stage = BitmapStage::Inactive;
                }
                _ => {
                    self.bitmap_for_reuse = false;
                    self.bitmap_stage = BitmapStage::WaitingForBit;
                    self.emit(Instr::InitBitmapCount);
                }
            },
            BitmapStage::WaitingForBit => {
                if id == 31031 {
                    self.bitmap_stage = BitmapStage::Counting;
                    self.emit(Instr::IncrementBitmapCount);
                }
            }
            BitmapStage::Counting => {
                if id == 31031 {
                    self.emit(Instr::IncrementBitmapCount);
                } else {
                    self.emit(Instr::DefineBitmap {
                        reuse: self.bitmap_for_reuse,
                    });
                    self.bitmap_stage = BitmapStage::Inactive;
                }
            }
        }
    }
}

/// Compiles a template.
pub fn compile_template(template: &BufrTemplate) -> Result<CompiledTemplate, BufrError> {
    TemplateCompiler::new().compile(template)
}

/// Bounded cache of compiled templates keyed by the raw descriptor ids and
/// the table-group key.
pub struct CompiledTemplateManager {
    cache: HashMap<(Vec<u32>, TableGroupKey), Arc<CompiledTemplate>>,
    max_entries: usize,
}

impl CompiledTemplateManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns the compiled form, compiling on first sight. `None` means the
    /// template is outside the compiler's static model and the caller must
    /// interpret it.
    pub fn get_or_compile(
        &mut self,
        template: &BufrTemplate,
        key: TableGroupKey,
    ) -> Option<Arc<CompiledTemplate>> {
        let cache_key = (template.flat_ids(), key);
        if let Some(compiled) = self.cache.get(&cache_key) {
            return Some(compiled.clone());
        }
        match compile_template(template) {
            Ok(compiled) => {
                let compiled = Arc::new(compiled);
                if self.cache.len() >= self.max_entries {
                    if let Some(evict) = self.cache.keys().next().cloned() {
                        self.cache.remove(&evict);
                    }
                }
                self.cache.insert(cache_key, compiled.clone());
                Some(compiled)
            }
            Err(error) => {
                debug!(%error, "template not compilable, falling back to interpretation");
                None
            }
        }
    }
}
