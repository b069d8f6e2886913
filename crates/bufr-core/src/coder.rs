//! Mutable state of one template walk.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bufr_tables::{ElementDescriptor, OperatorDescriptor};

use crate::error::BufrError;
use crate::values::Value;

/// Marker operator ids and their display prefixes.
pub(crate) fn marker_prefix(marker_id: u32) -> char {
    match marker_id {
        223_255 => 'T',
        224_255 => 'F',
        225_255 => 'D',
        232_255 => 'R',
        _ => 'M',
    }
}

/// A descriptor as it was actually visited, one entry per value slot in the
/// flat decode order.
///
/// Elements keep their Table B entry; the derived kinds carry the width they
/// were read with. Markers additionally carry the effective packing, which
/// differs from the underlying element for difference statistics (width + 1,
/// reference −2^width).
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedDescriptor {
    Element(Arc<ElementDescriptor>),
    Marker {
        element: Arc<ElementDescriptor>,
        marker_id: u32,
        nbits: usize,
        scale: i32,
        refval: i64,
    },
    Associated { id: u32, nbits: usize },
    SkippedLocal { id: u32, nbits: usize },
    Operator(OperatorDescriptor),
}

impl DecodedDescriptor {
    pub fn id(&self) -> u32 {
        match self {
            DecodedDescriptor::Element(e) => e.id,
            DecodedDescriptor::Marker { element, .. } => element.id,
            DecodedDescriptor::Associated { id, .. } => *id,
            DecodedDescriptor::SkippedLocal { id, .. } => *id,
            DecodedDescriptor::Operator(o) => o.id,
        }
    }

    /// A plain element, the only kind a bitmap may reference.
    pub fn as_plain_element(&self) -> Option<&Arc<ElementDescriptor>> {
        match self {
            DecodedDescriptor::Element(e) => Some(e),
            _ => None,
        }
    }

    /// The element entry behind this descriptor, when there is one.
    pub fn element(&self) -> Option<&Arc<ElementDescriptor>> {
        match self {
            DecodedDescriptor::Element(e) => Some(e),
            DecodedDescriptor::Marker { element, .. } => Some(element),
            _ => None,
        }
    }
}

impl fmt::Display for DecodedDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedDescriptor::Element(e) => write!(f, "{:06}", e.id),
            DecodedDescriptor::Marker {
                element, marker_id, ..
            } => write!(f, "{}{:05}", marker_prefix(*marker_id), element.id),
            DecodedDescriptor::Associated { id, .. } => write!(f, "A{:05}", id % 100_000),
            DecodedDescriptor::SkippedLocal { id, .. } => write!(f, "S{:05}", id % 100_000),
            DecodedDescriptor::Operator(o) => write!(f, "{:06}", o.id),
        }
    }
}

/// Width, scale and reference modifiers set by operator 207.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BsrModifier {
    pub nbits_increment: i32,
    pub scale_increment: i32,
    pub refval_factor: i64,
}

impl Default for BsrModifier {
    fn default() -> Self {
        Self {
            nbits_increment: 0,
            scale_increment: 0,
            refval_factor: 1,
        }
    }
}

/// Stage of a bitmap definition block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitmapState {
    #[default]
    Inactive,
    /// Right after 222000/223000/..., waiting for 236000/237000 or a direct
    /// definition.
    Indicator,
    /// Waiting for the first 031031.
    WaitingForBit,
    /// Counting a run of 031031 bits.
    Counting,
}

/// Stage of the quality-information (222000) state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QaStatus {
    #[default]
    Inactive,
    /// After 222000; the first class 33 element starts attachment.
    Waiting,
    /// Class 33 elements are being linked through the bitmap.
    Processing,
}

/// The state of one coder run.
///
/// A fresh state is created per message, so one decoder or encoder instance
/// can run any number of messages. For compressed data the descriptor list
/// and bitmap links are shared by all subsets and stored once; the value
/// lists are always per subset.
#[derive(Debug)]
pub struct CoderState {
    pub is_compressed: bool,
    pub n_subsets: usize,
    pub idx_subset: usize,

    pub descriptors_all_subsets: Vec<Vec<DecodedDescriptor>>,
    pub values_all_subsets: Vec<Vec<Value>>,
    pub bitmap_links_all_subsets: Vec<HashMap<usize, usize>>,

    /// Value cursor within the current subset, used by the encode policy.
    pub idx_value: usize,

    pub nbits_offset: i32,
    pub scale_offset: i32,

    pub nbits_of_new_refval: usize,
    pub new_refvals: HashMap<u32, i64>,

    pub nbits_of_associated: Vec<usize>,
    /// Set right after a non-zero 204; the next element must be 031021.
    pub expecting_assoc_significance: bool,

    pub nbits_of_skipped_local: usize,
    pub bsr: BsrModifier,
    pub new_nbytes: usize,
    pub data_not_present_count: usize,

    pub qa_status: QaStatus,

    pub bitmap_state: BitmapState,
    pub bitmap_for_reuse: bool,
    pub n_031031: usize,
    /// The most recently defined reusable bitmap.
    pub reusable_bitmap: Option<Vec<u8>>,

    /// Flat index from which candidate counting walks backwards.
    pub back_reference_boundary: usize,
    back_referenced: Option<Vec<(usize, Arc<ElementDescriptor>)>>,
    bitmapped: Option<Vec<(usize, Arc<ElementDescriptor>)>>,
    bitmap_cursor: usize,

    /// Descriptor ids from the template root to the current member.
    pub trail: Vec<u32>,
}

impl CoderState {
    /// Creates a state for a decode run (empty value lists) or an encode run
    /// (`values_all_subsets` pre-populated from the input tree).
    pub fn new(
        is_compressed: bool,
        n_subsets: usize,
        values_all_subsets: Option<Vec<Vec<Value>>>,
    ) -> Self {
        let n_descriptor_lists = if is_compressed { 1 } else { n_subsets };
        Self {
            is_compressed,
            n_subsets,
            idx_subset: 0,
            descriptors_all_subsets: vec![Vec::new(); n_descriptor_lists],
            values_all_subsets: values_all_subsets
                .unwrap_or_else(|| vec![Vec::new(); n_subsets]),
            bitmap_links_all_subsets: vec![HashMap::new(); n_descriptor_lists],
            idx_value: 0,
            nbits_offset: 0,
            scale_offset: 0,
            nbits_of_new_refval: 0,
            new_refvals: HashMap::new(),
            nbits_of_associated: Vec::new(),
            expecting_assoc_significance: false,
            nbits_of_skipped_local: 0,
            bsr: BsrModifier::default(),
            new_nbytes: 0,
            data_not_present_count: 0,
            qa_status: QaStatus::default(),
            bitmap_state: BitmapState::default(),
            bitmap_for_reuse: false,
            n_031031: 0,
            reusable_bitmap: None,
            back_reference_boundary: 0,
            back_referenced: None,
            bitmapped: None,
            bitmap_cursor: 0,
            trail: Vec::new(),
        }
    }

    /// Switches to another subset. Only meaningful for uncompressed data;
    /// reference values, bitmaps and back references defined in a previous
    /// subset do not carry over.
    pub fn switch_subset_context(&mut self, idx_subset: usize) {
        self.idx_subset = idx_subset;
        self.idx_value = 0;
        self.new_refvals.clear();
        self.cancel_all_back_references();
        self.bitmap_state = BitmapState::Inactive;
        self.bitmap_for_reuse = false;
        self.n_031031 = 0;
        self.back_reference_boundary = 0;
    }

    fn descriptor_list_index(&self) -> usize {
        if self.is_compressed {
            0
        } else {
            self.idx_subset
        }
    }

    /// The descriptor list of the current subset.
    pub fn descriptors(&self) -> &Vec<DecodedDescriptor> {
        &self.descriptors_all_subsets[self.descriptor_list_index()]
    }

    /// Number of flat entries emitted so far in the current subset.
    pub fn flat_len(&self) -> usize {
        self.descriptors().len()
    }

    /// Appends a flat descriptor entry.
    pub fn push_descriptor(&mut self, descriptor: DecodedDescriptor) {
        let idx = self.descriptor_list_index();
        self.descriptors_all_subsets[idx].push(descriptor);
    }

    /// The value list of the current subset.
    pub fn values(&self) -> &Vec<Value> {
        &self.values_all_subsets[self.idx_subset]
    }

    /// Appends a value to the current subset.
    pub fn push_value(&mut self, value: Value) {
        self.values_all_subsets[self.idx_subset].push(value);
    }

    /// Appends one value per subset; used by the compressed leaf paths.
    pub fn push_value_all_subsets(&mut self, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.n_subsets);
        for (list, value) in self.values_all_subsets.iter_mut().zip(values) {
            list.push(value);
        }
    }

    /// Records a bitmap link: the flat entry about to be emitted refers to
    /// the candidate at `target`.
    pub fn link_bitmap(&mut self, target: usize) {
        let flat = self.flat_len();
        let idx = self.descriptor_list_index();
        self.bitmap_links_all_subsets[idx].insert(flat, target);
    }

    /// Marks the boundary from which back references count.
    pub fn mark_back_reference_boundary(&mut self) {
        self.back_reference_boundary = self.flat_len();
    }

    /// Drops all bitmap and back-reference state (operator 235000).
    pub fn cancel_all_back_references(&mut self) {
        self.back_referenced = None;
        self.bitmapped = None;
        self.bitmap_cursor = 0;
        self.reusable_bitmap = None;
        self.qa_status = QaStatus::Inactive;
    }

    /// Rewinds the bitmapped-descriptor cursor (operator 237000).
    pub fn recall_bitmap(&mut self) -> Result<(), BufrError> {
        if self.bitmapped.is_none() {
            return Err(BufrError::BitmapMismatch(
                "237000 recalls a bitmap but none has been defined".into(),
            ));
        }
        self.bitmap_cursor = 0;
        Ok(())
    }

    /// Forgets the most recent reusable bitmap (operator 237255).
    pub fn cancel_reusable_bitmap(&mut self) {
        if self.bitmap_for_reuse {
            self.reusable_bitmap = None;
        }
    }

    /// Builds the bitmapped-descriptor list from a freshly read bitmap.
    ///
    /// Candidates are plain element entries counted backwards from the back
    /// reference boundary, in emission order; the list length must equal the
    /// bitmap length. Bit value 0 selects a candidate.
    pub fn build_bitmapped_descriptors(&mut self, bitmap: &[u8]) -> Result<(), BufrError> {
        if self.back_referenced.is_none() {
            let descriptors = self.descriptors();
            let mut candidates = Vec::new();
            for idx in (0..self.back_reference_boundary).rev() {
                if let Some(element) = descriptors[idx].as_plain_element() {
                    candidates.push((idx, element.clone()));
                    if candidates.len() == bitmap.len() {
                        break;
                    }
                }
            }
            candidates.reverse();
            self.back_referenced = Some(candidates);
        }
        let candidates = self.back_referenced.as_deref().unwrap_or_default();
        if candidates.len() != bitmap.len() {
            return Err(BufrError::BitmapMismatch(format!(
                "bitmap has {} bits but only {} back-referenceable elements precede it",
                bitmap.len(),
                candidates.len()
            )));
        }
        self.bitmapped = Some(
            bitmap
                .iter()
                .zip(candidates.iter())
                .filter(|(bit, _)| **bit == 0)
                .map(|(_, entry)| entry.clone())
                .collect(),
        );
        self.bitmap_cursor = 0;
        Ok(())
    }

    /// Takes the next bitmapped candidate for a marker or QA attachment.
    pub fn next_bitmapped(&mut self) -> Result<(usize, Arc<ElementDescriptor>), BufrError> {
        let bitmapped = self.bitmapped.as_ref().ok_or_else(|| {
            BufrError::BitmapMismatch("marker value outside any bitmap".into())
        })?;
        let entry = bitmapped.get(self.bitmap_cursor).cloned().ok_or_else(|| {
            BufrError::BitmapMismatch(format!(
                "more marker values than the {} zero bits in the bitmap",
                bitmapped.len()
            ))
        })?;
        self.bitmap_cursor += 1;
        Ok(entry)
    }

    /// The sum of the active associated-field widths.
    pub fn associated_nbits(&self) -> usize {
        self.nbits_of_associated.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(id: u32, nbits: usize) -> Arc<ElementDescriptor> {
        Arc::new(ElementDescriptor {
            id,
            name: String::new(),
            unit: "Numeric".into(),
            scale: 0,
            refval: 0,
            nbits,
        })
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(
            DecodedDescriptor::Element(element(1001, 7)).to_string(),
            "001001"
        );
        assert_eq!(
            DecodedDescriptor::Associated { id: 12001, nbits: 8 }.to_string(),
            "A12001"
        );
        assert_eq!(
            DecodedDescriptor::SkippedLocal { id: 63250, nbits: 12 }.to_string(),
            "S63250"
        );
        let marker = DecodedDescriptor::Marker {
            element: element(12001, 12),
            marker_id: 224_255,
            nbits: 12,
            scale: 1,
            refval: 0,
        };
        assert_eq!(marker.to_string(), "F12001");
    }

    #[test]
    fn test_bitmap_resolution() {
        let mut state = CoderState::new(false, 1, None);
        for id in [1001, 1002, 12001] {
            state.push_descriptor(DecodedDescriptor::Element(element(id, 7)));
            state.push_value(Value::Int(1));
        }
        state.mark_back_reference_boundary();
        state.build_bitmapped_descriptors(&[0, 1, 0]).unwrap();
        let (idx, first) = state.next_bitmapped().unwrap();
        assert_eq!((idx, first.id), (0, 1001));
        let (idx, second) = state.next_bitmapped().unwrap();
        assert_eq!((idx, second.id), (2, 12001));
        assert!(matches!(
            state.next_bitmapped(),
            Err(BufrError::BitmapMismatch(_))
        ));
    }

    #[test]
    fn test_bitmap_cardinality_mismatch() {
        let mut state = CoderState::new(false, 1, None);
        state.push_descriptor(DecodedDescriptor::Element(element(1001, 7)));
        state.push_value(Value::Int(1));
        state.mark_back_reference_boundary();
        assert!(matches!(
            state.build_bitmapped_descriptors(&[0, 0, 1]),
            Err(BufrError::BitmapMismatch(_))
        ));
    }

    #[test]
    fn test_recall_without_definition() {
        let mut state = CoderState::new(false, 1, None);
        assert!(state.recall_bitmap().is_err());
    }
}
