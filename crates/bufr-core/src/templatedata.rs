//! The decoded data tree and the wiring pass.
//!
//! A template walk produces flat per-subset lists of descriptors and values.
//! Wiring folds those lists into a hierarchical arena tree: sequences and
//! replications own their children, associated fields and bitmapped marker
//! values hang off their owner elements as attributes. Wiring is pure; it
//! never re-reads bits, and encoding consumes the flat lists, so the wired
//! view is presentation only.

use std::collections::HashMap;
use std::sync::Arc;

use bufr_tables::{BufrTemplate, Descriptor, ElementDescriptor};

use crate::coder::DecodedDescriptor;
use crate::error::BufrError;
use crate::values::Value;

/// Attribute kinds a node can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrKind {
    /// Associated field bits preceding an element (204).
    Associated,
    /// The significance node giving an attribute its meaning (031021,
    /// 008023, 008024).
    Meaning,
    /// Class 33 quality information attached through a 222000 bitmap.
    QualityInfo,
    /// Substituted value (223255).
    Substitution,
    /// First-order statistic (224255).
    FirstOrderStats,
    /// Difference statistic (225255).
    DifferenceStats,
    /// Replaced/retained value (232255).
    Replacement,
}

/// Index of a node in its [`NodeArena`].
pub type NodeId = usize;

/// Structural kind of a wired node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Carries a slot in the flat value lists.
    Value,
    /// Occupies template structure without a value (most operators, skipped
    /// elements under 221).
    NoValue,
    Sequence,
    FixedReplication,
    DelayedReplication,
}

/// One node of the wired tree.
#[derive(Debug, Clone)]
pub struct WiredNode {
    pub descriptor_id: u32,
    pub kind: NodeKind,
    /// Index into the flat descriptor/value lists, for value nodes.
    pub flat_index: Option<usize>,
    /// Child nodes of sequences and replications. Replication children are
    /// stored repetition after repetition, `group_size` nodes each.
    pub members: Vec<NodeId>,
    /// Nodes per repetition of a replication node.
    pub group_size: usize,
    /// The delayed replication factor node.
    pub factor: Option<NodeId>,
    pub attributes: Vec<(AttrKind, NodeId)>,
}

impl WiredNode {
    fn new(descriptor_id: u32, kind: NodeKind) -> Self {
        Self {
            descriptor_id,
            kind,
            flat_index: None,
            members: Vec::new(),
            group_size: 0,
            factor: None,
            attributes: Vec::new(),
        }
    }
}

/// Flat storage of wired nodes.
#[derive(Debug, Default, Clone)]
pub struct NodeArena {
    nodes: Vec<WiredNode>,
}

impl NodeArena {
    fn add(&mut self, node: WiredNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn get(&self, id: NodeId) -> &WiredNode {
        &self.nodes[id]
    }

    fn get_mut(&mut self, id: NodeId) -> &mut WiredNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The wired view: one root list per subset (a single shared list for
/// compressed data).
#[derive(Debug, Clone)]
pub struct Wired {
    pub arena: NodeArena,
    pub roots_all_subsets: Vec<Vec<NodeId>>,
}

/// Data decoded from (or to be encoded into) section 4.
#[derive(Debug, Clone)]
pub struct TemplateData {
    template: BufrTemplate,
    is_compressed: bool,
    n_subsets: usize,
    descriptors_all_subsets: Vec<Vec<DecodedDescriptor>>,
    values_all_subsets: Vec<Vec<Value>>,
    bitmap_links_all_subsets: Vec<HashMap<usize, usize>>,
    wired: Option<Wired>,
}

impl TemplateData {
    pub fn new(
        template: BufrTemplate,
        is_compressed: bool,
        n_subsets: usize,
        descriptors_all_subsets: Vec<Vec<DecodedDescriptor>>,
        values_all_subsets: Vec<Vec<Value>>,
        bitmap_links_all_subsets: Vec<HashMap<usize, usize>>,
    ) -> Self {
        Self {
            template,
            is_compressed,
            n_subsets,
            descriptors_all_subsets,
            values_all_subsets,
            bitmap_links_all_subsets,
            wired: None,
        }
    }

    /// Data carrying only flat values, as encoder input. The template and
    /// descriptor lists are resolved by the encoder from section 3.
    pub fn from_values(
        is_compressed: bool,
        n_subsets: usize,
        values_all_subsets: Vec<Vec<Value>>,
    ) -> Self {
        let n_lists = if is_compressed { 1 } else { n_subsets };
        Self::new(
            BufrTemplate::new(Vec::new()),
            is_compressed,
            n_subsets,
            vec![Vec::new(); n_lists],
            values_all_subsets,
            vec![HashMap::new(); n_lists],
        )
    }

    pub fn template(&self) -> &BufrTemplate {
        &self.template
    }

    pub fn is_compressed(&self) -> bool {
        self.is_compressed
    }

    pub fn n_subsets(&self) -> usize {
        self.n_subsets
    }

    fn descriptor_list_index(&self, idx_subset: usize) -> usize {
        if self.is_compressed {
            0
        } else {
            idx_subset
        }
    }

    /// Flat descriptor list of one subset.
    pub fn descriptors(&self, idx_subset: usize) -> &[DecodedDescriptor] {
        &self.descriptors_all_subsets[self.descriptor_list_index(idx_subset)]
    }

    /// Flat value list of one subset.
    pub fn values(&self, idx_subset: usize) -> &[Value] {
        &self.values_all_subsets[idx_subset]
    }

    /// All flat value lists, one per subset.
    pub fn values_all_subsets(&self) -> &[Vec<Value>] {
        &self.values_all_subsets
    }

    pub fn bitmap_links(&self, idx_subset: usize) -> &HashMap<usize, usize> {
        &self.bitmap_links_all_subsets[self.descriptor_list_index(idx_subset)]
    }

    /// The wired tree, when [`TemplateData::wire`] has run.
    pub fn wired(&self) -> Option<&Wired> {
        self.wired.as_ref()
    }

    /// Builds the hierarchical view. Wiring more than once is a no-op.
    pub fn wire(&mut self) -> Result<(), BufrError> {
        if self.wired.is_some() {
            return Ok(());
        }
        let mut arena = NodeArena::default();
        let n_lists = if self.is_compressed { 1 } else { self.n_subsets };
        let members = &self.template.members;
        let mut roots_all_subsets = Vec::with_capacity(n_lists);
        for idx_subset in 0..n_lists {
            let list_index = if self.is_compressed { 0 } else { idx_subset };
            let mut wirer = Wirer {
                descriptors: &self.descriptors_all_subsets[list_index],
                values: &self.values_all_subsets[idx_subset],
                bitmap_links: &self.bitmap_links_all_subsets[list_index],
                arena: &mut arena,
                next_index: 0,
                index_to_node: HashMap::new(),
                n_active_associated: 0,
                data_not_present_count: 0,
                waiting_qa_meaning: false,
                waiting_first_order_meaning: false,
                waiting_difference_meaning: false,
                associated_meaning: None,
                first_order_meaning: None,
                difference_meaning: None,
            };
            let mut roots = Vec::new();
            wirer.wire_members(members, &mut roots)?;
            roots_all_subsets.push(roots);
        }
        self.wired = Some(Wired {
            arena,
            roots_all_subsets,
        });
        Ok(())
    }
}

struct Wirer<'t> {
    descriptors: &'t [DecodedDescriptor],
    values: &'t [Value],
    bitmap_links: &'t HashMap<usize, usize>,
    arena: &'t mut NodeArena,
    next_index: usize,
    index_to_node: HashMap<usize, NodeId>,
    n_active_associated: usize,
    data_not_present_count: usize,
    waiting_qa_meaning: bool,
    waiting_first_order_meaning: bool,
    waiting_difference_meaning: bool,
    associated_meaning: Option<NodeId>,
    first_order_meaning: Option<NodeId>,
    difference_meaning: Option<NodeId>,
}

impl Wirer<'_> {
    fn take_index(&mut self) -> Result<usize, BufrError> {
        if self.next_index >= self.descriptors.len() {
            return Err(BufrError::ValidationFailed {
                expected: "a flat entry for every walked descriptor".into(),
                found: "end of decoded data".into(),
            });
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(index)
    }

    fn add_value_node(&mut self, out: Option<&mut Vec<NodeId>>) -> Result<NodeId, BufrError> {
        let index = self.take_index()?;
        let mut node = WiredNode::new(self.descriptors[index].id(), NodeKind::Value);
        node.flat_index = Some(index);
        let id = self.arena.add(node);
        self.index_to_node.insert(index, id);
        if let Some(out) = out {
            out.push(id);
        }
        Ok(id)
    }

    fn add_no_value_node(&mut self, descriptor_id: u32, out: &mut Vec<NodeId>) {
        let id = self.arena.add(WiredNode::new(descriptor_id, NodeKind::NoValue));
        out.push(id);
    }

    /// Attaches `node` to the element its bitmap bit points at.
    fn attach_through_bitmap(&mut self, node: NodeId, kind: AttrKind) -> Result<(), BufrError> {
        let flat_index = self.arena.get(node).flat_index.ok_or_else(|| {
            BufrError::BitmapMismatch("attribute node has no flat slot".into())
        })?;
        let target_flat = *self.bitmap_links.get(&flat_index).ok_or_else(|| {
            BufrError::BitmapMismatch(format!("no bitmap link for flat entry {flat_index}"))
        })?;
        let target = *self.index_to_node.get(&target_flat).ok_or_else(|| {
            BufrError::BitmapMismatch(format!("bitmap link target {target_flat} not wired"))
        })?;
        self.arena.get_mut(target).attributes.push((kind, node));
        Ok(())
    }

    fn wire_members(
        &mut self,
        members: &[Descriptor],
        out: &mut Vec<NodeId>,
    ) -> Result<(), BufrError> {
        for member in members {
            if self.data_not_present_count > 0 {
                self.data_not_present_count -= 1;
                if let Descriptor::Element(element) = member {
                    let x = element.class();
                    if !((1..=9).contains(&x) || x == 31) {
                        self.add_no_value_node(element.id, out);
                        continue;
                    }
                }
            }
            match member {
                Descriptor::Element(element) => self.wire_element(element, out)?,
                Descriptor::FixedReplication { id, members } => {
                    let n_repeats = (id % 1000) as usize;
                    let mut node = WiredNode::new(*id, NodeKind::FixedReplication);
                    node.group_size = members.len();
                    let mut kids = Vec::new();
                    for _ in 0..n_repeats {
                        self.wire_members(members, &mut kids)?;
                    }
                    node.members = kids;
                    out.push(self.arena.add(node));
                }
                Descriptor::DelayedReplication { id, members, .. } => {
                    let mut node = WiredNode::new(*id, NodeKind::DelayedReplication);
                    node.group_size = members.len();
                    let factor_flat = self.next_index;
                    let factor = self.add_value_node(None)?;
                    node.factor = Some(factor);
                    let n_repeats = match self.values.get(factor_flat) {
                        Some(Value::Int(v)) if *v >= 0 => *v as usize,
                        other => {
                            return Err(BufrError::Replication(format!(
                                "delayed replication factor must be a non-negative integer, got {}",
                                other.map_or_else(|| "nothing".into(), |v| v.to_string())
                            )))
                        }
                    };
                    let mut kids = Vec::new();
                    for _ in 0..n_repeats {
                        self.wire_members(members, &mut kids)?;
                    }
                    node.members = kids;
                    out.push(self.arena.add(node));
                }
                Descriptor::Operator(op) => self.wire_operator(op.id, out)?,
                // Reached only when a 206YYY turned the descriptor into a
                // skipped local entry.
                Descriptor::Undefined { .. } => {
                    self.add_value_node(Some(out))?;
                }
                Descriptor::Sequence(seq) => {
                    let mut node = WiredNode::new(seq.id, NodeKind::Sequence);
                    let mut kids = Vec::new();
                    self.wire_members(&seq.members, &mut kids)?;
                    node.members = kids;
                    out.push(self.arena.add(node));
                }
            }
        }
        Ok(())
    }

    fn wire_element(
        &mut self,
        element: &Arc<ElementDescriptor>,
        out: &mut Vec<NodeId>,
    ) -> Result<(), BufrError> {
        // A 206-skipped local stands in for whatever descriptor followed.
        if matches!(
            self.descriptors.get(self.next_index),
            Some(DecodedDescriptor::SkippedLocal { .. })
        ) {
            self.add_value_node(Some(out))?;
            return Ok(());
        }

        if self.n_active_associated > 0 && element.class() != 31 {
            let assoc = self.add_value_node(None)?;
            if let Some(meaning) = self.associated_meaning {
                self.arena.get_mut(assoc).attributes.push((AttrKind::Meaning, meaning));
            }
            let node = self.add_value_node(Some(out))?;
            self.arena.get_mut(node).attributes.push((AttrKind::Associated, assoc));
            return Ok(());
        }

        if element.class() == 33
            && self.waiting_qa_meaning
            && self.bitmap_links.contains_key(&self.next_index)
        {
            let node = self.add_value_node(Some(out))?;
            self.attach_through_bitmap(node, AttrKind::QualityInfo)?;
            return Ok(());
        }

        let node = self.add_value_node(Some(out))?;
        if element.id == 31021 && self.n_active_associated > 0 {
            self.associated_meaning = Some(node);
        } else if element.id == 8023 && self.waiting_first_order_meaning {
            self.first_order_meaning = Some(node);
            self.waiting_first_order_meaning = false;
        } else if element.id == 8024 && self.waiting_difference_meaning {
            self.difference_meaning = Some(node);
            self.waiting_difference_meaning = false;
        }
        Ok(())
    }

    fn wire_operator(&mut self, id: u32, out: &mut Vec<NodeId>) -> Result<(), BufrError> {
        let code = id / 1000;
        let operand = id % 1000;
        match code {
            201 | 202 | 203 | 206 | 207 | 208 => self.add_no_value_node(id, out),
            204 => {
                if operand == 0 {
                    self.n_active_associated = self.n_active_associated.saturating_sub(1);
                    if self.n_active_associated == 0 {
                        self.associated_meaning = None;
                    }
                } else {
                    self.n_active_associated += 1;
                }
                self.add_no_value_node(id, out);
            }
            205 | 236 | 237 => {
                self.add_value_node(Some(out))?;
            }
            221 => {
                self.data_not_present_count = operand as usize;
                self.add_no_value_node(id, out);
            }
            222 => {
                self.waiting_qa_meaning = true;
                self.add_value_node(Some(out))?;
            }
            223 => {
                self.waiting_qa_meaning = false;
                if operand == 0 {
                    self.add_value_node(Some(out))?;
                } else {
                    let node = self.add_value_node(Some(out))?;
                    self.attach_through_bitmap(node, AttrKind::Substitution)?;
                }
            }
            224 => {
                self.waiting_qa_meaning = false;
                if operand == 0 {
                    self.waiting_first_order_meaning = true;
                    self.add_value_node(Some(out))?;
                } else {
                    let node = self.add_value_node(Some(out))?;
                    if let Some(meaning) = self.first_order_meaning {
                        self.arena.get_mut(node).attributes.push((AttrKind::Meaning, meaning));
                    }
                    self.attach_through_bitmap(node, AttrKind::FirstOrderStats)?;
                }
            }
            225 => {
                self.waiting_qa_meaning = false;
                if operand == 0 {
                    self.waiting_difference_meaning = true;
                    self.add_value_node(Some(out))?;
                } else {
                    let node = self.add_value_node(Some(out))?;
                    if let Some(meaning) = self.difference_meaning {
                        self.arena.get_mut(node).attributes.push((AttrKind::Meaning, meaning));
                    }
                    self.attach_through_bitmap(node, AttrKind::DifferenceStats)?;
                }
            }
            232 => {
                self.waiting_qa_meaning = false;
                if operand == 0 {
                    self.add_value_node(Some(out))?;
                } else {
                    let node = self.add_value_node(Some(out))?;
                    self.attach_through_bitmap(node, AttrKind::Replacement)?;
                }
            }
            235 => {
                self.waiting_qa_meaning = false;
                self.add_no_value_node(id, out);
            }
            _ => {
                return Err(BufrError::Unsupported(format!("operator {id:06}")));
            }
        }
        Ok(())
    }
}
