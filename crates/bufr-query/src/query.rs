//! Query evaluation over the wired node tree.

use bufr_core::{BufrMessage, NodeArena, NodeId, NodeKind, TemplateData, Value, WiredNode};

use crate::path::{
    NodePath, NodePathParser, PathComponent, SEPARATOR_ATTRIB, SEPARATOR_CHILD,
};
use crate::PathError;

/// Values selected by a query, preserving replication nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValues {
    Value(Value),
    List(Vec<QueryValues>),
}

impl QueryValues {
    /// Flattens nested replication envelopes into a plain value list.
    pub fn flatten(&self) -> Vec<Value> {
        match self {
            QueryValues::Value(value) => vec![value.clone()],
            QueryValues::List(items) => items.iter().flat_map(|item| item.flatten()).collect(),
        }
    }
}

/// Per-subset query results.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub path_expr: String,
    pub n_subsets: usize,
    results: Vec<(usize, Vec<QueryValues>)>,
}

impl QueryResult {
    /// The subset indices that were queried.
    pub fn subset_indices(&self) -> Vec<usize> {
        self.results.iter().map(|(idx, _)| *idx).collect()
    }

    /// The selected values of one subset.
    pub fn values(&self, idx_subset: usize) -> Option<&[QueryValues]> {
        self.results
            .iter()
            .find(|(idx, _)| *idx == idx_subset)
            .map(|(_, values)| values.as_slice())
    }

    /// The selected values of one subset with nesting flattened away.
    pub fn flat_values(&self, idx_subset: usize) -> Vec<Value> {
        self.values(idx_subset)
            .map(|values| values.iter().flat_map(QueryValues::flatten).collect())
            .unwrap_or_default()
    }

    /// All subsets' flattened values, in subset order.
    pub fn all_flat_values(&self) -> Vec<Vec<Value>> {
        self.results
            .iter()
            .map(|(_, values)| values.iter().flat_map(QueryValues::flatten).collect())
            .collect()
    }
}

/// Matched nodes, grouped by replication envelopes.
#[derive(Debug, Clone)]
enum Matched {
    Node(NodeId),
    Group(Vec<Matched>),
}

/// Evaluates path expressions against decoded messages.
pub struct DataQuerent {
    parser: NodePathParser,
}

impl Default for DataQuerent {
    fn default() -> Self {
        Self::new()
    }
}

impl DataQuerent {
    pub fn new() -> Self {
        Self {
            parser: NodePathParser::new(),
        }
    }

    pub fn with_parser(parser: NodePathParser) -> Self {
        Self { parser }
    }

    /// Queries the data section of a wired message.
    pub fn query(&self, message: &BufrMessage, path_expr: &str) -> Result<QueryResult, PathError> {
        let path = self.parser.parse(path_expr)?;
        let data = message
            .template_data
            .as_ref()
            .ok_or_else(|| PathError::Query("message has no template data".into()))?;
        let wired = data
            .wired()
            .ok_or_else(|| PathError::Query("message is not wired".into()))?;

        let all_subsets: Vec<usize> = (0..data.n_subsets()).collect();
        let subset_indices = path.subset_index.apply(&all_subsets);

        let mut results = Vec::with_capacity(subset_indices.len());
        if data.is_compressed() {
            // One shared node list; values differ per subset.
            let subset = Subset::new(data, 0, &wired.arena, &wired.roots_all_subsets[0]);
            let matched = subset.evaluate(&path)?;
            for idx_subset in subset_indices {
                let subset = Subset::new(data, idx_subset, &wired.arena, &wired.roots_all_subsets[0]);
                results.push((idx_subset, subset.values_of(&matched)?));
            }
        } else {
            for idx_subset in subset_indices {
                let subset = Subset::new(
                    data,
                    idx_subset,
                    &wired.arena,
                    &wired.roots_all_subsets[idx_subset],
                );
                let matched = subset.evaluate(&path)?;
                results.push((idx_subset, subset.values_of(&matched)?));
            }
        }
        Ok(QueryResult {
            path_expr: path_expr.to_string(),
            n_subsets: data.n_subsets(),
            results,
        })
    }
}

struct Subset<'a> {
    data: &'a TemplateData,
    idx_subset: usize,
    arena: &'a NodeArena,
    roots: &'a [NodeId],
}

#[derive(Clone, Copy)]
enum Match {
    No,
    Yes,
    /// A composite node kept for descendant search.
    Keep,
}

impl<'a> Subset<'a> {
    fn new(
        data: &'a TemplateData,
        idx_subset: usize,
        arena: &'a NodeArena,
        roots: &'a [NodeId],
    ) -> Self {
        Self {
            data,
            idx_subset,
            arena,
            roots,
        }
    }

    fn node(&self, id: NodeId) -> &WiredNode {
        self.arena.get(id)
    }

    fn display(&self, id: NodeId) -> String {
        let node = self.node(id);
        match node.flat_index {
            Some(flat) => self.data.descriptors(self.idx_subset)[flat].to_string(),
            None => format!("{:06}", node.descriptor_id),
        }
    }

    fn is_composite(&self, id: NodeId) -> bool {
        let node = self.node(id);
        !node.members.is_empty() || !node.attributes.is_empty() || node.factor.is_some()
    }

    fn evaluate(&self, path: &NodePath) -> Result<Vec<Matched>, PathError> {
        if path.components.is_empty() {
            return Ok(Vec::new());
        }
        self.filter_root(&path.components)
    }

    /// Filters the template root, which behaves as a sequence of the
    /// top-level nodes.
    fn filter_root(&self, components: &[PathComponent]) -> Result<Vec<Matched>, PathError> {
        let component = &components[0];
        if component.separator == SEPARATOR_ATTRIB {
            return Err(PathError::Query("the template root has no attributes".into()));
        }
        let matched = self.filter_nodes(self.roots, component);
        let mut out = Vec::new();
        if component.separator == SEPARATOR_CHILD {
            out.extend(self.proceed(&matched, components)?);
        } else {
            out.extend(self.descend_and_proceed(self.roots, components)?);
        }
        Ok(out)
    }

    fn filter_sub_nodes(
        &self,
        node: NodeId,
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        match components[0].separator {
            SEPARATOR_CHILD => self.filter_child_sub_nodes(node, components),
            SEPARATOR_ATTRIB => self.filter_attribute_sub_nodes(node, components),
            _ => self.filter_descendant_sub_nodes(node, components),
        }
    }

    fn filter_child_sub_nodes(
        &self,
        node: NodeId,
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        let wired = self.node(node);
        if !matches!(
            wired.kind,
            NodeKind::Sequence | NodeKind::FixedReplication | NodeKind::DelayedReplication
        ) {
            return Err(PathError::Query(format!(
                "{} has no child nodes",
                self.display(node)
            )));
        }
        let component = &components[0];

        if matches!(
            wired.kind,
            NodeKind::FixedReplication | NodeKind::DelayedReplication
        ) {
            if wired.members.is_empty() {
                return Ok(Vec::new());
            }
            let group = wired.group_size.max(1);
            let matched_positions = self.filter_positions(&wired.members[..group.min(wired.members.len())], component);
            if matched_positions.is_empty() {
                return Ok(Vec::new());
            }
            let mut envelope = Vec::new();
            for chunk in wired.members.chunks(group) {
                let selected: Vec<NodeId> = matched_positions
                    .iter()
                    .filter_map(|pos| chunk.get(*pos).copied())
                    .collect();
                let sub_nodes = if component.separator == crate::path::SEPARATOR_DESCEND {
                    self.descend_and_proceed(&selected, components)?
                } else {
                    self.proceed(&selected, components)?
                };
                if !sub_nodes.is_empty() {
                    envelope.push(Matched::Group(sub_nodes));
                }
            }
            if envelope.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![Matched::Group(envelope)])
            }
        } else {
            let matched = self.filter_nodes(&wired.members, component);
            if matched.is_empty() {
                return Ok(Vec::new());
            }
            if component.separator == crate::path::SEPARATOR_DESCEND {
                self.descend_and_proceed(&matched, components)
            } else {
                self.proceed(&matched, components)
            }
        }
    }

    fn filter_attribute_sub_nodes(
        &self,
        node: NodeId,
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        let wired = self.node(node);
        let component = &components[0];
        let mut candidates: Vec<NodeId> = Vec::new();
        if let Some(factor) = wired.factor {
            candidates.push(factor);
        }
        candidates.extend(wired.attributes.iter().map(|(_, id)| *id));
        if candidates.is_empty() {
            return Err(PathError::Query(format!(
                "{} has no attribute nodes",
                self.display(node)
            )));
        }
        let matched = self.filter_nodes(&candidates, component);
        if matched.is_empty() {
            return Ok(Vec::new());
        }
        self.proceed(&matched, components)
    }

    fn filter_descendant_sub_nodes(
        &self,
        node: NodeId,
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        let wired = self.node(node);
        let mut out = Vec::new();
        if !wired.members.is_empty() {
            out.extend(self.filter_child_sub_nodes(node, components)?);
        }
        if !wired.attributes.is_empty() || wired.factor.is_some() {
            out.extend(self.filter_attribute_sub_nodes(node, components)?);
        }
        Ok(out)
    }

    fn descend_and_proceed(
        &self,
        nodes: &[NodeId],
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        let component = &components[0];
        let mut out = Vec::new();
        for node in nodes {
            match self.node_matches(*node, component) {
                Match::Keep => {
                    out.extend(self.filter_descendant_sub_nodes(*node, components)?);
                }
                Match::Yes => {
                    out.extend(self.proceed(&[*node], components)?);
                }
                Match::No => {}
            }
        }
        Ok(out)
    }

    fn proceed(
        &self,
        nodes: &[NodeId],
        components: &[PathComponent],
    ) -> Result<Vec<Matched>, PathError> {
        if components.len() > 1 {
            let mut out = Vec::new();
            for node in nodes {
                out.extend(self.filter_sub_nodes(*node, &components[1..])?);
            }
            Ok(out)
        } else {
            Ok(nodes.iter().copied().map(Matched::Node).collect())
        }
    }

    /// Filters `nodes` themselves (not their sub-nodes) by the component.
    fn filter_nodes(&self, nodes: &[NodeId], component: &PathComponent) -> Vec<NodeId> {
        let (matched, kept) = self.split_matches(nodes, component);
        let mut selected: Vec<NodeId> = component.index.apply(&matched);
        selected.extend(kept);
        // Keep emission order stable regardless of match kind.
        let mut with_order: Vec<(usize, NodeId)> = selected
            .into_iter()
            .map(|id| (nodes.iter().position(|n| *n == id).unwrap_or(usize::MAX), id))
            .collect();
        with_order.sort_by_key(|(pos, _)| *pos);
        with_order.into_iter().map(|(_, id)| id).collect()
    }

    /// Positions within a replication group that match the component.
    fn filter_positions(&self, nodes: &[NodeId], component: &PathComponent) -> Vec<usize> {
        let (matched, kept) = self.split_matches(nodes, component);
        let position_of =
            |id: &NodeId| nodes.iter().position(|n| n == id).unwrap_or(usize::MAX);
        let matched_positions: Vec<usize> = matched.iter().map(position_of).collect();
        let mut positions: Vec<usize> = component.index.apply(&matched_positions);
        positions.extend(kept.iter().map(position_of));
        positions.sort_unstable();
        positions
    }

    fn split_matches(
        &self,
        nodes: &[NodeId],
        component: &PathComponent,
    ) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut matched = Vec::new();
        let mut kept = Vec::new();
        for node in nodes {
            match self.node_matches(*node, component) {
                Match::Yes => matched.push(*node),
                Match::Keep => kept.push(*node),
                Match::No => {}
            }
        }
        (matched, kept)
    }

    fn node_matches(&self, node: NodeId, component: &PathComponent) -> Match {
        if self.display(node) == component.id {
            return Match::Yes;
        }
        if component.separator == crate::path::SEPARATOR_DESCEND && self.is_composite(node) {
            Match::Keep
        } else {
            Match::No
        }
    }

    fn values_of(&self, matched: &[Matched]) -> Result<Vec<QueryValues>, PathError> {
        matched
            .iter()
            .map(|entry| match entry {
                Matched::Node(id) => {
                    let node = self.node(*id);
                    let flat = node.flat_index.ok_or_else(|| {
                        PathError::Query(format!(
                            "cannot query valueless node {}",
                            self.display(*id)
                        ))
                    })?;
                    Ok(QueryValues::Value(
                        self.data.values(self.idx_subset)[flat].clone(),
                    ))
                }
                Matched::Group(items) => Ok(QueryValues::List(self.values_of(items)?)),
            })
            .collect()
    }
}
