//! Text rendering of decoded messages.

use bufr_core::{BufrMessage, DecodedDescriptor, NodeKind, TemplateData, Value, Wired, WiredNode};

const INDENT: &str = "    ";

/// Renders section headers and the hierarchical data view of every subset.
pub fn render_text(message: &BufrMessage) -> String {
    let mut out = Vec::new();
    out.push("<<<<<< section 0 >>>>>>".to_string());
    out.push(format!("length = {}", message.section0.total_length));
    out.push(format!("edition = {}", message.section0.edition));

    let s1 = &message.section1;
    out.push("<<<<<< section 1 >>>>>>".to_string());
    out.push(format!("master table = {}", s1.master_table));
    out.push(format!(
        "originating centre / subcentre = {} / {}",
        s1.originating_centre, s1.originating_subcentre
    ));
    out.push(format!(
        "table versions = {} / {}",
        s1.master_version, s1.local_version
    ));
    out.push(format!(
        "date/time = {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        s1.year, s1.month, s1.day, s1.hour, s1.minute, s1.second
    ));

    if let Some(section2) = &message.section2 {
        out.push("<<<<<< section 2 >>>>>>".to_string());
        out.push(format!("{} octets of local data", section2.data.len()));
    }

    let s3 = &message.section3;
    out.push("<<<<<< section 3 >>>>>>".to_string());
    out.push(format!("number of subsets = {}", s3.n_subsets));
    out.push(format!(
        "observed = {}, compressed = {}",
        s3.is_observed(),
        s3.is_compressed()
    ));
    out.push(format!(
        "unexpanded descriptors = {}",
        s3.unexpanded_descriptors
            .iter()
            .map(|id| format!("{id:06}"))
            .collect::<Vec<_>>()
            .join(" ")
    ));

    if let Some(data) = &message.template_data {
        match data.wired() {
            Some(wired) => render_wired(&mut out, data, wired),
            None => out.push("(template data not wired)".to_string()),
        }
    }
    out.push(String::new());
    out.join("\n")
}

fn render_wired(out: &mut Vec<String>, data: &TemplateData, wired: &Wired) {
    for idx_subset in 0..data.n_subsets() {
        out.push(format!(
            "###### subset {} of {} ######",
            idx_subset + 1,
            data.n_subsets()
        ));
        let roots = if data.is_compressed() {
            &wired.roots_all_subsets[0]
        } else {
            &wired.roots_all_subsets[idx_subset]
        };
        let renderer = SubsetRenderer {
            data,
            wired,
            idx_subset,
        };
        for root in roots {
            renderer.render_node(out, *root, "");
        }
    }
}

struct SubsetRenderer<'a> {
    data: &'a TemplateData,
    wired: &'a Wired,
    idx_subset: usize,
}

impl SubsetRenderer<'_> {
    fn node(&self, id: usize) -> &WiredNode {
        self.wired.arena.get(id)
    }

    fn render_node(&self, out: &mut Vec<String>, id: usize, indent: &str) {
        let node = self.node(id);
        match node.kind {
            NodeKind::Value => self.render_value_node(out, id, indent, false),
            NodeKind::NoValue => {
                out.push(format!("{indent}{:06}", node.descriptor_id));
            }
            NodeKind::Sequence => {
                out.push(format!("{indent}{:06}", node.descriptor_id));
                let deeper = format!("{indent}{INDENT}");
                for member in &node.members {
                    self.render_node(out, *member, &deeper);
                }
            }
            NodeKind::FixedReplication | NodeKind::DelayedReplication => {
                out.push(format!("{indent}{:06}", node.descriptor_id));
                if let Some(factor) = node.factor {
                    let dotted = format!("{indent}....");
                    self.render_value_node(out, factor, &dotted, false);
                }
                let group = node.group_size.max(1);
                let n_groups = node.members.len() / group;
                let deeper = format!("{indent}{INDENT}");
                for (i, chunk) in node.members.chunks(group).enumerate() {
                    out.push(format!(
                        "{deeper}# --- {} of {} replications ---",
                        i + 1,
                        n_groups
                    ));
                    for member in chunk {
                        self.render_node(out, *member, &deeper);
                    }
                }
            }
        }
    }

    fn render_value_node(&self, out: &mut Vec<String>, id: usize, indent: &str, is_attr: bool) {
        let node = self.node(id);
        let flat = match node.flat_index {
            Some(flat) => flat,
            None => return,
        };
        let descriptor = &self.data.descriptors(self.idx_subset)[flat];
        let value = &self.data.values(self.idx_subset)[flat];
        let name = describe(descriptor);
        let arrow = if is_attr { "-> " } else { "" };
        out.push(format!("{indent}{arrow}{descriptor} {name} {value}"));
        let deeper = format!("{indent}{INDENT}");
        for (_, attr) in &node.attributes {
            self.render_value_node(out, *attr, &deeper, true);
        }
    }
}

fn describe(descriptor: &DecodedDescriptor) -> String {
    match descriptor {
        DecodedDescriptor::Element(e) => e.name.clone(),
        DecodedDescriptor::Marker { marker_id, .. } => format!("{marker_id:06}"),
        DecodedDescriptor::Associated { .. } => "ASSOCIATED FIELD".to_string(),
        DecodedDescriptor::SkippedLocal { nbits, .. } => format!("{nbits} bits local"),
        DecodedDescriptor::Operator(_) => "OPERATOR".to_string(),
    }
}

/// Renders one value for CLI output.
pub fn render_value(value: &Value) -> String {
    value.to_string()
}
