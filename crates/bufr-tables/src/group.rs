//! Table-group loading and the bounded group cache.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;

use crate::descriptors::{
    fxy, BufrTemplate, Descriptor, ElementDescriptor, OperatorDescriptor, SequenceDescriptor,
};
use crate::TablesError;

/// Master table version the loader falls back to when the requested version
/// is not present on disk.
pub const DEFAULT_MASTER_VERSION: u8 = 25;

/// Maximum number of table groups kept by a [`Tables`] cache.
const MAX_CACHED_GROUPS: usize = 50;

const EMBEDDED_TABLE_B: &str = include_str!("../tables/TableB.json");
const EMBEDDED_TABLE_D: &str = include_str!("../tables/TableD.json");
const EMBEDDED_CODE_FLAG: &str = include_str!("../tables/code_and_flag.json");

/// The version tuple that selects one set of tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableGroupKey {
    pub master_table: u8,
    pub originating_centre: u16,
    pub originating_subcentre: u16,
    pub master_version: u8,
    pub local_version: u8,
}

impl Default for TableGroupKey {
    fn default() -> Self {
        Self {
            master_table: 0,
            originating_centre: 0,
            originating_subcentre: 0,
            master_version: DEFAULT_MASTER_VERSION,
            local_version: 0,
        }
    }
}

/// An immutable snapshot of Table B, Table D and the code/flag tables for
/// one version key.
///
/// Sequence expansions are stored as raw member id lists and expanded when a
/// template is built, so a group never references other groups and cycle
/// detection happens at build time.
#[derive(Debug)]
pub struct TableGroup {
    key: TableGroupKey,
    elements: HashMap<u32, Arc<ElementDescriptor>>,
    sequences: HashMap<u32, (String, Vec<u32>)>,
    code_flag: HashMap<u32, HashMap<String, String>>,
}

impl TableGroup {
    /// Looks up a Table B element descriptor.
    pub fn lookup_element(&self, id: u32) -> Result<Arc<ElementDescriptor>, TablesError> {
        self.elements
            .get(&id)
            .cloned()
            .ok_or(TablesError::UnknownDescriptor(id))
    }

    /// Looks up the member id list of a Table D sequence.
    pub fn lookup_sequence_ids(&self, id: u32) -> Result<&[u32], TablesError> {
        self.sequences
            .get(&id)
            .map(|(_, ids)| ids.as_slice())
            .ok_or(TablesError::UnknownDescriptor(id))
    }

    /// Looks up the meaning of a code-table value.
    pub fn code_meaning(&self, id: u32, value: i64) -> Option<&str> {
        self.code_flag
            .get(&id)
            .and_then(|m| m.get(&value.to_string()))
            .map(|s| s.as_str())
    }

    /// The version key this group was loaded for.
    pub fn key(&self) -> TableGroupKey {
        self.key
    }

    /// Builds a template from a section 3 descriptor id list.
    pub fn template_from_ids(&self, ids: &[u32]) -> Result<BufrTemplate, TablesError> {
        Ok(BufrTemplate::new(self.descriptors_from_ids(ids)?))
    }

    /// Builds descriptors from a raw id list, consuming replication factors
    /// and member groups from the list itself.
    pub fn descriptors_from_ids(&self, ids: &[u32]) -> Result<Vec<Descriptor>, TablesError> {
        let mut iter = ids.iter().copied();
        let mut out = Vec::new();
        let mut stack = Vec::new();
        while let Some(id) = iter.next() {
            out.push(self.build_descriptor(id, &mut iter, &mut stack)?);
        }
        Ok(out)
    }

    fn build_descriptor(
        &self,
        id: u32,
        iter: &mut impl Iterator<Item = u32>,
        seq_stack: &mut Vec<u32>,
    ) -> Result<Descriptor, TablesError> {
        let (f, x, y) = fxy(id);
        match f {
            0 => Ok(match self.lookup_element(id) {
                Ok(element) => Descriptor::Element(element),
                Err(_) => Descriptor::Undefined { id },
            }),
            1 => {
                let n_items = x as usize;
                if y == 0 {
                    let factor_id = iter
                        .next()
                        .ok_or(TablesError::TruncatedReplication(id))?;
                    if fxy(factor_id).0 != 0 {
                        return Err(TablesError::BadReplicationFactor(id, factor_id));
                    }
                    let factor = self.lookup_element(factor_id)?;
                    let members = self.build_members(id, n_items, iter, seq_stack)?;
                    Ok(Descriptor::DelayedReplication { id, factor, members })
                } else {
                    let members = self.build_members(id, n_items, iter, seq_stack)?;
                    Ok(Descriptor::FixedReplication { id, members })
                }
            }
            2 => Ok(Descriptor::Operator(OperatorDescriptor::new(id))),
            _ => self.build_sequence(id, seq_stack),
        }
    }

    fn build_members(
        &self,
        id: u32,
        n_items: usize,
        iter: &mut impl Iterator<Item = u32>,
        seq_stack: &mut Vec<u32>,
    ) -> Result<Vec<Descriptor>, TablesError> {
        let mut members = Vec::with_capacity(n_items);
        for _ in 0..n_items {
            let member_id = iter.next().ok_or(TablesError::TruncatedReplication(id))?;
            members.push(self.build_descriptor(member_id, iter, seq_stack)?);
        }
        Ok(members)
    }

    fn build_sequence(&self, id: u32, seq_stack: &mut Vec<u32>) -> Result<Descriptor, TablesError> {
        if seq_stack.contains(&id) {
            return Err(TablesError::CyclicSequence(id));
        }
        let (name, member_ids) = self
            .sequences
            .get(&id)
            .ok_or(TablesError::UnknownDescriptor(id))?;
        seq_stack.push(id);
        let mut iter = member_ids.iter().copied();
        let mut members = Vec::new();
        while let Some(member_id) = iter.next() {
            members.push(self.build_descriptor(member_id, &mut iter, seq_stack)?);
        }
        seq_stack.pop();
        Ok(Descriptor::Sequence(Arc::new(SequenceDescriptor {
            id,
            name: name.clone(),
            members,
        })))
    }

    fn from_sources(key: TableGroupKey, sources: &[TableSource]) -> Result<Self, TablesError> {
        let mut elements = HashMap::new();
        let mut sequences = HashMap::new();
        let mut code_flag: HashMap<u32, HashMap<String, String>> = HashMap::new();

        for source in sources {
            for (id_string, fields) in parse_object(&source.table_b, "TableB.json")? {
                let id = parse_id(&id_string)?;
                elements.insert(id, Arc::new(parse_element(id, &id_string, &fields)?));
            }
            for (id_string, fields) in parse_object(&source.table_d, "TableD.json")? {
                let id = parse_id(&id_string)?;
                sequences.insert(id, parse_sequence(&id_string, &fields)?);
            }
            if let Some(raw) = &source.code_flag {
                for (id_string, mapping) in parse_object(raw, "code_and_flag.json")? {
                    let id = parse_id(&id_string)?;
                    let entry = code_flag.entry(id).or_default();
                    let obj = mapping.as_object().ok_or_else(|| {
                        TablesError::MalformedEntry(id_string.clone(), "expected object".into())
                    })?;
                    for (value, meaning) in obj {
                        if let Some(text) = meaning.as_str() {
                            entry.insert(value.clone(), text.to_string());
                        }
                    }
                }
            }
        }

        Ok(Self {
            key,
            elements,
            sequences,
            code_flag,
        })
    }
}

struct TableSource {
    table_b: String,
    table_d: String,
    code_flag: Option<String>,
}

impl TableSource {
    fn embedded() -> Self {
        Self {
            table_b: EMBEDDED_TABLE_B.to_string(),
            table_d: EMBEDDED_TABLE_D.to_string(),
            code_flag: Some(EMBEDDED_CODE_FLAG.to_string()),
        }
    }

    fn from_dir(dir: &Path) -> Result<Self, TablesError> {
        let read = |name: &str| -> Result<String, TablesError> {
            let path = dir.join(name);
            std::fs::read_to_string(&path)
                .map_err(|e| TablesError::Io(path.display().to_string(), e))
        };
        Ok(Self {
            table_b: read("TableB.json")?,
            table_d: read("TableD.json")?,
            code_flag: read("code_and_flag.json").ok(),
        })
    }
}

fn parse_object(raw: &str, file: &str) -> Result<Vec<(String, Json)>, TablesError> {
    let value: Json =
        serde_json::from_str(raw).map_err(|e| TablesError::Json(file.to_string(), e))?;
    let obj = value.as_object().ok_or_else(|| {
        TablesError::MalformedEntry(file.to_string(), "expected a top level object".into())
    })?;
    Ok(obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn parse_id(id_string: &str) -> Result<u32, TablesError> {
    id_string
        .parse()
        .map_err(|_| TablesError::MalformedEntry(id_string.to_string(), "non-numeric id".into()))
}

fn parse_element(id: u32, id_string: &str, fields: &Json) -> Result<ElementDescriptor, TablesError> {
    let bad = |msg: &str| TablesError::MalformedEntry(id_string.to_string(), msg.into());
    let arr = fields.as_array().ok_or_else(|| bad("expected array"))?;
    if arr.len() < 5 {
        return Err(bad("expected [name, unit, scale, refval, nbits]"));
    }
    Ok(ElementDescriptor {
        id,
        name: arr[0].as_str().ok_or_else(|| bad("name"))?.to_string(),
        unit: arr[1].as_str().ok_or_else(|| bad("unit"))?.to_string(),
        scale: arr[2].as_i64().ok_or_else(|| bad("scale"))? as i32,
        refval: arr[3].as_i64().ok_or_else(|| bad("refval"))?,
        nbits: arr[4].as_u64().ok_or_else(|| bad("nbits"))? as usize,
    })
}

fn parse_sequence(id_string: &str, fields: &Json) -> Result<(String, Vec<u32>), TablesError> {
    let bad = |msg: &str| TablesError::MalformedEntry(id_string.to_string(), msg.into());
    let arr = fields.as_array().ok_or_else(|| bad("expected array"))?;
    if arr.len() < 2 {
        return Err(bad("expected [name, member ids]"));
    }
    let name = arr[0].as_str().unwrap_or("").to_string();
    let raw_members = arr[1].as_array().ok_or_else(|| bad("member ids"))?;
    let mut members = Vec::with_capacity(raw_members.len());
    for member in raw_members {
        let id = match member {
            Json::String(s) => parse_id(s)?,
            Json::Number(n) => n.as_u64().ok_or_else(|| bad("member id"))? as u32,
            _ => return Err(bad("member id")),
        };
        members.push(id);
    }
    Ok((name, members))
}

/// Loader and bounded cache of [`TableGroup`] snapshots.
///
/// Each decoder or encoder owns its own `Tables`; there is no process-wide
/// cache. Loaded groups are shared out as `Arc` so concurrent engines can
/// decode against the same snapshot.
#[derive(Debug, Default)]
pub struct Tables {
    root_dir: Option<PathBuf>,
    groups: HashMap<TableGroupKey, Arc<TableGroup>>,
}

impl Tables {
    /// A loader backed only by the embedded default tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// A loader reading table files from `root/<master>/<centre>_<subcentre>/<version>/`,
    /// falling back to the embedded defaults when a directory is absent.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: Some(root_dir.into()),
            groups: HashMap::new(),
        }
    }

    /// Returns the group for `key`, loading and caching it on first use.
    pub fn group(&mut self, key: TableGroupKey) -> Result<Arc<TableGroup>, TablesError> {
        if let Some(group) = self.groups.get(&key) {
            return Ok(group.clone());
        }
        let group = Arc::new(self.load(key)?);
        if self.groups.len() >= MAX_CACHED_GROUPS {
            if let Some(evict) = self.groups.keys().next().copied() {
                self.groups.remove(&evict);
            }
        }
        self.groups.insert(key, group.clone());
        Ok(group)
    }

    fn load(&self, key: TableGroupKey) -> Result<TableGroup, TablesError> {
        let mut sources = Vec::new();
        match &self.root_dir {
            Some(root) => {
                let wmo = self.wmo_dir(root, key);
                match wmo {
                    Some(dir) => sources.push(TableSource::from_dir(&dir)?),
                    None => {
                        debug!(?key, "wmo tables not found on disk, using embedded defaults");
                        sources.push(TableSource::embedded());
                    }
                }
                if key.local_version != 0 {
                    if let Some(dir) = self.local_dir(root, key) {
                        sources.push(TableSource::from_dir(&dir)?);
                    } else {
                        debug!(?key, "local tables not found, continuing without overlay");
                    }
                }
            }
            None => sources.push(TableSource::embedded()),
        }
        TableGroup::from_sources(key, &sources)
    }

    fn wmo_dir(&self, root: &Path, key: TableGroupKey) -> Option<PathBuf> {
        let exact = root
            .join(key.master_table.to_string())
            .join("0_0")
            .join(key.master_version.to_string());
        if exact.is_dir() {
            return Some(exact);
        }
        let fallback = root
            .join(key.master_table.to_string())
            .join("0_0")
            .join(DEFAULT_MASTER_VERSION.to_string());
        fallback.is_dir().then_some(fallback)
    }

    fn local_dir(&self, root: &Path, key: TableGroupKey) -> Option<PathBuf> {
        let master = key.master_table.to_string();
        let version = key.local_version.to_string();
        let candidates = [
            format!("{}_{}", key.originating_centre, key.originating_subcentre),
            format!("{}_0", key.originating_centre),
        ];
        candidates
            .iter()
            .map(|centres| root.join(&master).join(centres).join(&version))
            .find(|dir| dir.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_group() -> Arc<TableGroup> {
        Tables::new().group(TableGroupKey::default()).unwrap()
    }

    #[test]
    fn test_lookup_element() {
        let group = default_group();
        let e = group.lookup_element(1001).unwrap();
        assert_eq!(e.name, "WMO BLOCK NUMBER");
        assert_eq!(e.nbits, 7);
        assert_eq!(e.scale, 0);
        assert_eq!(e.refval, 0);
    }

    #[test]
    fn test_unknown_descriptor() {
        let group = default_group();
        assert!(matches!(
            group.lookup_element(99999),
            Err(TablesError::UnknownDescriptor(99999))
        ));
    }

    #[test]
    fn test_sequence_expansion() {
        let group = default_group();
        let template = group.template_from_ids(&[301001]).unwrap();
        match &template.members[0] {
            Descriptor::Sequence(s) => {
                assert_eq!(s.members.len(), 2);
                assert_eq!(s.members[0].id(), 1001);
                assert_eq!(s.members[1].id(), 1002);
            }
            other => panic!("expected sequence, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_replication_consumes_members() {
        let group = default_group();
        let descriptors = group.descriptors_from_ids(&[102003, 12001, 13003]).unwrap();
        assert_eq!(descriptors.len(), 1);
        match &descriptors[0] {
            Descriptor::FixedReplication { id, members } => {
                assert_eq!(*id, 102003);
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected replication, got {other:?}"),
        }
    }

    #[test]
    fn test_delayed_replication_takes_factor() {
        let group = default_group();
        let descriptors = group
            .descriptors_from_ids(&[103000, 31001, 8042, 12001, 13003])
            .unwrap();
        match &descriptors[0] {
            Descriptor::DelayedReplication { factor, members, .. } => {
                assert_eq!(factor.id, 31001);
                assert_eq!(members.len(), 3);
            }
            other => panic!("expected delayed replication, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_replication() {
        let group = default_group();
        assert!(matches!(
            group.descriptors_from_ids(&[103000, 31001, 8042]),
            Err(TablesError::TruncatedReplication(103000))
        ));
    }

    #[test]
    fn test_flat_ids_roundtrip() {
        let group = default_group();
        let ids = vec![103000, 31001, 8042, 12001, 13003, 301001];
        let template = group.template_from_ids(&ids).unwrap();
        assert_eq!(template.flat_ids(), ids);
    }

    #[test]
    fn test_code_meaning() {
        let group = default_group();
        assert_eq!(
            group.code_meaning(31021, 1),
            Some("1 bit indicator of quality")
        );
        assert_eq!(group.code_meaning(31021, 900), None);
    }

    #[test]
    fn test_group_cache_returns_same_snapshot() {
        let mut tables = Tables::new();
        let a = tables.group(TableGroupKey::default()).unwrap();
        let b = tables.group(TableGroupKey::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
