//! The fully decoded message.

use bufr_tables::TableGroupKey;

use crate::error::BufrError;
use crate::sections::{Section0, Section1, Section2, Section3};
use crate::templatedata::TemplateData;

/// One decoded BUFR message: section headers plus the section 4 data.
///
/// `serialized` holds the exact octets the message was decoded from, which
/// lets stream scanners resume after it and lets callers compare a re-encode
/// against the original.
#[derive(Debug, Clone)]
pub struct BufrMessage {
    pub section0: Section0,
    pub section1: Section1,
    pub section2: Option<Section2>,
    pub section3: Section3,
    pub section4_length: usize,
    pub template_data: Option<TemplateData>,
    pub serialized: Vec<u8>,
}

impl BufrMessage {
    pub fn n_subsets(&self) -> usize {
        self.section3.n_subsets as usize
    }

    pub fn is_compressed(&self) -> bool {
        self.section3.is_compressed()
    }

    pub fn table_group_key(&self) -> TableGroupKey {
        self.section1.table_group_key()
    }

    /// Builds the hierarchical view of the template data, if any.
    pub fn wire(&mut self) -> Result<(), BufrError> {
        match &mut self.template_data {
            Some(data) => data.wire(),
            None => Ok(()),
        }
    }
}
