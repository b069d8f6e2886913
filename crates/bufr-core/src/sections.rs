//! Section framing for editions 3 and 4.
//!
//! Sections 0 through 5 carry their own octet lengths; the template payload
//! lives in section 4. Decoding reads each section against its declared
//! length and skips residual pad bits; encoding writes placeholder lengths
//! and patches them once the section body is known. Editions 3 and earlier
//! pad every section to an even octet count, edition 4 pads to whole octets.

use bufr_bits::{BitReader, BitWriter, NBITS_PER_BYTE};
use bufr_tables::TableGroupKey;

use crate::error::BufrError;

/// Message start signature.
pub const START_SIGNATURE: &[u8; 4] = b"BUFR";
/// Message terminator, section 5.
pub const STOP_SIGNATURE: &[u8; 4] = b"7777";

fn section_length(reader: &mut BitReader<'_>) -> Result<usize, BufrError> {
    Ok(reader.read_uint(24)? as usize)
}

/// Skips to the declared end of a section, verifying the residue is zero
/// padding.
pub(crate) fn skip_to_section_end(
    reader: &mut BitReader<'_>,
    start_bitpos: usize,
    length: usize,
) -> Result<(), BufrError> {
    let declared_bits = length * NBITS_PER_BYTE;
    let read_bits = reader.pos() - start_bitpos;
    if read_bits > declared_bits {
        return Err(BufrError::MalformedHeader(format!(
            "read {read_bits} bits past declared section length of {length} octets"
        )));
    }
    let mut unread = declared_bits - read_bits;
    while unread > 0 {
        let take = unread.min(64);
        if reader.read_uint(take)? != 0 {
            return Err(BufrError::ExcessBits { nbits: unread });
        }
        unread -= take;
    }
    Ok(())
}

/// Pads the current section to the edition's octet rule and returns the
/// section length in octets.
pub(crate) fn close_section(writer: &mut BitWriter, start_bitpos: usize, edition: u8) -> usize {
    writer.pad_to_octet();
    let mut nbytes = (writer.pos() - start_bitpos) / NBITS_PER_BYTE;
    if edition <= 3 && nbytes % 2 != 0 {
        let _ = writer.skip(NBITS_PER_BYTE);
        nbytes += 1;
    }
    nbytes
}

/// Section 0: signature, total message length, edition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section0 {
    pub total_length: usize,
    pub edition: u8,
}

impl Section0 {
    pub fn decode(reader: &mut BitReader<'_>) -> Result<Self, BufrError> {
        let magic = reader.read_bytes(4)?;
        if magic != START_SIGNATURE {
            return Err(BufrError::ValidationFailed {
                expected: String::from_utf8_lossy(START_SIGNATURE).into_owned(),
                found: String::from_utf8_lossy(&magic).into_owned(),
            });
        }
        let total_length = reader.read_uint(24)? as usize;
        let edition = reader.read_uint(8)? as u8;
        if !(1..=4).contains(&edition) {
            return Err(BufrError::MalformedHeader(format!(
                "unsupported edition {edition}"
            )));
        }
        Ok(Self {
            total_length,
            edition,
        })
    }

    pub fn encode(&self, writer: &mut BitWriter) -> Result<(), BufrError> {
        writer.write_bytes(START_SIGNATURE, 4)?;
        // Patched once the whole message has been written.
        writer.write_uint(self.total_length as u64, 24)?;
        writer.write_uint(self.edition as u64, 8)?;
        Ok(())
    }
}

/// Section 1: identification and the table version key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section1 {
    pub length: usize,
    pub master_table: u8,
    pub originating_centre: u16,
    pub originating_subcentre: u16,
    pub update_sequence: u8,
    pub flags: u8,
    pub data_category: u8,
    pub intl_subcategory: u8,
    pub local_subcategory: u8,
    pub master_version: u8,
    pub local_version: u8,
    /// Raw year field: full year in edition 4, year of century before.
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// Local-use octets after the fixed layout, preserved verbatim.
    pub extra: Vec<u8>,
}

impl Section1 {
    /// Whether the optional section 2 follows.
    pub fn has_section2(&self) -> bool {
        self.flags & 0x80 != 0
    }

    pub fn decode(reader: &mut BitReader<'_>, edition: u8) -> Result<Self, BufrError> {
        let start = reader.pos();
        let length = section_length(reader)?;
        let read_u8 = |r: &mut BitReader<'_>| -> Result<u8, BufrError> { Ok(r.read_uint(8)? as u8) };

        let section = if edition >= 4 {
            let master_table = read_u8(reader)?;
            let originating_centre = reader.read_uint(16)? as u16;
            let originating_subcentre = reader.read_uint(16)? as u16;
            let update_sequence = read_u8(reader)?;
            let flags = read_u8(reader)?;
            let data_category = read_u8(reader)?;
            let intl_subcategory = read_u8(reader)?;
            let local_subcategory = read_u8(reader)?;
            let master_version = read_u8(reader)?;
            let local_version = read_u8(reader)?;
            let year = reader.read_uint(16)? as u16;
            let month = read_u8(reader)?;
            let day = read_u8(reader)?;
            let hour = read_u8(reader)?;
            let minute = read_u8(reader)?;
            let second = read_u8(reader)?;
            let consumed = (reader.pos() - start) / NBITS_PER_BYTE;
            let extra = reader.read_bytes(length.checked_sub(consumed).ok_or_else(|| {
                BufrError::MalformedHeader(format!("section 1 length {length} too short"))
            })?)?;
            Self {
                length,
                master_table,
                originating_centre,
                originating_subcentre,
                update_sequence,
                flags,
                data_category,
                intl_subcategory,
                local_subcategory,
                master_version,
                local_version,
                year,
                month,
                day,
                hour,
                minute,
                second,
                extra,
            }
        } else {
            let master_table = read_u8(reader)?;
            let originating_subcentre = read_u8(reader)? as u16;
            let originating_centre = read_u8(reader)? as u16;
            let update_sequence = read_u8(reader)?;
            let flags = read_u8(reader)?;
            let data_category = read_u8(reader)?;
            let local_subcategory = read_u8(reader)?;
            let master_version = read_u8(reader)?;
            let local_version = read_u8(reader)?;
            let year = read_u8(reader)? as u16;
            let month = read_u8(reader)?;
            let day = read_u8(reader)?;
            let hour = read_u8(reader)?;
            let minute = read_u8(reader)?;
            let consumed = (reader.pos() - start) / NBITS_PER_BYTE;
            let extra = reader.read_bytes(length.checked_sub(consumed).ok_or_else(|| {
                BufrError::MalformedHeader(format!("section 1 length {length} too short"))
            })?)?;
            Self {
                length,
                master_table,
                originating_centre,
                originating_subcentre,
                update_sequence,
                flags,
                data_category,
                intl_subcategory: 0,
                local_subcategory,
                master_version,
                local_version,
                year,
                month,
                day,
                hour,
                minute,
                second: 0,
                extra,
            }
        };
        skip_to_section_end(reader, start, length)?;
        Ok(section)
    }

    pub fn encode(&self, writer: &mut BitWriter, edition: u8) -> Result<usize, BufrError> {
        let start = writer.pos();
        let length_pos = writer.pos();
        writer.write_uint(0, 24)?;
        if edition >= 4 {
            writer.write_uint(self.master_table as u64, 8)?;
            writer.write_uint(self.originating_centre as u64, 16)?;
            writer.write_uint(self.originating_subcentre as u64, 16)?;
            writer.write_uint(self.update_sequence as u64, 8)?;
            writer.write_uint(self.flags as u64, 8)?;
            writer.write_uint(self.data_category as u64, 8)?;
            writer.write_uint(self.intl_subcategory as u64, 8)?;
            writer.write_uint(self.local_subcategory as u64, 8)?;
            writer.write_uint(self.master_version as u64, 8)?;
            writer.write_uint(self.local_version as u64, 8)?;
            writer.write_uint(self.year as u64, 16)?;
            for v in [self.month, self.day, self.hour, self.minute, self.second] {
                writer.write_uint(v as u64, 8)?;
            }
        } else {
            writer.write_uint(self.master_table as u64, 8)?;
            writer.write_uint(self.originating_subcentre as u64, 8)?;
            writer.write_uint(self.originating_centre as u64, 8)?;
            writer.write_uint(self.update_sequence as u64, 8)?;
            writer.write_uint(self.flags as u64, 8)?;
            writer.write_uint(self.data_category as u64, 8)?;
            writer.write_uint(self.local_subcategory as u64, 8)?;
            writer.write_uint(self.master_version as u64, 8)?;
            writer.write_uint(self.local_version as u64, 8)?;
            writer.write_uint(self.year as u64, 8)?;
            for v in [self.month, self.day, self.hour, self.minute] {
                writer.write_uint(v as u64, 8)?;
            }
        }
        for b in &self.extra {
            writer.write_uint(*b as u64, 8)?;
        }
        let nbytes = close_section(writer, start, edition);
        writer.patch_uint(nbytes as u64, 24, length_pos)?;
        Ok(nbytes)
    }

    /// The table version key negotiated by this section.
    pub fn table_group_key(&self) -> TableGroupKey {
        TableGroupKey {
            master_table: self.master_table,
            originating_centre: self.originating_centre,
            originating_subcentre: self.originating_subcentre,
            master_version: self.master_version,
            local_version: self.local_version,
        }
    }
}

/// Optional section 2: opaque local data, preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section2 {
    pub length: usize,
    pub data: Vec<u8>,
}

impl Section2 {
    pub fn decode(reader: &mut BitReader<'_>) -> Result<Self, BufrError> {
        let start = reader.pos();
        let length = section_length(reader)?;
        reader.skip(8)?;
        let data = reader.read_bytes(length.saturating_sub(4))?;
        skip_to_section_end(reader, start, length)?;
        Ok(Self { length, data })
    }

    pub fn encode(&self, writer: &mut BitWriter, edition: u8) -> Result<usize, BufrError> {
        let start = writer.pos();
        let length_pos = writer.pos();
        writer.write_uint(0, 24)?;
        writer.write_uint(0, 8)?;
        for b in &self.data {
            writer.write_uint(*b as u64, 8)?;
        }
        let nbytes = close_section(writer, start, edition);
        writer.patch_uint(nbytes as u64, 24, length_pos)?;
        Ok(nbytes)
    }
}

/// Section 3: subset count, flags and the unexpanded descriptor list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section3 {
    pub length: usize,
    pub n_subsets: u16,
    pub flags: u8,
    pub unexpanded_descriptors: Vec<u32>,
}

impl Section3 {
    pub fn is_observed(&self) -> bool {
        self.flags & 0x80 != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & 0x40 != 0
    }

    pub fn decode(reader: &mut BitReader<'_>) -> Result<Self, BufrError> {
        let start = reader.pos();
        let length = section_length(reader)?;
        reader.skip(8)?;
        let n_subsets = reader.read_uint(16)? as u16;
        let flags = reader.read_uint(8)? as u8;
        let n_descriptors = length.saturating_sub(7) / 2;
        let mut unexpanded_descriptors = Vec::with_capacity(n_descriptors);
        for _ in 0..n_descriptors {
            let f = reader.read_uint(2)? as u32;
            let x = reader.read_uint(6)? as u32;
            let y = reader.read_uint(8)? as u32;
            unexpanded_descriptors.push(f * 100_000 + x * 1000 + y);
        }
        skip_to_section_end(reader, start, length)?;
        Ok(Self {
            length,
            n_subsets,
            flags,
            unexpanded_descriptors,
        })
    }

    pub fn encode(&self, writer: &mut BitWriter, edition: u8) -> Result<usize, BufrError> {
        let start = writer.pos();
        let length_pos = writer.pos();
        writer.write_uint(0, 24)?;
        writer.write_uint(0, 8)?;
        writer.write_uint(self.n_subsets as u64, 16)?;
        writer.write_uint(self.flags as u64, 8)?;
        for id in &self.unexpanded_descriptors {
            let (f, x, y) = bufr_tables::fxy(*id);
            writer.write_uint(f as u64, 2)?;
            writer.write_uint(x as u64, 6)?;
            writer.write_uint(y as u64, 8)?;
        }
        let nbytes = close_section(writer, start, edition);
        writer.patch_uint(nbytes as u64, 24, length_pos)?;
        Ok(nbytes)
    }
}

/// Section 5: the four-octet terminator.
pub fn decode_section5(reader: &mut BitReader<'_>) -> Result<(), BufrError> {
    let magic = reader.read_bytes(4)?;
    if magic != STOP_SIGNATURE {
        return Err(BufrError::ValidationFailed {
            expected: String::from_utf8_lossy(STOP_SIGNATURE).into_owned(),
            found: String::from_utf8_lossy(&magic).into_owned(),
        });
    }
    Ok(())
}

pub fn encode_section5(writer: &mut BitWriter) -> Result<(), BufrError> {
    writer.write_bytes(STOP_SIGNATURE, 4)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section0_roundtrip() {
        let section = Section0 {
            total_length: 52,
            edition: 4,
        };
        let mut writer = BitWriter::new();
        section.encode(&mut writer).unwrap();
        let data = writer.into_bytes();
        let mut reader = BitReader::new(&data);
        assert_eq!(Section0::decode(&mut reader).unwrap(), section);
    }

    #[test]
    fn test_section0_bad_signature() {
        let mut writer = BitWriter::new();
        writer.write_bytes(b"BUFX", 4).unwrap();
        writer.write_uint(10, 24).unwrap();
        writer.write_uint(4, 8).unwrap();
        let data = writer.into_bytes();
        let mut reader = BitReader::new(&data);
        assert!(matches!(
            Section0::decode(&mut reader),
            Err(BufrError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_section1_edition4_roundtrip() {
        let section = Section1 {
            length: 22,
            master_table: 0,
            originating_centre: 74,
            originating_subcentre: 0,
            update_sequence: 0,
            flags: 0,
            data_category: 2,
            intl_subcategory: 255,
            local_subcategory: 255,
            master_version: 25,
            local_version: 0,
            year: 2021,
            month: 3,
            day: 14,
            hour: 9,
            minute: 26,
            second: 53,
            extra: Vec::new(),
        };
        let mut writer = BitWriter::new();
        section.encode(&mut writer, 4).unwrap();
        let data = writer.into_bytes();
        assert_eq!(data.len(), 22);
        let mut reader = BitReader::new(&data);
        assert_eq!(Section1::decode(&mut reader, 4).unwrap(), section);
    }

    #[test]
    fn test_section1_edition3_pads_to_even() {
        let section = Section1 {
            length: 0,
            master_table: 0,
            originating_centre: 98,
            originating_subcentre: 0,
            update_sequence: 0,
            flags: 0x80,
            data_category: 0,
            intl_subcategory: 0,
            local_subcategory: 1,
            master_version: 13,
            local_version: 1,
            year: 21,
            month: 1,
            day: 2,
            hour: 3,
            minute: 4,
            second: 0,
            extra: Vec::new(),
        };
        let mut writer = BitWriter::new();
        let nbytes = section.encode(&mut writer, 3).unwrap();
        // 17 fixed octets padded to an even count.
        assert_eq!(nbytes, 18);
        let data = writer.into_bytes();
        let mut reader = BitReader::new(&data);
        let decoded = Section1::decode(&mut reader, 3).unwrap();
        assert!(decoded.has_section2());
        assert_eq!(decoded.originating_centre, 98);
        // The pad octet shows up as preserved local bytes.
        assert_eq!(decoded.extra, vec![0]);
    }

    #[test]
    fn test_section3_descriptors_roundtrip() {
        let section = Section3 {
            length: 0,
            n_subsets: 4,
            flags: 0xc0,
            unexpanded_descriptors: vec![1001, 103000, 31001, 12001, 301001],
        };
        let mut writer = BitWriter::new();
        section.encode(&mut writer, 4).unwrap();
        let data = writer.into_bytes();
        let mut reader = BitReader::new(&data);
        let decoded = Section3::decode(&mut reader).unwrap();
        assert_eq!(decoded.n_subsets, 4);
        assert!(decoded.is_compressed());
        assert!(decoded.is_observed());
        assert_eq!(
            decoded.unexpanded_descriptors,
            section.unexpanded_descriptors
        );
    }

    #[test]
    fn test_section3_odd_length_pad_ignored() {
        // 7 header octets + 2 descriptors = 11 octets, padded to 12 for
        // edition 3; the decoder must not read the pad octet as a
        // descriptor.
        let section = Section3 {
            length: 0,
            n_subsets: 1,
            flags: 0x80,
            unexpanded_descriptors: vec![1001, 1002],
        };
        let mut writer = BitWriter::new();
        let nbytes = section.encode(&mut writer, 3).unwrap();
        assert_eq!(nbytes, 12);
        let data = writer.into_bytes();
        let mut reader = BitReader::new(&data);
        let decoded = Section3::decode(&mut reader).unwrap();
        // (12 - 7) / 2 = 2, so the pad octet never reads as a descriptor.
        assert_eq!(decoded.unexpanded_descriptors, vec![1001, 1002]);
    }

    #[test]
    fn test_section5() {
        let mut writer = BitWriter::new();
        encode_section5(&mut writer).unwrap();
        let data = writer.into_bytes();
        assert_eq!(&data, b"7777");
        let mut reader = BitReader::new(&data);
        assert!(decode_section5(&mut reader).is_ok());

        let mut reader = BitReader::new(b"7776");
        assert!(matches!(
            decode_section5(&mut reader),
            Err(BufrError::ValidationFailed { .. })
        ));
    }
}
