use crate::gpt::layout::GptLayout;

/// "EFI PART"
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Read-only view of the header fields inside a trailing image
///
/// Callers must check the image against [`GptLayout::min_image_len`] first;
/// the accessors index the raw bytes directly.
#[derive(Clone, Copy)]
pub struct TrailingHeader<'a> {
    raw: &'a [u8],
    layout: &'a GptLayout,
}

impl<'a> TrailingHeader<'a> {
    pub fn new(raw: &'a [u8], layout: &'a GptLayout) -> Option<Self> {
        if raw.len() < layout.min_image_len() {
            return None;
        }
        Some(Self { raw, layout })
    }

    pub fn has_signature(&self) -> bool {
        let start = self.layout.header_start;
        &self.raw[start..start + GPT_SIGNATURE.len()] == GPT_SIGNATURE
    }

    pub fn header_crc(&self) -> u32 {
        read_u32_le(self.raw, self.layout.header_crc_offset)
    }

    pub fn current_lba(&self) -> u32 {
        read_u32_le(self.raw, self.layout.current_lba_offset)
    }

    pub fn alternate_lba(&self) -> u32 {
        read_u32_le(self.raw, self.layout.alternate_lba_offset)
    }

    pub fn last_usable_lba(&self) -> u32 {
        read_u32_le(self.raw, self.layout.last_usable_offset)
    }

    pub fn entry_array_lba(&self) -> u32 {
        read_u32_le(self.raw, self.layout.entry_array_lba_offset)
    }

    pub fn entry_array_crc(&self) -> u32 {
        read_u32_le(self.raw, self.layout.entry_array_crc_offset)
    }

    /// CRC32 of the entry array bytes as currently stored
    pub fn compute_entry_array_crc(&self) -> u32 {
        entry_array_crc(self.raw, self.layout)
    }

    /// CRC32 of the header with its own CRC field treated as zero
    pub fn compute_header_crc(&self) -> u32 {
        header_crc(self.raw, self.layout)
    }
}

pub(crate) fn entry_array_crc(raw: &[u8], layout: &GptLayout) -> u32 {
    crc32fast::hash(&raw[..layout.entry_array_crc_len])
}

pub(crate) fn header_crc(raw: &[u8], layout: &GptLayout) -> u32 {
    let start = layout.header_start;
    let mut header = raw[start..start + layout.header_len].to_vec();
    let crc_field = layout.header_crc_offset - start;
    header[crc_field..crc_field + 4].fill(0);
    crc32fast::hash(&header)
}

pub(crate) fn read_u32_le(raw: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        raw[offset],
        raw[offset + 1],
        raw[offset + 2],
        raw[offset + 3],
    ])
}

pub(crate) fn write_u32_le(raw: &mut [u8], offset: usize, value: u32) {
    raw[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_view_rejects_short_image() {
        let layout = GptLayout::default();
        assert!(TrailingHeader::new(&[0u8; 512], &layout).is_none());
        assert!(TrailingHeader::new(&[0u8; 5120], &layout).is_some());
    }

    #[test]
    fn test_header_crc_ignores_stored_crc() {
        let layout = GptLayout::default();
        let mut raw = vec![0u8; 5120];
        raw[0x1200..0x1208].copy_from_slice(GPT_SIGNATURE);

        let before = header_crc(&raw, &layout);
        write_u32_le(&mut raw, layout.header_crc_offset, 0xDEADBEEF);
        assert_eq!(header_crc(&raw, &layout), before);

        // Any other header byte changes the checksum
        raw[0x1200 + 0x38] = 1;
        assert_ne!(header_crc(&raw, &layout), before);
    }

    #[test]
    fn test_field_accessors() {
        let layout = GptLayout::default();
        let mut raw = vec![0u8; 5120];
        raw[0x1200..0x1208].copy_from_slice(GPT_SIGNATURE);
        write_u32_le(&mut raw, 0x1230, 976_773_134);
        write_u32_le(&mut raw, 0x1218, 976_773_167);

        let header = TrailingHeader::new(&raw, &layout).unwrap();
        assert!(header.has_signature());
        assert_eq!(header.last_usable_lba(), 976_773_134);
        assert_eq!(header.current_lba(), 976_773_167);
    }
}
