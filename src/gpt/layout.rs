use crate::error::{Error, Result};
use crate::geometry::SECTOR_SIZE;

/// Sectors copied verbatim from the start of the source
pub const FIRST_REGION_SECTORS: u64 = 6_899_870;

/// Sectors captured from the end of the source (entry array + header)
pub const TRAILING_REGION_SECTORS: u64 = 10;

/// Sectors at the end of the disk that lie beyond the last usable LBA
///
/// The trailing region plus one, so the last usable LBA is the sector just
/// before the relocated entry array.
pub const RESERVED_BACKUP_SECTORS: u64 = TRAILING_REGION_SECTORS + 1;

/// Size of the reference source drive the default layout was taken from
pub const REFERENCE_SOURCE_SECTORS: u64 = 976_773_168;

/// Bytes of the entry array fed to the entry-array CRC
pub const ENTRY_ARRAY_CRC_LENGTH: usize = 0xFF0;

/// Bytes of the header covered by the header CRC
pub const HEADER_LEN: usize = 92;

// Header field offsets, relative to the start of the header
const HEADER_CRC_FIELD: usize = 0x10;
const CURRENT_LBA_FIELD: usize = 0x18;
const ALTERNATE_LBA_FIELD: usize = 0x20;
const LAST_USABLE_LBA_FIELD: usize = 0x30;
const ENTRY_ARRAY_LBA_FIELD: usize = 0x48;
const ENTRY_ARRAY_CRC_FIELD: usize = 0x58;

/// Sizes of the two regions copied from source to target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub leading_sectors: u64,
    pub trailing_sectors: u64,
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self {
            leading_sectors: FIRST_REGION_SECTORS,
            trailing_sectors: TRAILING_REGION_SECTORS,
        }
    }
}

impl RegionLayout {
    /// Smallest device both regions fit on without overlapping
    pub fn minimum_sectors(&self) -> u64 {
        self.leading_sectors + self.trailing_sectors
    }

    pub fn leading_bytes(&self) -> u64 {
        self.leading_sectors * SECTOR_SIZE as u64
    }

    pub fn trailing_bytes(&self) -> usize {
        (self.trailing_sectors * SECTOR_SIZE as u64) as usize
    }

    /// First sector of the trailing region on a device of `total_sectors`
    pub fn trailing_start(&self, total_sectors: u64) -> u64 {
        total_sectors - self.trailing_sectors
    }
}

/// Which GPT header the trailing image carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderRole {
    /// Header sits in the last sector and describes itself as the backup
    #[default]
    Backup,
    /// Header describes itself as the primary at LBA 1
    Primary,
}

/// Byte offsets of every field the relocation engine touches
///
/// All offsets are relative to the start of the trailing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptLayout {
    pub header_start: usize,
    pub header_len: usize,
    pub header_crc_offset: usize,
    pub current_lba_offset: usize,
    pub alternate_lba_offset: usize,
    pub last_usable_offset: usize,
    pub entry_array_lba_offset: usize,
    pub entry_array_crc_offset: usize,
    pub entry_array_crc_len: usize,
    pub trailing_sectors: u64,
    pub reserved_backup_sectors: u64,
    pub role: HeaderRole,
}

impl Default for GptLayout {
    fn default() -> Self {
        Self::for_trailing_sectors(TRAILING_REGION_SECTORS)
    }
}

impl GptLayout {
    /// Standard GPT header field positions with the header in the last
    /// sector of a trailing image of `trailing_sectors`
    pub fn for_trailing_sectors(trailing_sectors: u64) -> Self {
        let header_start = (trailing_sectors.saturating_sub(1) * SECTOR_SIZE as u64) as usize;
        Self {
            header_start,
            header_len: HEADER_LEN,
            header_crc_offset: header_start + HEADER_CRC_FIELD,
            current_lba_offset: header_start + CURRENT_LBA_FIELD,
            alternate_lba_offset: header_start + ALTERNATE_LBA_FIELD,
            last_usable_offset: header_start + LAST_USABLE_LBA_FIELD,
            entry_array_lba_offset: header_start + ENTRY_ARRAY_LBA_FIELD,
            entry_array_crc_offset: header_start + ENTRY_ARRAY_CRC_FIELD,
            entry_array_crc_len: ENTRY_ARRAY_CRC_LENGTH,
            trailing_sectors,
            reserved_backup_sectors: trailing_sectors + 1,
            role: HeaderRole::Backup,
        }
    }

    pub fn with_entry_array_crc_len(mut self, len: usize) -> Self {
        self.entry_array_crc_len = len;
        self
    }

    pub fn with_role(mut self, role: HeaderRole) -> Self {
        self.role = role;
        self
    }

    /// Minimum image length that covers every touched offset
    pub fn min_image_len(&self) -> usize {
        [
            self.header_start + self.header_len,
            self.header_crc_offset + 4,
            self.current_lba_offset + 4,
            self.alternate_lba_offset + 4,
            self.last_usable_offset + 4,
            self.entry_array_lba_offset + 4,
            self.entry_array_crc_offset + 4,
            self.entry_array_crc_len,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    /// Check that the layout agrees with where write-back places the image
    ///
    /// The header CRC field must lie inside the header range, and the
    /// reserved tail must match the trailing region the image is written to,
    /// otherwise the header's self-described LBAs point at the wrong sectors.
    pub fn check_consistency(&self, regions: &RegionLayout) -> Result<()> {
        let header_range = self.header_start..self.header_start + self.header_len;
        if !header_range.contains(&self.header_crc_offset)
            || !header_range.contains(&(self.header_crc_offset + 3))
        {
            return Err(Error::LayoutMismatch(format!(
                "header CRC field {:#x} outside header {:#x}..{:#x}",
                self.header_crc_offset, header_range.start, header_range.end
            )));
        }
        if self.trailing_sectors != regions.trailing_sectors
            || self.reserved_backup_sectors != regions.trailing_sectors + 1
        {
            return Err(Error::LayoutMismatch(format!(
                "header expects a {}-sector tail ({} reserved), regions use {}",
                self.trailing_sectors, self.reserved_backup_sectors, regions.trailing_sectors
            )));
        }
        if self.min_image_len() > regions.trailing_bytes() {
            return Err(Error::LayoutMismatch(format!(
                "fields reach byte {:#x}, trailing image is only {:#x} bytes",
                self.min_image_len(),
                regions.trailing_bytes()
            )));
        }
        Ok(())
    }
}
