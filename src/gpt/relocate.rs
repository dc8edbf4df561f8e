use crate::error::{Error, Result};
use crate::geometry::DiskGeometry;
use crate::gpt::header::{entry_array_crc, header_crc, write_u32_le, TrailingHeader};
use crate::gpt::layout::{GptLayout, HeaderRole};
use tracing::debug;

/// Header LBA values computed for one target geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocatedLbas {
    pub last_usable: u32,
    pub current: u32,
    pub alternate: u32,
    pub entry_array: u32,
}

impl RelocatedLbas {
    /// Compute every geometry-dependent LBA, failing if one exceeds 32 bits
    pub fn for_geometry(target: &DiskGeometry, layout: &GptLayout) -> Result<Self> {
        let total = target.total_sectors;
        let minimum = layout.reserved_backup_sectors.max(layout.trailing_sectors);
        if total < minimum {
            return Err(Error::DeviceTooSmall {
                target: total,
                minimum,
            });
        }

        let last_usable = total - layout.reserved_backup_sectors;
        let (current, alternate, entry_array) = match layout.role {
            HeaderRole::Backup => (total - 1, 1, total - layout.trailing_sectors),
            HeaderRole::Primary => (1, total - 1, 2),
        };

        Ok(Self {
            last_usable: fit_u32("last usable LBA", last_usable)?,
            current: fit_u32("current header LBA", current)?,
            alternate: fit_u32("alternate header LBA", alternate)?,
            entry_array: fit_u32("entry array LBA", entry_array)?,
        })
    }
}

fn fit_u32(field: &'static str, value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::SizeExceeded { field, value })
}

/// Rewrite a trailing metadata image for a target of a different size
///
/// Works on a copy: the input is never modified, and nothing is returned
/// unless every field could be computed. The steps run in a fixed order
/// because later checksums cover earlier fields:
///
/// 1. last usable LBA
/// 2. entry array CRC32 over `[0, entry_array_crc_len)`
/// 3. current / alternate / entry array LBAs
/// 4. header CRC32 with its own field zeroed
pub fn relocate(
    trailing_image: &[u8],
    target: &DiskGeometry,
    layout: &GptLayout,
) -> Result<Vec<u8>> {
    let needed = layout.min_image_len();
    if trailing_image.len() < needed {
        return Err(Error::MalformedImage {
            needed,
            actual: trailing_image.len(),
        });
    }

    let lbas = RelocatedLbas::for_geometry(target, layout)?;

    let mut image = trailing_image.to_vec();

    write_u32_le(&mut image, layout.last_usable_offset, lbas.last_usable);

    let entries_crc = entry_array_crc(&image, layout);
    write_u32_le(&mut image, layout.entry_array_crc_offset, entries_crc);

    write_u32_le(&mut image, layout.current_lba_offset, lbas.current);
    write_u32_le(&mut image, layout.alternate_lba_offset, lbas.alternate);
    write_u32_le(&mut image, layout.entry_array_lba_offset, lbas.entry_array);

    write_u32_le(&mut image, layout.header_crc_offset, 0);
    let own_crc = header_crc(&image, layout);
    write_u32_le(&mut image, layout.header_crc_offset, own_crc);

    debug!(
        total_sectors = target.total_sectors,
        last_usable = lbas.last_usable,
        entries_crc,
        header_crc = own_crc,
        "relocated trailing image"
    );

    Ok(image)
}

/// Checksums and LBAs found in a trailing image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailingReport {
    pub has_signature: bool,
    pub header_crc_stored: u32,
    pub header_crc_computed: u32,
    pub entry_array_crc_stored: u32,
    pub entry_array_crc_computed: u32,
    pub current_lba: u32,
    pub alternate_lba: u32,
    pub last_usable_lba: u32,
    pub entry_array_lba: u32,
    /// LBAs the image should carry for the geometry it was checked against
    pub expected: Option<RelocatedLbas>,
}

impl TrailingReport {
    /// Both checksums match the bytes they cover
    pub fn checksums_valid(&self) -> bool {
        self.header_crc_stored == self.header_crc_computed
            && self.entry_array_crc_stored == self.entry_array_crc_computed
    }

    /// The LBA fields describe the geometry the image was checked against
    pub fn lbas_match(&self) -> bool {
        match self.expected {
            Some(expected) => {
                expected.last_usable == self.last_usable_lba
                    && expected.current == self.current_lba
                    && expected.alternate == self.alternate_lba
                    && expected.entry_array == self.entry_array_lba
            }
            None => true,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.checksums_valid() && self.lbas_match()
    }
}

impl std::fmt::Display for TrailingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ok = |good: bool| if good { "OK" } else { "MISMATCH" };

        writeln!(f, "Trailing GPT image")?;
        writeln!(f, "==================")?;
        writeln!(
            f,
            "Signature: {}",
            if self.has_signature { "EFI PART" } else { "missing" }
        )?;
        writeln!(
            f,
            "Header CRC32: stored {:#010x}, computed {:#010x} [{}]",
            self.header_crc_stored,
            self.header_crc_computed,
            ok(self.header_crc_stored == self.header_crc_computed)
        )?;
        writeln!(
            f,
            "Entry array CRC32: stored {:#010x}, computed {:#010x} [{}]",
            self.entry_array_crc_stored,
            self.entry_array_crc_computed,
            ok(self.entry_array_crc_stored == self.entry_array_crc_computed)
        )?;
        writeln!(f)?;
        writeln!(f, "LBAs:")?;
        writeln!(f, "  Current header: {}", self.current_lba)?;
        writeln!(f, "  Alternate header: {}", self.alternate_lba)?;
        writeln!(f, "  Last usable: {}", self.last_usable_lba)?;
        writeln!(f, "  Entry array: {}", self.entry_array_lba)?;
        if let Some(expected) = self.expected {
            writeln!(f)?;
            writeln!(
                f,
                "Expected for target: current {}, alternate {}, last usable {}, entry array {} [{}]",
                expected.current,
                expected.alternate,
                expected.last_usable,
                expected.entry_array,
                ok(self.lbas_match())
            )?;
        }
        Ok(())
    }
}

/// Inspect a trailing image without modifying it
///
/// With a `target`, the report also records the LBAs a correctly relocated
/// image would carry.
pub fn verify(
    trailing_image: &[u8],
    target: Option<&DiskGeometry>,
    layout: &GptLayout,
) -> Result<TrailingReport> {
    let header = TrailingHeader::new(trailing_image, layout).ok_or(Error::MalformedImage {
        needed: layout.min_image_len(),
        actual: trailing_image.len(),
    })?;

    let expected = target
        .map(|geometry| RelocatedLbas::for_geometry(geometry, layout))
        .transpose()?;

    Ok(TrailingReport {
        has_signature: header.has_signature(),
        header_crc_stored: header.header_crc(),
        header_crc_computed: header.compute_header_crc(),
        entry_array_crc_stored: header.entry_array_crc(),
        entry_array_crc_computed: header.compute_entry_array_crc(),
        current_lba: header.current_lba(),
        alternate_lba: header.alternate_lba(),
        last_usable_lba: header.last_usable_lba(),
        entry_array_lba: header.entry_array_lba(),
        expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpt::header::{read_u32_le, GPT_SIGNATURE};
    use crate::gpt::layout::{
        FIRST_REGION_SECTORS, REFERENCE_SOURCE_SECTORS, RESERVED_BACKUP_SECTORS,
        TRAILING_REGION_SECTORS,
    };

    /// A backup GPT tail as found on the reference source drive
    fn source_tail() -> Vec<u8> {
        let layout = GptLayout::default();
        let mut raw = vec![0u8; 5120];

        // A few partition entries with recognisable content
        for (i, entry) in raw[..0x1200].chunks_mut(128).take(12).enumerate() {
            entry[0] = 0xA2;
            entry[16] = i as u8 + 1;
            entry[32..40].copy_from_slice(&(2048u64 * (i as u64 + 1)).to_le_bytes());
            entry[56] = b'p';
        }

        let h = layout.header_start;
        raw[h..h + 8].copy_from_slice(GPT_SIGNATURE);
        raw[h + 8..h + 12].copy_from_slice(&0x0001_0000u32.to_le_bytes());
        raw[h + 12..h + 16].copy_from_slice(&92u32.to_le_bytes());
        write_u32_le(&mut raw, layout.current_lba_offset, 976_773_167);
        write_u32_le(&mut raw, layout.alternate_lba_offset, 1);
        write_u32_le(&mut raw, h + 0x28, 34);
        write_u32_le(&mut raw, layout.last_usable_offset, 976_773_157);
        raw[h + 0x38..h + 0x48].copy_from_slice(&[0x5A; 16]);
        write_u32_le(&mut raw, layout.entry_array_lba_offset, 976_773_158);
        write_u32_le(&mut raw, h + 0x50, 36);
        write_u32_le(&mut raw, h + 0x54, 128);
        raw
    }

    #[test]
    fn test_relocate_is_deterministic() {
        let layout = GptLayout::default();
        let target = DiskGeometry::new(1_953_458_176);
        let image = source_tail();

        let first = relocate(&image, &target, &layout).unwrap();
        let second = relocate(&image, &target, &layout).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_checksums_round_trip() {
        let layout = GptLayout::default();
        let target = DiskGeometry::new(1_953_458_176);
        let out = relocate(&source_tail(), &target, &layout).unwrap();

        let entries_crc = crc32fast::hash(&out[..layout.entry_array_crc_len]);
        assert_eq!(read_u32_le(&out, layout.entry_array_crc_offset), entries_crc);

        let mut header = out[layout.header_start..layout.header_start + layout.header_len].to_vec();
        let stored = read_u32_le(&header, 0x10);
        header[0x10..0x14].fill(0);
        assert_eq!(stored, crc32fast::hash(&header));

        assert!(verify(&out, Some(&target), &layout).unwrap().is_consistent());
    }

    #[test]
    fn test_last_usable_for_many_sizes() {
        let layout = GptLayout::default();
        let sizes = [
            FIRST_REGION_SECTORS + TRAILING_REGION_SECTORS,
            REFERENCE_SOURCE_SECTORS,
            1_953_458_176,
            u32::MAX as u64,
        ];
        for total in sizes {
            let out = relocate(&source_tail(), &DiskGeometry::new(total), &layout).unwrap();
            assert_eq!(
                read_u32_le(&out, layout.last_usable_offset) as u64,
                total - RESERVED_BACKUP_SECTORS,
                "total_sectors = {}",
                total
            );
        }
    }

    #[test]
    fn test_size_above_32_bits_rejected() {
        let layout = GptLayout::default();
        let err = relocate(
            &source_tail(),
            &DiskGeometry::new(u32::MAX as u64 + 100),
            &layout,
        )
        .unwrap_err();
        assert!(matches!(err, Error::SizeExceeded { .. }));
    }

    #[test]
    fn test_short_image_rejected() {
        let layout = GptLayout::default();
        let image = source_tail();
        let short = &image[..layout.min_image_len() - 1];

        let err = relocate(short, &DiskGeometry::new(1_953_458_176), &layout).unwrap_err();
        assert!(matches!(
            err,
            Error::MalformedImage { needed, actual } if needed == 0x1200 + 92 && actual == needed - 1
        ));
    }

    #[test]
    fn test_only_recomputed_fields_change() {
        let layout = GptLayout::default();
        let image = source_tail();
        let out = relocate(&image, &DiskGeometry::new(1_953_458_176), &layout).unwrap();

        let touched = [
            layout.header_crc_offset,
            layout.current_lba_offset,
            layout.alternate_lba_offset,
            layout.last_usable_offset,
            layout.entry_array_lba_offset,
            layout.entry_array_crc_offset,
        ];
        for (i, (a, b)) in image.iter().zip(out.iter()).enumerate() {
            let in_field = touched.iter().any(|&off| (off..off + 4).contains(&i));
            if !in_field {
                assert_eq!(a, b, "byte {:#x} changed", i);
            }
        }
        assert_eq!(out.len(), image.len());
    }

    #[test]
    fn test_backup_role_lbas() {
        let layout = GptLayout::default();
        let total = 1_953_458_176;
        let out = relocate(&source_tail(), &DiskGeometry::new(total), &layout).unwrap();
        let report = verify(&out, None, &layout).unwrap();

        assert_eq!(report.current_lba as u64, total - 1);
        assert_eq!(report.alternate_lba, 1);
        assert_eq!(report.entry_array_lba as u64, total - TRAILING_REGION_SECTORS);
        assert!(report.has_signature);
    }

    #[test]
    fn test_primary_role_lbas() {
        let layout = GptLayout::default().with_role(HeaderRole::Primary);
        let total = 1_953_458_176;
        let out = relocate(&source_tail(), &DiskGeometry::new(total), &layout).unwrap();
        let report = verify(&out, Some(&DiskGeometry::new(total)), &layout).unwrap();

        assert_eq!(report.current_lba, 1);
        assert_eq!(report.alternate_lba as u64, total - 1);
        assert_eq!(report.entry_array_lba, 2);
        assert!(report.is_consistent());
    }

    #[test]
    fn test_verify_detects_stale_image() {
        let layout = GptLayout::default();
        let report = verify(&source_tail(), Some(&DiskGeometry::new(1_953_458_176)), &layout)
            .unwrap();
        assert!(!report.checksums_valid());
        assert!(!report.lbas_match());
    }

    #[test]
    fn test_custom_entry_crc_length() {
        let layout = GptLayout::default().with_entry_array_crc_len(36 * 128);
        let out = relocate(&source_tail(), &DiskGeometry::new(1_953_458_176), &layout).unwrap();
        assert_eq!(
            read_u32_le(&out, layout.entry_array_crc_offset),
            crc32fast::hash(&out[..36 * 128])
        );
    }
}
