use crate::cancel::CancelToken;
use crate::clone::{Progress, Region, Stage};
use crate::copier::{run_transfer, BlockCopier, Direction, TransferRequest};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::geometry::DiskGeometry;
use crate::gpt::{self, GptLayout, RegionLayout};
use std::fs;
use std::path::Path;
use tracing::info;

/// Write the leading image at sector 0 and the relocated trailing image at
/// `target_total_sectors - trailing_sectors`
///
/// Target size and image sizes are checked before the first write. The
/// leading image is always written before the trailing one, so a device
/// never carries the new GPT tail without its data.
///
/// Whoever calls this must already have the user's consent to overwrite
/// `target`.
#[allow(clippy::too_many_arguments)]
pub fn write_back(
    copier: &dyn BlockCopier,
    target: &Path,
    leading_image: &Path,
    relocated_image: &Path,
    regions: &RegionLayout,
    target_total_sectors: u64,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(Progress),
) -> Result<()> {
    let minimum = regions.minimum_sectors();
    if target_total_sectors < minimum {
        return Err(Error::DeviceTooSmall {
            target: target_total_sectors,
            minimum,
        });
    }

    check_image_len(leading_image, regions.leading_bytes())?;
    check_image_len(relocated_image, regions.trailing_bytes() as u64)?;

    let trailing_start = regions.trailing_start(target_total_sectors);
    let steps = [
        (Region::Leading, leading_image, 0, regions.leading_sectors),
        (
            Region::Trailing,
            relocated_image,
            trailing_start,
            regions.trailing_sectors,
        ),
    ];

    for (region, image, offset_sectors, length_sectors) in steps {
        info!(
            device = %target.display(),
            offset = offset_sectors,
            sectors = length_sectors,
            "writing {}",
            region
        );
        let request = TransferRequest {
            device: target.to_path_buf(),
            image: image.to_path_buf(),
            offset_sectors,
            length_sectors,
            direction: Direction::ImageToDevice,
        };
        run_transfer(copier, &request, cancel, |p| {
            progress(Progress {
                stage: Stage::WriteBack,
                region,
                sectors_done: p.sectors_done,
                sectors_total: p.sectors_total,
            })
        })
        .map_err(wrap_write_error)?;
    }

    Ok(())
}

/// Read the trailing region back from `target` and compare it with the
/// relocated image
pub fn verify_trailing(
    target: &Path,
    relocated_image: &Path,
    regions: &RegionLayout,
    target_total_sectors: u64,
) -> Result<()> {
    let expected = fs::read(relocated_image)?;
    let device = Device::open_readonly(target)?;
    let on_disk = device
        .read_sectors(
            regions.trailing_start(target_total_sectors),
            regions.trailing_sectors,
        )
        .map_err(wrap_write_error)?;

    if on_disk != expected {
        let first_diff = on_disk
            .iter()
            .zip(expected.iter())
            .position(|(a, b)| a != b)
            .unwrap_or(on_disk.len().min(expected.len()));
        return Err(Error::WriteBack(format!(
            "read-back of trailing region differs at byte {:#x}",
            first_diff
        )));
    }

    info!(device = %target.display(), "trailing region verified");
    Ok(())
}

/// Check that a relocated image was produced for a target of
/// `target_total_sectors` before it is written there
///
/// Both checksums must validate and the self-described LBAs must match the
/// target geometry, otherwise the header would point past the disk end.
pub fn check_relocated_image(
    relocated_image: &Path,
    target_total_sectors: u64,
    layout: &GptLayout,
) -> Result<()> {
    let image = fs::read(relocated_image)?;
    let target = DiskGeometry::new(target_total_sectors);
    let report = gpt::verify(&image, Some(&target), layout)?;
    if !report.checksums_valid() {
        return Err(Error::LayoutMismatch(format!(
            "{} has invalid checksums",
            relocated_image.display()
        )));
    }
    if !report.lbas_match() {
        return Err(Error::LayoutMismatch(format!(
            "{} was relocated for a different target (last usable LBA {}, expected {})",
            relocated_image.display(),
            report.last_usable_lba,
            report.expected.map_or(0, |lbas| lbas.last_usable)
        )));
    }
    Ok(())
}

fn check_image_len(image: &Path, expected: u64) -> Result<()> {
    let actual = fs::metadata(image)
        .map_err(|e| Error::WriteBack(format!("cannot stat {}: {}", image.display(), e)))?
        .len();
    if actual != expected {
        return Err(Error::WriteBack(format!(
            "{} is {} bytes, expected {}",
            image.display(),
            actual,
            expected
        )));
    }
    Ok(())
}

fn wrap_write_error(e: Error) -> Error {
    match e {
        Error::Cancelled | Error::WriteBack(_) | Error::DeviceTooSmall { .. } => e,
        other => Error::WriteBack(other.to_string()),
    }
}
