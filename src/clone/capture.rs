use crate::cancel::CancelToken;
use crate::clone::{Progress, Region, Stage, LEADING_IMAGE, TRAILING_IMAGE};
use crate::copier::{run_transfer, BlockCopier, Direction, TransferRequest};
use crate::error::{Error, Result};
use crate::gpt::RegionLayout;
use std::path::{Path, PathBuf};
use tracing::info;

/// Image files produced by a capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImages {
    pub leading: PathBuf,
    pub trailing: PathBuf,
    pub regions: RegionLayout,
    /// First source sector of the trailing region
    pub trailing_skip: u64,
}

/// Copy the leading and trailing regions of `source` into `work_dir`
///
/// The leading region is always finished before the trailing one starts.
/// Collaborator failures are reported as `Error::Capture`; cancellation
/// passes through as `Error::Cancelled`.
pub fn capture(
    copier: &dyn BlockCopier,
    source: &Path,
    regions: &RegionLayout,
    source_total_sectors: u64,
    work_dir: &Path,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(Progress),
) -> Result<CapturedImages> {
    if source_total_sectors < regions.minimum_sectors() {
        return Err(Error::Capture(format!(
            "source has {} sectors, layout needs at least {}",
            source_total_sectors,
            regions.minimum_sectors()
        )));
    }

    let leading = work_dir.join(LEADING_IMAGE);
    let trailing = work_dir.join(TRAILING_IMAGE);
    let trailing_skip = regions.trailing_start(source_total_sectors);

    let steps = [
        (Region::Leading, leading.clone(), 0, regions.leading_sectors),
        (
            Region::Trailing,
            trailing.clone(),
            trailing_skip,
            regions.trailing_sectors,
        ),
    ];

    for (region, image, offset_sectors, length_sectors) in steps {
        info!(
            source = %source.display(),
            offset = offset_sectors,
            sectors = length_sectors,
            "capturing {}",
            region
        );
        let request = TransferRequest {
            device: source.to_path_buf(),
            image,
            offset_sectors,
            length_sectors,
            direction: Direction::DeviceToImage,
        };
        run_transfer(copier, &request, cancel, |p| {
            progress(Progress {
                stage: Stage::Capture,
                region,
                sectors_done: p.sectors_done,
                sectors_total: p.sectors_total,
            })
        })
        .map_err(wrap_capture_error)?;
    }

    Ok(CapturedImages {
        leading,
        trailing,
        regions: *regions,
        trailing_skip,
    })
}

fn wrap_capture_error(e: Error) -> Error {
    match e {
        Error::Cancelled | Error::Capture(_) => e,
        other => Error::Capture(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copier::SectorCopier;
    use tempfile::TempDir;

    fn small_regions() -> RegionLayout {
        RegionLayout {
            leading_sectors: 8,
            trailing_sectors: 3,
        }
    }

    #[test]
    fn test_capture_both_regions() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source.img");
        let data: Vec<u8> = (0..40 * 512).map(|i| (i / 512) as u8).collect();
        std::fs::write(&source, data).unwrap();

        let mut events = Vec::new();
        let images = capture(
            &SectorCopier::new(4),
            &source,
            &small_regions(),
            40,
            dir.path(),
            &CancelToken::new(),
            &mut |p| events.push(p),
        )
        .unwrap();

        assert_eq!(images.trailing_skip, 37);
        let leading = std::fs::read(&images.leading).unwrap();
        let trailing = std::fs::read(&images.trailing).unwrap();
        assert_eq!(leading.len(), 8 * 512);
        assert_eq!(leading[7 * 512], 7);
        assert_eq!(trailing.len(), 3 * 512);
        assert_eq!(trailing[0], 37);
        assert_eq!(trailing[2 * 512], 39);

        // Leading events all precede trailing events
        let first_trailing = events
            .iter()
            .position(|p| p.region == Region::Trailing)
            .unwrap();
        assert!(events[..first_trailing]
            .iter()
            .all(|p| p.region == Region::Leading));
        assert_eq!(events.last().unwrap().sectors_done, 3);
    }

    #[test]
    fn test_source_too_small() {
        let dir = TempDir::new().unwrap();
        let err = capture(
            &SectorCopier::default(),
            &dir.path().join("missing.img"),
            &small_regions(),
            10,
            dir.path(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Capture(_)));
    }

    #[test]
    fn test_unreadable_source_is_capture_error() {
        let dir = TempDir::new().unwrap();
        let err = capture(
            &SectorCopier::default(),
            &dir.path().join("missing.img"),
            &small_regions(),
            40,
            dir.path(),
            &CancelToken::new(),
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, Error::Capture(msg) if msg.contains("not found")));
    }
}
