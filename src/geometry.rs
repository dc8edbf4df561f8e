use crate::error::{Error, Result};
use crate::system::{get_block_device_size, get_logical_sector_size};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// The only supported sector size
pub const SECTOR_SIZE: u32 = 512;

/// Sector count and sector size of a device, fixed for the duration of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub total_sectors: u64,
    pub sector_size: u32,
}

impl DiskGeometry {
    pub fn new(total_sectors: u64) -> Self {
        Self {
            total_sectors,
            sector_size: SECTOR_SIZE,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors * self.sector_size as u64
    }
}

impl std::fmt::Display for DiskGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sectors x {} bytes ({:.2} GiB)",
            self.total_sectors,
            self.sector_size,
            self.size_bytes() as f64 / (1024.0 * 1024.0 * 1024.0)
        )
    }
}

/// Source of a textual device report
pub trait DeviceInfo: Send + Sync {
    fn report(&self, device: &Path) -> Result<String>;
}

/// Device info from `fdisk -l <device>`
#[derive(Debug, Default, Clone, Copy)]
pub struct FdiskInfo;

impl DeviceInfo for FdiskInfo {
    fn report(&self, device: &Path) -> Result<String> {
        let output = Command::new("fdisk")
            .arg("-l")
            .arg(device)
            .env("LC_ALL", "C")
            .output()
            .map_err(|e| Error::DeviceQuery {
                device: device.display().to_string(),
                reason: format!("failed to run fdisk: {}", e),
            })?;

        if !output.status.success() {
            return Err(Error::DeviceQuery {
                device: device.display().to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Device info from the size ioctls, rendered in the `fdisk -l` format
///
/// Works for regular image files too, which makes it the fallback when
/// fdisk is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockDeviceInfo;

impl DeviceInfo for BlockDeviceInfo {
    fn report(&self, device: &Path) -> Result<String> {
        let query_error = |e: Error| Error::DeviceQuery {
            device: device.display().to_string(),
            reason: e.to_string(),
        };
        let bytes = get_block_device_size(device).map_err(query_error)?;
        let sector_size = get_logical_sector_size(device).map_err(query_error)?;

        Ok(format!(
            "Disk {}: {} bytes, {} sectors\nSector size (logical/physical): {} bytes / {} bytes\n",
            device.display(),
            bytes,
            bytes / sector_size as u64,
            sector_size,
            sector_size
        ))
    }
}

/// Query `device` and parse its geometry
///
/// The collaborator returns an `fdisk -l` style report; sizes reported as
/// bytes only are converted at 512 bytes per sector.
pub fn resolve(info: &dyn DeviceInfo, device: &Path) -> Result<DiskGeometry> {
    let report = info.report(device)?;
    let geometry = parse_report(&report).map_err(|reason| match reason {
        ReportError::SectorSize(size) => Error::UnsupportedSectorSize(size),
        ReportError::Unparsable(reason) => Error::DeviceQuery {
            device: device.display().to_string(),
            reason,
        },
    })?;
    debug!(device = %device.display(), %geometry, "resolved geometry");
    Ok(geometry)
}

#[derive(Debug, PartialEq)]
enum ReportError {
    SectorSize(u32),
    Unparsable(String),
}

/// Parse the `Disk ...:` and `Sector size` lines of an fdisk report
fn parse_report(report: &str) -> std::result::Result<DiskGeometry, ReportError> {
    let mut total_bytes = None;
    let mut total_sectors = None;
    let mut sector_size = None;

    for line in report.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Disk ") {
            // "Disk /dev/sdb: 931.51 GiB, 1000204886016 bytes, 1953525168 sectors"
            if total_bytes.is_some() || !rest.contains("bytes") {
                continue;
            }
            let Some((_, fields)) = rest.split_once(": ") else {
                continue;
            };
            for field in fields.split(',') {
                let mut words = field.split_whitespace();
                match (words.next(), words.next()) {
                    (Some(n), Some("bytes")) => total_bytes = n.parse::<u64>().ok(),
                    (Some(n), Some("sectors")) => total_sectors = n.parse::<u64>().ok(),
                    _ => {}
                }
            }
        } else if let Some(rest) = line.strip_prefix("Sector size") {
            // "Sector size (logical/physical): 512 bytes / 4096 bytes"
            let value = rest
                .split_once(':')
                .and_then(|(_, v)| v.split_whitespace().next())
                .and_then(|n| n.parse::<u32>().ok());
            sector_size = Some(value.ok_or_else(|| {
                ReportError::Unparsable(format!("bad sector size line: {}", line))
            })?);
        }
    }

    let sector_size = sector_size.unwrap_or(SECTOR_SIZE);
    if sector_size != SECTOR_SIZE {
        return Err(ReportError::SectorSize(sector_size));
    }

    let total_sectors = match (total_sectors, total_bytes) {
        (Some(sectors), _) => sectors,
        (None, Some(bytes)) => bytes / sector_size as u64,
        (None, None) => {
            return Err(ReportError::Unparsable(
                "no disk size line in device report".to_string(),
            ))
        }
    };

    if total_sectors == 0 {
        return Err(ReportError::Unparsable("device reports zero sectors".to_string()));
    }

    Ok(DiskGeometry {
        total_sectors,
        sector_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const FDISK_REPORT: &str = "\
Disk /dev/sdb: 931.51 GiB, 1000204886016 bytes, 1953525168 sectors
Disk model: Samsung SSD 860
Units: sectors of 1 * 512 = 512 bytes
Sector size (logical/physical): 512 bytes / 4096 bytes
I/O size (minimum/optimal): 4096 bytes / 4096 bytes
Disklabel type: gpt
Disk identifier: 6D3E2B0A-9C71-4F39-8E2E-6F7B0C1D2E3F
";

    struct StaticInfo(&'static str);

    impl DeviceInfo for StaticInfo {
        fn report(&self, _device: &Path) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_parse_fdisk_report() {
        let geometry = parse_report(FDISK_REPORT).unwrap();
        assert_eq!(geometry.total_sectors, 1_953_525_168);
        assert_eq!(geometry.sector_size, 512);
    }

    #[test]
    fn test_parse_bytes_only() {
        let geometry = parse_report("Disk /dev/sdc: 500107862016 bytes\n").unwrap();
        assert_eq!(geometry.total_sectors, 976_773_168);
    }

    #[test]
    fn test_reject_4k_sectors() {
        let report = "Disk /dev/sdd: 4000787030016 bytes, 976754646 sectors\n\
                      Sector size (logical/physical): 4096 bytes / 4096 bytes\n";
        let err = resolve(&StaticInfo(report), Path::new("/dev/sdd")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSectorSize(4096)));
    }

    #[test]
    fn test_reject_garbage_report() {
        let err = resolve(&StaticInfo("fdisk: cannot open /dev/sdz\n"), Path::new("/dev/sdz"))
            .unwrap_err();
        assert!(matches!(err, Error::DeviceQuery { .. }));
    }

    #[test]
    fn test_block_device_info_on_image_file() {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(2048 * 512).unwrap();

        let geometry = resolve(&BlockDeviceInfo, file.path()).unwrap();
        assert_eq!(geometry, DiskGeometry::new(2048));
    }

    #[test]
    fn test_block_device_info_missing_device() {
        let err = resolve(&BlockDeviceInfo, Path::new("/nonexistent/disk")).unwrap_err();
        assert!(matches!(err, Error::DeviceQuery { .. }));
    }
}
