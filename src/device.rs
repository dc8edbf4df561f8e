use crate::error::{Error, Result};
use crate::geometry::SECTOR_SIZE;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Wrapper around a block device or image file for sector-based I/O
///
/// Sectors are always 512 bytes; devices reporting anything else are
/// rejected by the geometry resolver before a `Device` is used for a run.
pub struct Device {
    file: File,
    path: PathBuf,
    total_sectors: u64,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("total_sectors", &self.total_sectors)
            .finish_non_exhaustive()
    }
}

impl Device {
    fn open_impl<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path_buf)
            .map_err(|_| Error::DeviceNotFound(path_buf.display().to_string()))?;

        let size = byte_len(&file)?;

        Ok(Self {
            file,
            path: path_buf,
            total_sectors: size / SECTOR_SIZE as u64,
        })
    }

    /// Open a device or image file for read/write access
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, true)
    }

    /// Open a device in read-only mode
    pub fn open_readonly<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_impl(path, false)
    }

    /// Get total number of 512-byte sectors
    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    /// Read `count` sectors starting at `start_sector`
    pub fn read_sectors(&self, start_sector: u64, count: u64) -> Result<Vec<u8>> {
        let offset = start_sector * SECTOR_SIZE as u64;
        let size = (count * SECTOR_SIZE as u64) as usize;
        let mut buffer = vec![0u8; size];

        self.file.read_exact_at(&mut buffer, offset)?;
        Ok(buffer)
    }

    /// Write sectors starting at the given sector number
    ///
    /// `data` must be a whole number of sectors.
    pub fn write_sectors(&self, start_sector: u64, data: &[u8]) -> Result<()> {
        if data.len() % SECTOR_SIZE as usize != 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "Data size {} is not a multiple of sector size {}",
                    data.len(),
                    SECTOR_SIZE
                ),
            )));
        }
        let offset = start_sector * SECTOR_SIZE as u64;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Flush all writes to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Length of a regular file, or of a block device via seek-to-end
fn byte_len(file: &File) -> Result<u64> {
    let metadata = file.metadata()?;
    if metadata.is_file() {
        Ok(metadata.len())
    } else {
        let mut f = file.try_clone()?;
        Ok(f.seek(SeekFrom::End(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_device_open_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 1024 * 1024]).unwrap();

        let device = Device::open(file.path()).unwrap();
        assert_eq!(device.total_sectors(), 2048);
    }

    #[test]
    fn test_device_read_write() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 64 * 512]).unwrap();

        let device = Device::open(file.path()).unwrap();

        let pattern = vec![0xAB; 2 * 512];
        device.write_sectors(10, &pattern).unwrap();

        assert_eq!(device.read_sectors(10, 2).unwrap(), pattern);
        assert_eq!(device.read_sectors(9, 1).unwrap(), vec![0u8; 512]);
        assert_eq!(device.read_sectors(12, 1).unwrap(), vec![0u8; 512]);
    }

    #[test]
    fn test_partial_sector_write_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 4 * 512]).unwrap();

        let device = Device::open(file.path()).unwrap();
        assert!(device.write_sectors(0, &[1u8; 100]).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        let err = Device::open_readonly("/nonexistent/gptclone-device").unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }
}
