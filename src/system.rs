use crate::error::{Error, Result};
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Check if a device (or one of its partitions) is currently mounted
///
/// On Linux, this parses /proc/mounts. A mount entry for `/dev/sdb1` counts
/// as mounted for `/dev/sdb`, since writing the whole disk would clobber it.
pub fn check_not_mounted(device_path: impl AsRef<Path>) -> Result<()> {
    let device_path = resolve_device_path(device_path.as_ref());

    let mounts = fs::read_to_string("/proc/mounts").map_err(|e| {
        Error::Io(std::io::Error::other(format!(
            "Failed to read /proc/mounts: {}",
            e
        )))
    })?;

    for line in mounts.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 || !parts[0].starts_with('/') {
            continue;
        }
        let resolved_mount = resolve_device_path(Path::new(parts[0]));
        if resolved_mount == device_path || is_partition_of(&resolved_mount, &device_path) {
            return Err(Error::DeviceBusy(format!(
                "{} (mounted at {})",
                resolved_mount, parts[1]
            )));
        }
    }

    Ok(())
}

/// `/dev/sdb1` of `/dev/sdb`, `/dev/nvme0n1p2` of `/dev/nvme0n1`
fn is_partition_of(candidate: &str, disk: &str) -> bool {
    match candidate.strip_prefix(disk) {
        Some(rest) => {
            let rest = rest.strip_prefix('p').unwrap_or(rest);
            !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Resolve a device path to its canonical form
///
/// This handles symlinks (e.g., /dev/disk/by-id/... -> /dev/sda)
pub fn resolve_device_path(path: &Path) -> String {
    match path.canonicalize() {
        Ok(canonical) => canonical.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

/// Check if running as root (required for block device access)
pub fn check_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get the size of a block device in bytes
#[cfg(target_os = "linux")]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
    if file.metadata()?.is_file() {
        return Ok(file.metadata()?.len());
    }

    let mut size: u64 = 0;

    // BLKGETSIZE64 = 0x80081272
    // Cast to Ioctl type (i32 on musl, u64 on glibc)
    #[allow(overflowing_literals)]
    const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

    if result == -1 {
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        Ok(file.seek(SeekFrom::End(0))?)
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::io::{Seek, SeekFrom};

    let path = path.as_ref();
    let mut file =
        File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
    Ok(file.seek(SeekFrom::End(0))?)
}

/// Get the logical sector size of a block device
///
/// Regular files report 512.
#[cfg(target_os = "linux")]
pub fn get_logical_sector_size(path: impl AsRef<Path>) -> Result<u32> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;
    if file.metadata()?.is_file() {
        return Ok(512);
    }

    let mut size: libc::c_int = 0;

    // BLKSSZGET = 0x1268
    const BLKSSZGET: libc::Ioctl = 0x1268 as libc::Ioctl;

    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
    if result == -1 || size <= 0 {
        return Err(Error::DeviceQuery {
            device: path.display().to_string(),
            reason: "BLKSSZGET ioctl failed".to_string(),
        });
    }
    Ok(size as u32)
}

#[cfg(not(target_os = "linux"))]
pub fn get_logical_sector_size(_path: impl AsRef<Path>) -> Result<u32> {
    Ok(512)
}

/// Exclusive advisory lock on a device, held for the lifetime of a run
///
/// Released when dropped (the descriptor is closed).
#[derive(Debug)]
pub struct DeviceLock {
    _file: File,
    path: PathBuf,
}

impl DeviceLock {
    /// Take a non-blocking exclusive `flock` on the device
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).map_err(|_| Error::DeviceNotFound(path.display().to_string()))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == -1 {
            return Err(Error::DeviceBusy(path.display().to_string()));
        }

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
