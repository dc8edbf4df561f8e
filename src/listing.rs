use crate::error::{Error, Result};
use std::process::Command;

/// A block device as reported by the listing collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub device_id: String,
    pub size_bytes: u64,
    pub kind: String,
}

impl std::fmt::Display for DeviceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:<20} {:>10.2} GiB  {}",
            self.device_id,
            self.size_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            self.kind
        )
    }
}

pub trait DeviceLister {
    fn list(&self) -> Result<Vec<DeviceEntry>>;
}

/// Whole-disk listing from `lsblk`
#[derive(Debug, Default, Clone, Copy)]
pub struct LsblkLister;

impl DeviceLister for LsblkLister {
    fn list(&self) -> Result<Vec<DeviceEntry>> {
        let output = Command::new("lsblk")
            .args(["-b", "-d", "-n", "-r", "-o", "PATH,SIZE,TYPE"])
            .output()
            .map_err(|e| Error::DeviceQuery {
                device: "lsblk".to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::DeviceQuery {
                device: "lsblk".to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_lsblk(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `lsblk -r -o PATH,SIZE,TYPE` output, skipping malformed lines
fn parse_lsblk(output: &str) -> Vec<DeviceEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device_id = fields.next()?;
            let size_bytes = fields.next()?.parse().ok()?;
            let kind = fields.next()?;
            Some(DeviceEntry {
                device_id: device_id.to_string(),
                size_bytes,
                kind: kind.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lsblk() {
        let out = "/dev/sda 500107862016 disk\n\
                   /dev/sdb 1000204886016 disk\n\
                   /dev/loop0 65536 loop\n\
                   garbage\n";
        let devices = parse_lsblk(out);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].device_id, "/dev/sda");
        assert_eq!(devices[0].size_bytes, 500_107_862_016);
        assert_eq!(devices[2].kind, "loop");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_lsblk("").is_empty());
    }
}
