use crate::cancel::CancelToken;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::geometry::SECTOR_SIZE;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::debug;

/// 1 MiB
pub const DEFAULT_CHUNK_SECTORS: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read device sectors into the image file
    DeviceToImage,
    /// Write the image file onto device sectors
    ImageToDevice,
}

/// One contiguous copy between a device range and a whole image file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub device: PathBuf,
    pub image: PathBuf,
    /// First device sector of the range
    pub offset_sectors: u64,
    pub length_sectors: u64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub sectors_done: u64,
    pub sectors_total: u64,
}

/// A running transfer
///
/// Moves one chunk per `next_event` call, so the caller sees a progress
/// event after every chunk and can stop between any two.
pub trait Transfer: Send {
    /// Copy the next chunk and report progress
    ///
    /// Returns `None` once the transfer has completed successfully or has
    /// been terminated. An `Err` ends the transfer.
    fn next_event(&mut self) -> Option<Result<TransferProgress>>;

    /// Stop the transfer; data already copied stays where it is
    fn terminate(&mut self);
}

pub trait BlockCopier: Send + Sync {
    fn begin(&self, request: &TransferRequest) -> Result<Box<dyn Transfer>>;
}

/// In-process copier using positioned reads and writes
#[derive(Debug, Clone, Copy)]
pub struct SectorCopier {
    chunk_sectors: u64,
}

impl Default for SectorCopier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SECTORS)
    }
}

impl SectorCopier {
    pub fn new(chunk_sectors: u64) -> Self {
        Self {
            chunk_sectors: chunk_sectors.max(1),
        }
    }
}

impl BlockCopier for SectorCopier {
    fn begin(&self, request: &TransferRequest) -> Result<Box<dyn Transfer>> {
        let (device, image) = match request.direction {
            Direction::DeviceToImage => {
                let device = Device::open_readonly(&request.device)?;
                let image = File::create(&request.image)?;
                (device, image)
            }
            Direction::ImageToDevice => {
                let device = Device::open(&request.device)?;
                let image = OpenOptions::new().read(true).open(&request.image)?;
                let image_len = image.metadata()?.len();
                let expected = request.length_sectors * SECTOR_SIZE as u64;
                if image_len != expected {
                    return Err(Error::ShortTransfer {
                        expected,
                        actual: image_len,
                    });
                }
                (device, image)
            }
        };

        let end = request.offset_sectors + request.length_sectors;
        if end > device.total_sectors() {
            return Err(Error::ShortTransfer {
                expected: end * SECTOR_SIZE as u64,
                actual: device.total_sectors() * SECTOR_SIZE as u64,
            });
        }

        debug!(
            device = %request.device.display(),
            image = %request.image.display(),
            offset = request.offset_sectors,
            length = request.length_sectors,
            direction = ?request.direction,
            "transfer started"
        );

        Ok(Box::new(ChunkedTransfer {
            device,
            image,
            request: request.clone(),
            chunk_sectors: self.chunk_sectors,
            done: 0,
            finished: false,
        }))
    }
}

struct ChunkedTransfer {
    device: Device,
    image: File,
    request: TransferRequest,
    chunk_sectors: u64,
    done: u64,
    finished: bool,
}

impl ChunkedTransfer {
    fn copy_chunk(&mut self, count: u64) -> Result<()> {
        let device_sector = self.request.offset_sectors + self.done;
        let image_offset = self.done * SECTOR_SIZE as u64;

        match self.request.direction {
            Direction::DeviceToImage => {
                let data = self.device.read_sectors(device_sector, count)?;
                self.image.write_all_at(&data, image_offset)?;
            }
            Direction::ImageToDevice => {
                let mut data = vec![0u8; (count * SECTOR_SIZE as u64) as usize];
                self.image.read_exact_at(&mut data, image_offset)?;
                self.device.write_sectors(device_sector, &data)?;
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        match self.request.direction {
            Direction::DeviceToImage => self.image.sync_all()?,
            Direction::ImageToDevice => self.device.sync()?,
        }
        Ok(())
    }
}

impl Transfer for ChunkedTransfer {
    fn next_event(&mut self) -> Option<Result<TransferProgress>> {
        if self.finished {
            return None;
        }

        let total = self.request.length_sectors;
        if self.done >= total {
            self.finished = true;
            return self.flush().err().map(Err);
        }

        let count = self.chunk_sectors.min(total - self.done);
        match self.copy_chunk(count) {
            Ok(()) => {
                self.done += count;
                Some(Ok(TransferProgress {
                    sectors_done: self.done,
                    sectors_total: total,
                }))
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    fn terminate(&mut self) {
        debug!(
            device = %self.request.device.display(),
            done = self.done,
            "transfer terminated"
        );
        self.finished = true;
    }
}

/// Drive a transfer to completion, checking `cancel` before every chunk
///
/// On cancellation the transfer is terminated and `Error::Cancelled`
/// returned; no further chunk is copied.
pub fn run_transfer(
    copier: &dyn BlockCopier,
    request: &TransferRequest,
    cancel: &CancelToken,
    mut on_progress: impl FnMut(TransferProgress),
) -> Result<()> {
    cancel.check()?;
    let mut transfer = copier.begin(request)?;

    on_progress(TransferProgress {
        sectors_done: 0,
        sectors_total: request.length_sectors,
    });

    loop {
        if cancel.is_cancelled() {
            transfer.terminate();
            return Err(Error::Cancelled);
        }
        match transfer.next_event() {
            Some(event) => on_progress(event?),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterned_device(dir: &TempDir, sectors: u64) -> PathBuf {
        let path = dir.path().join("disk.img");
        let data: Vec<u8> = (0..sectors * 512).map(|i| (i / 512) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_read_range_into_image() {
        let dir = TempDir::new().unwrap();
        let device = patterned_device(&dir, 64);
        let image = dir.path().join("tail.bin");

        let request = TransferRequest {
            device,
            image: image.clone(),
            offset_sectors: 54,
            length_sectors: 10,
            direction: Direction::DeviceToImage,
        };
        let mut seen = Vec::new();
        run_transfer(&SectorCopier::new(4), &request, &CancelToken::new(), |p| {
            seen.push(p.sectors_done)
        })
        .unwrap();

        assert_eq!(seen, vec![0, 4, 8, 10]);
        let data = std::fs::read(&image).unwrap();
        assert_eq!(data.len(), 10 * 512);
        assert_eq!(data[0], 54);
        assert_eq!(data[9 * 512], 63);
    }

    #[test]
    fn test_write_image_at_offset() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("target.img");
        std::fs::write(&device, vec![0u8; 32 * 512]).unwrap();
        let image = dir.path().join("chunk.bin");
        std::fs::write(&image, vec![0xCD; 3 * 512]).unwrap();

        let request = TransferRequest {
            device: device.clone(),
            image,
            offset_sectors: 29,
            length_sectors: 3,
            direction: Direction::ImageToDevice,
        };
        run_transfer(&SectorCopier::default(), &request, &CancelToken::new(), |_| {}).unwrap();

        let data = std::fs::read(&device).unwrap();
        assert!(data[..29 * 512].iter().all(|&b| b == 0));
        assert!(data[29 * 512..].iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_range_past_device_end() {
        let dir = TempDir::new().unwrap();
        let device = patterned_device(&dir, 16);

        let request = TransferRequest {
            device,
            image: dir.path().join("out.bin"),
            offset_sectors: 10,
            length_sectors: 10,
            direction: Direction::DeviceToImage,
        };
        let err = SectorCopier::default().begin(&request).err().unwrap();
        assert!(matches!(err, Error::ShortTransfer { .. }));
    }

    #[test]
    fn test_image_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let device = patterned_device(&dir, 16);
        let image = dir.path().join("short.bin");
        std::fs::write(&image, vec![0u8; 512]).unwrap();

        let request = TransferRequest {
            device,
            image,
            offset_sectors: 0,
            length_sectors: 2,
            direction: Direction::ImageToDevice,
        };
        let err = SectorCopier::default().begin(&request).err().unwrap();
        assert!(matches!(
            err,
            Error::ShortTransfer {
                expected: 1024,
                actual: 512
            }
        ));
    }

    #[test]
    fn test_cancel_stops_between_chunks() {
        let dir = TempDir::new().unwrap();
        let device = patterned_device(&dir, 64);
        let image = dir.path().join("lead.bin");
        let cancel = CancelToken::new();

        let request = TransferRequest {
            device,
            image: image.clone(),
            offset_sectors: 0,
            length_sectors: 64,
            direction: Direction::DeviceToImage,
        };
        let mut events = 0;
        let err = run_transfer(&SectorCopier::new(8), &request, &cancel, |p| {
            events += 1;
            if p.sectors_done == 16 {
                cancel.cancel();
            }
        })
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        // start event, then 8 and 16
        assert_eq!(events, 3);
        assert_eq!(std::fs::read(&image).unwrap().len(), 16 * 512);
    }

    #[test]
    fn test_cancel_before_first_chunk_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let device = dir.path().join("disk.img");
        std::fs::write(&device, vec![0u8; 32 * 512]).unwrap();
        let image = dir.path().join("tail.bin");
        std::fs::write(&image, vec![0xEE; 16 * 512]).unwrap();
        let cancel = CancelToken::new();

        let request = TransferRequest {
            device: device.clone(),
            image,
            offset_sectors: 8,
            length_sectors: 16,
            direction: Direction::ImageToDevice,
        };
        let mut events = Vec::new();
        let err = run_transfer(&SectorCopier::default(), &request, &cancel, |p| {
            events.push(p.sectors_done);
            cancel.cancel();
        })
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(events, vec![0]);
        assert!(std::fs::read(&device).unwrap().iter().all(|&b| b == 0));
    }
}
