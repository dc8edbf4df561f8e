pub mod cancel;
pub mod clone;
pub mod copier;
pub mod device;
pub mod error;
pub mod geometry;
pub mod gpt;
pub mod listing;
pub mod system;

pub use cancel::CancelToken;
pub use clone::{CloneOptions, Orchestrator, Progress, Region, RunPhase, RunState, Stage};
pub use copier::{BlockCopier, SectorCopier};
pub use device::Device;
pub use error::{Error, Result};
pub use geometry::{BlockDeviceInfo, DeviceInfo, DiskGeometry, FdiskInfo};
pub use gpt::{relocate, verify, GptLayout, HeaderRole, RegionLayout, TrailingReport};
pub use listing::{DeviceEntry, DeviceLister, LsblkLister};
pub use system::{check_not_mounted, check_root, get_block_device_size};
