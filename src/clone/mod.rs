pub mod capture;
pub mod orchestrator;
pub mod writeback;

pub use capture::*;
pub use orchestrator::*;
pub use writeback::*;

use crate::gpt::{GptLayout, RegionLayout};
use std::path::{Path, PathBuf};

/// Leading image file name inside the work directory
pub const LEADING_IMAGE: &str = "leading.bin";
/// Trailing image as captured from the source
pub const TRAILING_IMAGE: &str = "trailing.bin";
/// Trailing image after relocation for the target
pub const RELOCATED_IMAGE: &str = "trailing.relocated.bin";

/// Long-running stages, and the relocation step between them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Relocate,
    WriteBack,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Capture => write!(f, "capture"),
            Stage::Relocate => write!(f, "relocate"),
            Stage::WriteBack => write!(f, "write-back"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Leading,
    Trailing,
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Region::Leading => write!(f, "leading image"),
            Region::Trailing => write!(f, "trailing GPT"),
        }
    }
}

/// Progress of one region transfer
///
/// Every transfer first reports `sectors_done == 0`, then once per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub region: Region,
    pub sectors_done: u64,
    pub sectors_total: u64,
}

/// Options for a clone run
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Directory holding the captured and relocated images
    pub work_dir: PathBuf,
    pub regions: RegionLayout,
    pub gpt: GptLayout,
    /// Read the trailing region back after writing and compare
    pub verify: bool,
    /// Keep image files after a completed run
    pub keep_images: bool,
}

impl CloneOptions {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            work_dir: work_dir.as_ref().to_path_buf(),
            regions: RegionLayout::default(),
            gpt: GptLayout::default(),
            verify: false,
            keep_images: false,
        }
    }

    pub fn regions(mut self, regions: RegionLayout) -> Self {
        self.regions = regions;
        self
    }

    pub fn gpt_layout(mut self, gpt: GptLayout) -> Self {
        self.gpt = gpt;
        self
    }

    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn keep_images(mut self, keep: bool) -> Self {
        self.keep_images = keep;
        self
    }

    pub fn leading_path(&self) -> PathBuf {
        self.work_dir.join(LEADING_IMAGE)
    }

    pub fn trailing_path(&self) -> PathBuf {
        self.work_dir.join(TRAILING_IMAGE)
    }

    pub fn relocated_path(&self) -> PathBuf {
        self.work_dir.join(RELOCATED_IMAGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_options() {
        let opts = CloneOptions::new("/tmp/run").verify(true);

        assert!(opts.verify);
        assert!(!opts.keep_images);
        assert_eq!(opts.regions, RegionLayout::default());
        assert_eq!(opts.leading_path(), Path::new("/tmp/run/leading.bin"));
        assert_eq!(
            opts.relocated_path(),
            Path::new("/tmp/run/trailing.relocated.bin")
        );
    }
}
