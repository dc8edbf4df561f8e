use thiserror::Error;

/// All errors that can occur while cloning a drive
#[derive(Debug, Error)]
pub enum Error {
    #[error("Device '{0}' not found or cannot be opened")]
    DeviceNotFound(String),

    #[error("Device query failed for '{device}': {reason}")]
    DeviceQuery { device: String, reason: String },

    #[error("Device sector size {0} is not supported (expected 512)")]
    UnsupportedSectorSize(u32),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Trailing image is malformed: {needed} bytes required, {actual} available")]
    MalformedImage { needed: usize, actual: usize },

    #[error("GPT layout is inconsistent: {0}")]
    LayoutMismatch(String),

    #[error("Value {value} for {field} does not fit the 32-bit header field")]
    SizeExceeded { field: &'static str, value: u64 },

    #[error("Write-back failed: {0}")]
    WriteBack(String),

    #[error("Target device is too small ({target} sectors < {minimum} sectors needed)")]
    DeviceTooSmall { target: u64, minimum: u64 },

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Cannot {action} while run is {state}")]
    InvalidTransition {
        action: &'static str,
        state: String,
    },

    #[error("A clone run is already in progress ({0})")]
    RunInProgress(String),

    #[error("Device '{0}' is in use by another clone run")]
    DeviceBusy(String),

    #[error("Source and target are the same device: {0}")]
    SameDevice(String),

    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors raised before a stage issued any write
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::MalformedImage { .. }
                | Error::LayoutMismatch(_)
                | Error::SizeExceeded { .. }
                | Error::DeviceTooSmall { .. }
                | Error::InvalidTransition { .. }
                | Error::RunInProgress(_)
                | Error::DeviceBusy(_)
                | Error::SameDevice(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
