pub mod header;
pub mod layout;
pub mod relocate;

pub use header::{TrailingHeader, GPT_SIGNATURE};
pub use layout::{
    GptLayout, HeaderRole, RegionLayout, ENTRY_ARRAY_CRC_LENGTH, FIRST_REGION_SECTORS,
    REFERENCE_SOURCE_SECTORS, RESERVED_BACKUP_SECTORS, TRAILING_REGION_SECTORS,
};
pub use relocate::{relocate, verify, RelocatedLbas, TrailingReport};
