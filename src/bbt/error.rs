use thiserror::Error;

/// Everything that can go wrong while maintaining a bad block table
#[derive(Error, Debug)]
pub enum BbtError {
    /// The underlying block store failed; never retried at this layer
    #[error(transparent)]
    Io(#[from] anyhow::Error),

    #[error("no block available to hold a bad block table on target {target}")]
    NoFreeBlockForTable { target: u32 },

    #[error("no bad block table found on target {target}")]
    TableNotFound { target: u32 },

    #[error("bad block table geometry mismatch: expected {expected} bytes, found {found}")]
    GeometryMismatch { expected: usize, found: usize },

    #[error("target {target} out of range")]
    TargetOutOfRange { target: u32 },

    #[error("block {block} out of range on target {target}")]
    BlockOutOfRange { target: u32, block: u32 },

    #[error("target {target} has not been scanned")]
    TargetNotScanned { target: u32 },
}
