pub mod file;
pub mod mem;

pub use file::{FileFlash, FlashGeometry};
pub use mem::{FlashImage, FlashOp, MemFlash, SharedMemFlash};

use thiserror::Error;

/// Raw swap-area primitives supplied by the platform.
///
/// Two equal-sized regions exist, indexed 0 and 1. Write offsets and lengths
/// are multiples of the 4-byte flash word, and a write may only clear bits;
/// erasing a whole region is the only way back to all-ones.
pub trait FlashDevice {
    /// One-time platform initialization.
    fn init(&mut self) -> Result<(), FlashError>;

    /// Size in bytes of each swap region.
    fn swap_size(&self) -> u32;

    /// Erases an entire region to all-ones.
    fn erase(&mut self, region: u8) -> Result<(), FlashError>;

    fn read(&self, region: u8, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write(&mut self, region: u8, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("region index {0} out of range")]
    InvalidRegion(u8),
    #[error("access beyond region end: offset={offset} len={len} swap_size={swap_size}")]
    OutOfBounds {
        offset: u32,
        len: usize,
        swap_size: u32,
    },
    #[error("write not word-aligned: offset={offset} len={len}")]
    Misaligned { offset: u32, len: usize },
    #[error("image geometry mismatch: {0}")]
    Geometry(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
