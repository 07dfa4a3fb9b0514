//! Log-structured key-value store for a two-region NOR flash swap area.
//!
//! Records append to the active region and every on-flash state transition
//! is a single-bit clear, so the store recovers from power loss at any
//! write. [`Store`] carries the operational API; [`flash::FlashDevice`] is
//! the seam a platform implements over its raw flash, with an in-memory
//! model and a file-backed image shipping for hosts and tests.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod error;
pub mod flash;
pub mod layout;
pub mod store;

pub use error::StoreError;
pub use flash::{
    FileFlash, FlashDevice, FlashError, FlashGeometry, FlashImage, FlashOp, MemFlash,
    SharedMemFlash,
};
pub use layout::{
    RecordHeader, SwapHeader, MAX_VALUE_LENGTH, RECORD_HEADER_SIZE, SWAP_HEADER_SIZE, WORD_SIZE,
};
pub use store::Store;
