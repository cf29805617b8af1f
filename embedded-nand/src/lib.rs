#![cfg_attr(not(test), no_std)]

//! Filesystem facing abstraction for NAND flash.
//!
//! A flash filesystem stores "chunks" of main data plus out-of-band tags and
//! talks to the hardware through the [ChunkDriver] callbacks. Drivers report
//! failures through an error type implementing [NandFlashError] and report
//! the ECC outcome of every read separately as an [EccResult].

// Must be first to share macros across crate
mod fmt;

mod address;
mod device;

pub use address::{BlockIndex, ColumnAddress, PageIndex};
pub use device::{ChunkDevice, DeviceParams, ParamsError};

pub trait NandFlashError: core::fmt::Debug {
    /// Convert a specific NAND flash error into a generic error kind
    fn kind(&self) -> NandFlashErrorKind;
}

/// A trait that NAND flash drivers can use to share an error type.
pub trait ErrorType {
    /// Errors returned by this NAND flash.
    type Error: NandFlashError;
}

/// NAND flash error kinds.
///
/// NAND flash implementations must map their error to those generic error kinds through the
/// [`NandFlashError`] trait.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum NandFlashErrorKind {
    /// The arguments are out of bounds.
    OutOfBounds,

    /// Block has failed during erase or program.
    /// Contains the failed block, or [None] if the specific block is unknown
    BlockFail(Option<BlockIndex>),

    /// Block carries a bad block marker and must not be used
    BadBlock(BlockIndex),

    /// The device did not become ready within its poll budget
    Timeout,

    /// The bus transfer itself failed
    Transport,

    /// The device did not identify as the expected part
    Identity,

    /// Error specific to the implementation.
    Other,
}

/// Outcome of the on-chip ECC for a read.
///
/// This is not an error: data is returned for every value and the
/// filesystem decides whether it can be trusted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EccResult {
    /// No errors detected
    #[default]
    NoError,
    /// Errors detected and corrected
    Corrected,
    /// Errors detected but not corrected
    Uncorrectable,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum BlockStatus {
    /// Bad block marker intact
    Ok,
    /// Marked as bad
    Failed,
}

impl BlockStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, BlockStatus::Ok)
    }
}

/// Driver callbacks consumed by a chunk based flash filesystem.
///
/// A chunk is exactly one physical page: the chunk index is the page index.
/// Every call is two valued, `Ok` or `Err`; reads additionally report the
/// ECC outcome through an out parameter.
///
/// Empty `data` or `oob` slices mean that part of the chunk is not transferred.
pub trait ChunkDriver: ErrorType {
    /// Main data bytes per chunk
    const DATA_BYTES_PER_CHUNK: usize;

    /// Out-of-band bytes per chunk available for filesystem tags
    const SPARE_BYTES_PER_CHUNK: usize;

    /// Chunks in an erase block
    const CHUNKS_PER_BLOCK: usize;

    /// Number of erase blocks in the device
    const BLOCK_COUNT: usize;

    /// Bring the device into a known, usable state
    fn initialise(&mut self) -> Result<(), Self::Error>;

    /// Release the device. Most drivers have nothing to tear down.
    fn deinitialise(&mut self) -> Result<(), Self::Error>;

    /// Program the data and tags of a chunk. The chunk must be erased.
    fn write_chunk(&mut self, chunk: PageIndex, data: &[u8], oob: &[u8])
        -> Result<(), Self::Error>;

    /// Read the data and tags of a chunk.
    ///
    /// `ecc` is updated whenever the device reported an ECC status, including
    /// when the transfer of the bytes failed afterwards. An uncorrectable
    /// ECC status is not an error.
    fn read_chunk(
        &mut self,
        chunk: PageIndex,
        data: &mut [u8],
        oob: &mut [u8],
        ecc: &mut EccResult,
    ) -> Result<(), Self::Error>;

    /// Erase a block, leaving all its bytes 0xFF
    fn erase_block(&mut self, block: BlockIndex) -> Result<(), Self::Error>;

    /// Write the bad block marker of a block
    fn mark_bad_block(&mut self, block: BlockIndex) -> Result<(), Self::Error>;

    /// `Ok` if the block is usable, an error of kind
    /// [NandFlashErrorKind::BadBlock] if it carries a bad block marker
    fn check_bad_block(&mut self, block: BlockIndex) -> Result<(), Self::Error>;

    /// Check the marker and report it as a [BlockStatus]
    fn block_status(&mut self, block: BlockIndex) -> Result<BlockStatus, Self::Error> {
        match self.check_bad_block(block) {
            Ok(()) => Ok(BlockStatus::Ok),
            Err(e) if matches!(e.kind(), NandFlashErrorKind::BadBlock(_)) => {
                Ok(BlockStatus::Failed)
            }
            Err(e) => Err(e),
        }
    }
}
