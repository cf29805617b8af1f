use core::fmt::Debug;
use embedded_nand::{BlockIndex, NandFlashError, NandFlashErrorKind};

use crate::JedecID;

/// Error type for the SPI NAND driver.
///
/// It is generic over the SPI error type (SE), which allows for different SPI implementations.
/// With [crate::bus::SpiNandBus] this is a [crate::bus::TransportError].
///
/// Device reported failures ([SpiFlashError::EraseFailed], [SpiFlashError::ProgramFailed])
/// are kept apart from failures of the bus itself ([SpiFlashError::SPI]).
#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiFlashError<SE> {
    /// Error from the SPI peripheral
    #[error("SpiDevice error: {0:?}")]
    SPI(SE),
    /// Block Erase failed.
    /// This can happen if the block is protected, write is disabled or block has failed.
    #[error("Erase failed")]
    EraseFailed,
    /// Program failed.
    /// This can happen if the write is disabled, block is protected or the block has failed.
    #[error("Program failed")]
    ProgramFailed,
    /// Device kept reporting an operation in progress
    #[error("Device busy for longer than the poll budget")]
    BusyTimeout,
    /// Read ID returned a different part
    #[error("Expected device {expected}, found {found}")]
    IdentityMismatch { expected: JedecID, found: JedecID },
    /// Block carries a bad block marker
    #[error("Block {0} is marked bad")]
    BadBlock(BlockIndex),
    /// Requested bytes out of bounds
    #[error("Requested bytes out of bounds")]
    OutOfBounds,
    /// Page write without any region to program
    #[error("No regions given")]
    NoRegions,
    /// Data phase does not match the command
    #[error("Data direction does not match command")]
    DirectionMismatch,
    /// Quad commands need a four line transport
    #[error("Quad I/O not supported by transport")]
    QuadNotSupported,
}

// Convert from SPI error to more generic NandFlashError
impl<SE: Debug> NandFlashError for SpiFlashError<SE> {
    fn kind(&self) -> NandFlashErrorKind {
        match self {
            SpiFlashError::SPI(_) => NandFlashErrorKind::Transport,
            SpiFlashError::EraseFailed => NandFlashErrorKind::BlockFail(None),
            SpiFlashError::ProgramFailed => NandFlashErrorKind::BlockFail(None),
            SpiFlashError::BusyTimeout => NandFlashErrorKind::Timeout,
            SpiFlashError::IdentityMismatch { .. } => NandFlashErrorKind::Identity,
            SpiFlashError::BadBlock(block) => NandFlashErrorKind::BadBlock(*block),
            SpiFlashError::OutOfBounds => NandFlashErrorKind::OutOfBounds,
            SpiFlashError::NoRegions
            | SpiFlashError::DirectionMismatch
            | SpiFlashError::QuadNotSupported => NandFlashErrorKind::Other,
        }
    }
}
