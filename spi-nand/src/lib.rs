#![cfg_attr(not(test), no_std)]
// Must be first to share macros across crate
pub(crate) mod fmt;

pub mod bus;
mod chunk;
pub mod cmd_blocking;
pub mod command;
mod device;
pub mod error;
pub mod register;
mod region;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use device::SpiNandDevice;
pub use region::{PageRegion, PageRegionMut};

/// Core trait that a NAND flash device must implement.
///
/// Enables use of the [crate::cmd_blocking::SpiNandBlocking] trait.
///
/// At minimum requires the [SpiNand::PAGE_SIZE], [SpiNand::OOB_SIZE], [SpiNand::PAGES_PER_BLOCK]
/// and [SpiNand::BLOCK_COUNT] constants to define the size and layout of the device, and the
/// JEDEC constants to identify it.
///
/// Command opcodes are fixed by [crate::command::Command]. The spare area layout and
/// timing budget can be changed by overriding the defaults here.
pub trait SpiNand {
    // Device layout
    /// The size of the main data area of a page in bytes
    const PAGE_SIZE: u32;
    /// The size of the spare (out-of-band) area following the main data
    const OOB_SIZE: u32;
    /// The number of pages in a block
    const PAGES_PER_BLOCK: u32;
    /// The number of blocks in the device
    const BLOCK_COUNT: u32;
    /// The size of a block in bytes, main data only
    const BLOCK_SIZE: u32 = Self::PAGE_SIZE * Self::PAGES_PER_BLOCK;
    /// The total capacity of the device in bytes, main data only
    const CAPACITY: u32 = Self::PAGE_SIZE * Self::PAGES_PER_BLOCK * Self::BLOCK_COUNT;
    /// Number of addressable columns in a page, main data and spare
    const RAW_PAGE_SIZE: u32 = Self::PAGE_SIZE + Self::OOB_SIZE;

    // Identity
    /// First byte returned by read ID
    const JEDEC_MANUFACTURER_ID: u8;
    /// Second byte returned by read ID
    const JEDEC_DEVICE_ID: u8;

    // Spare area layout
    /// Column of the bad block marker in the first page of a block
    const BAD_BLOCK_MARKER_OFFSET: u16 = Self::PAGE_SIZE as u16;
    /// Length of the bad block marker. A block is good when all of them are 0xFF
    const BAD_BLOCK_MARKER_LEN: usize = 2;
    /// Column where filesystem tags are stored
    const OOB_TAGS_OFFSET: u16 = Self::PAGE_SIZE as u16 + 4;
    /// Bytes available for filesystem tags
    const OOB_TAGS_SIZE: u32 = Self::OOB_SIZE - 4;

    // Timing
    /// Status polls allowed while waiting for an operation to complete
    const BUSY_POLL_LIMIT: u32 = 100_000;
}

/// Manufacturer and device bytes returned by the read ID command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JedecID {
    /// JEDEC manufacturer ID
    pub manufacturer: u8,
    /// The device id
    pub device: u8,
}

impl JedecID {
    pub fn new(manufacturer: u8, device: u8) -> Self {
        JedecID {
            manufacturer,
            device,
        }
    }

    /// The ID a device `D` is expected to report
    pub fn of<D: SpiNand + ?Sized>() -> Self {
        JedecID::new(D::JEDEC_MANUFACTURER_ID, D::JEDEC_DEVICE_ID)
    }
}

impl core::fmt::Display for JedecID {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02X},{:02X}", self.manufacturer, self.device)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for JedecID {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "JedecID(manufacturer: {:02X}, device: {:02X})",
            self.manufacturer,
            self.device
        );
    }
}
