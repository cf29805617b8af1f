use spi_nand::SpiNand;

/// Concrete type that implements all the flash device features
/// for the MT29F series of single plane SPI NAND flash devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MT29F<const B: u32, const ID: u8>();

/// Specific flash device with block count and ID
pub type MT29F1G01 = MT29F<1024, 0x14>;

impl<const B: u32, const ID: u8> MT29F<B, ID> {
    /// Creates a new instance of the MT29F flash device.
    pub fn new() -> Self {
        Self()
    }
}

impl<const B: u32, const ID: u8> Default for MT29F<B, ID> {
    fn default() -> Self {
        Self::new()
    }
}

// 2048 byte pages with a 128 byte spare area
impl<const B: u32, const ID: u8> SpiNand for MT29F<B, ID> {
    const PAGE_SIZE: u32 = 2048;
    const OOB_SIZE: u32 = 128;
    const PAGES_PER_BLOCK: u32 = 64;
    const BLOCK_COUNT: u32 = B;
    const JEDEC_MANUFACTURER_ID: u8 = 0x2C;
    const JEDEC_DEVICE_ID: u8 = ID;
    // The upper half of the spare area holds the on-chip ECC parity
    const OOB_TAGS_SIZE: u32 = 60;
}

// Implement blocking trait
mod blocking {
    use super::MT29F;
    use embedded_hal::spi::SpiDevice;
    use spi_nand::cmd_blocking::SpiNandBlocking;

    impl<SPI: SpiDevice, const B: u32, const ID: u8> SpiNandBlocking<SPI> for MT29F<B, ID> {}
}
