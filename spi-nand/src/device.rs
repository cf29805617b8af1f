use core::fmt::Debug;

use embedded_hal::spi::SpiDevice;
use embedded_nand::{BlockIndex, PageIndex};

use crate::{
    cmd_blocking::SpiNandBlocking, error::SpiFlashError, register::Status, PageRegion,
    PageRegionMut,
};

use super::JedecID;

/// Concrete type that owns the SPI transport and the flash device description.
///
/// This type is generic over the SPI peripheral and the flash device.
/// The commands themselves live in [SpiNandBlocking], configured by the
/// [crate::SpiNand] constants of the device. [SpiNandDevice] adds the checks of
/// the erase and program fail bits, turning them into
/// [SpiFlashError::EraseFailed] and [SpiFlashError::ProgramFailed].
///
/// [SpiNandDevice] implements [embedded_nand::ChunkDriver], which is what a
/// log structured filesystem drives.
///
/// The device D must implement [SpiNandBlocking] and SPI must implement
/// [embedded_hal::spi::SpiDevice], such as [crate::bus::SpiNandBus].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiNandDevice<SPI, D> {
    pub spi: SPI,
    pub device: D,
}
// Manually implement Debug to avoid bounds on SPI
// D must implement Debug, which should be fine as its just data
impl<SPI, D> Debug for SpiNandDevice<SPI, D>
where
    D: Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpiNandDevice")
            .field("device", &self.device)
            .finish()
    }
}

impl<SPI, D> SpiNandDevice<SPI, D> {
    /// Create a new [SpiNandDevice] with the given SPI peripheral and flash device.
    pub fn new(spi: SPI, device: D) -> Self {
        SpiNandDevice { spi, device }
    }

    /// Give back the SPI peripheral
    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice, D: SpiNandBlocking<SPI>> SpiNandDevice<SPI, D> {
    /// Reset, identify and configure the device
    pub fn init(&mut self) -> Result<JedecID, SpiFlashError<SPI::Error>> {
        self.device.init(&mut self.spi)
    }

    /// Get the Jedec ID of the flash device
    pub fn jedec(&mut self) -> Result<JedecID, SpiFlashError<SPI::Error>> {
        self.device.read_jedec_id_cmd(&mut self.spi)
    }

    /// Reset the flash device and wait for it to be ready
    pub fn reset(&mut self) -> Result<(), SpiFlashError<SPI::Error>> {
        self.device.reset_cmd(&mut self.spi)?;
        self.device.wait_not_busy(&mut self.spi).map(|_| ())
    }

    pub fn status(&mut self) -> Result<Status, SpiFlashError<SPI::Error>> {
        self.device.status(&mut self.spi)
    }

    /// Turn on-chip ECC on or off, returning the previous state
    pub fn set_ecc_enabled(&mut self, enable: bool) -> Result<bool, SpiFlashError<SPI::Error>> {
        self.device.set_ecc_enabled(&mut self.spi, enable)
    }

    /// Read regions of a page.
    ///
    /// The returned status carries the ECC outcome, an uncorrectable page
    /// still fills the buffers.
    pub fn read_page(
        &mut self,
        page: PageIndex,
        regions: &mut [PageRegionMut<'_>],
    ) -> Result<Status, SpiFlashError<SPI::Error>> {
        self.device.read_page(&mut self.spi, page, regions)
    }

    /// Program regions of a page.
    /// Must erase the block first.
    pub fn write_page(
        &mut self,
        page: PageIndex,
        regions: &[PageRegion<'_>],
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        let status = self.device.write_page(&mut self.spi, page, regions)?;
        if status.program_fail() {
            error!("Program of page {} failed", page.as_u32());
            return Err(SpiFlashError::ProgramFailed);
        }
        Ok(())
    }

    /// Erase a block of flash memory
    pub fn erase_block(&mut self, block: BlockIndex) -> Result<(), SpiFlashError<SPI::Error>> {
        let status = self.device.erase_block(&mut self.spi, block)?;
        if status.erase_fail() {
            error!("Erase of block {} failed", block.as_u16());
            return Err(SpiFlashError::EraseFailed);
        }
        Ok(())
    }

    /// True if the block does not carry a bad block marker
    pub fn check_block_ok(&mut self, block: BlockIndex) -> Result<bool, SpiFlashError<SPI::Error>> {
        self.device.check_block_ok(&mut self.spi, block)
    }

    /// Write the bad block marker of a block
    pub fn mark_block_bad(&mut self, block: BlockIndex) -> Result<(), SpiFlashError<SPI::Error>> {
        let status = self.device.mark_block_bad(&mut self.spi, block)?;
        if status.program_fail() {
            error!("Bad block marker write to block {} failed", block.as_u16());
            return Err(SpiFlashError::ProgramFailed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimNand, TestChip};
    use embedded_nand::ColumnAddress;
    use test_log::test;

    fn device() -> SpiNandDevice<SimNand<TestChip>, TestChip> {
        let mut flash = SpiNandDevice::new(SimNand::new(), TestChip);
        flash.init().unwrap();
        flash
    }

    #[test]
    fn write_page_reports_program_fail() {
        struct LockedChip;
        impl crate::SpiNand for LockedChip {
            const PAGE_SIZE: u32 = TestChip::PAGE_SIZE;
            const OOB_SIZE: u32 = TestChip::OOB_SIZE;
            const PAGES_PER_BLOCK: u32 = TestChip::PAGES_PER_BLOCK;
            const BLOCK_COUNT: u32 = TestChip::BLOCK_COUNT;
            const JEDEC_MANUFACTURER_ID: u8 = TestChip::JEDEC_MANUFACTURER_ID;
            const JEDEC_DEVICE_ID: u8 = TestChip::JEDEC_DEVICE_ID;
        }
        // Never lifts the block protection
        impl<SPI: SpiDevice> SpiNandBlocking<SPI> for LockedChip {
            fn unlock_all_blocks(&self, _spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
                Ok(())
            }
        }

        let mut flash = SpiNandDevice::new(SimNand::<LockedChip>::new(), LockedChip);
        flash.init().unwrap();
        let err = flash
            .write_page(PageIndex::new(1), &[PageRegion::new(ColumnAddress::new(0), &[0])])
            .unwrap_err();
        assert!(matches!(err, SpiFlashError::ProgramFailed));
        let err = flash.erase_block(BlockIndex::new(0)).unwrap_err();
        assert!(matches!(err, SpiFlashError::EraseFailed));
        let err = flash.mark_block_bad(BlockIndex::new(0)).unwrap_err();
        assert!(matches!(err, SpiFlashError::ProgramFailed));
    }

    #[test]
    fn write_read_erase() {
        let mut flash = device();
        let page = PageIndex::new(65);
        flash
            .write_page(page, &[PageRegion::new(ColumnAddress::new(10), b"abc")])
            .unwrap();
        let mut buf = [0; 4];
        let status = flash
            .read_page(page, &mut [PageRegionMut::new(ColumnAddress::new(9), &mut buf)])
            .unwrap();
        assert!(!status.program_fail());
        assert_eq!(&buf, b"\xFFabc");

        flash.erase_block(BlockIndex::new(1)).unwrap();
        flash
            .read_page(page, &mut [PageRegionMut::new(ColumnAddress::new(9), &mut buf)])
            .unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn reset_waits_for_ready() {
        let mut flash = SpiNandDevice::new(SimNand::<TestChip>::new().with_busy_polls(4), TestChip);
        flash.reset().unwrap();
        assert_eq!(flash.spi.count(0x0F), 5);
        assert_eq!(flash.jedec().unwrap(), JedecID::new(0x2C, 0x14));
        assert_eq!(flash.spi.busy_violations, 0);
    }
}
