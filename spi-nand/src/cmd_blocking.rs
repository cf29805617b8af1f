use embedded_hal::spi::SpiDevice;
use embedded_nand::{BlockIndex, ColumnAddress, PageIndex};

use crate::{
    command::{execute, Command, Data},
    error::SpiFlashError,
    register::{BlockLock, Configuration, FeatureAddress, FeatureRegister, Status, WritableRegister},
    JedecID, PageRegion, PageRegionMut, SpiNand,
};

/// Longest bad block marker supported by the default bad block functions
pub const MAX_MARKER_LEN: usize = 8;

/// Blocking SPI NAND flash trait.
/// Contains the single transaction commands, and the compound operations built
/// from them: page reads and writes, block erase, bad block handling and the
/// initialisation sequence.
///
/// Compound operations wait for the device to be ready with a bounded status
/// poll ([SpiNand::BUSY_POLL_LIMIT]) and return the final [Status]. Checking the
/// erase and program fail bits is left to the caller, see [crate::SpiNandDevice].
///
/// The default implementations are fairly generic and should work for most SPI NAND flash devices.
/// Look to make changes to the [SpiNand] trait first to change the default behavior.
/// If this isn't possible, override the default function(s).
pub trait SpiNandBlocking<SPI: SpiDevice>: SpiNand {
    // ============= Commands =============

    /// Issue a reset command to the flash device
    fn reset_cmd(&self, spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(spi, Command::Reset, 0, Data::None)
    }

    /// Read the manufacturer and device ID bytes
    fn read_jedec_id_cmd(&self, spi: &mut SPI) -> Result<JedecID, SpiFlashError<SPI::Error>> {
        let mut buf = [0; 2];
        execute(spi, Command::ReadId, 0, Data::Receive(&mut buf))?;
        Ok(JedecID::new(buf[0], buf[1]))
    }

    /// Set the write enable latch
    fn write_enable_cmd(&self, spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(spi, Command::WriteEnable, 0, Data::None)
    }

    /// Clear the write enable latch
    fn write_disable_cmd(&self, spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(spi, Command::WriteDisable, 0, Data::None)
    }

    /// Read a feature register
    fn get_feature_cmd(
        &self,
        spi: &mut SPI,
        address: FeatureAddress,
    ) -> Result<u8, SpiFlashError<SPI::Error>> {
        let mut buf = [0; 1];
        execute(
            spi,
            Command::GetFeature,
            address.as_u8() as u32,
            Data::Receive(&mut buf),
        )?;
        Ok(buf[0])
    }

    /// Write a feature register
    fn set_feature_cmd(
        &self,
        spi: &mut SPI,
        address: FeatureAddress,
        value: u8,
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(
            spi,
            Command::SetFeature,
            address.as_u8() as u32,
            Data::Transmit(&[value]),
        )
    }

    /// Read a page into the device cache
    fn page_read_cmd(&self, spi: &mut SPI, page: PageIndex) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(spi, Command::PageReadToCache, page.as_u32(), Data::None)
    }

    /// Read bytes from the device cache starting at `column`
    fn read_cache_cmd(
        &self,
        spi: &mut SPI,
        column: ColumnAddress,
        buf: &mut [u8],
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(
            spi,
            Command::ReadFromCache,
            column.as_u16() as u32,
            Data::Receive(buf),
        )
    }

    /// Erase a block. The address sent is the first page of the block.
    ///
    /// Use [SpiNandBlocking::write_enable_cmd] before this command
    fn erase_block_cmd(&self, spi: &mut SPI, block: BlockIndex) -> Result<(), SpiFlashError<SPI::Error>> {
        let page = block.first_page(Self::PAGES_PER_BLOCK);
        execute(spi, Command::BlockErase, page.as_u32(), Data::None)
    }

    /// Write bytes to the device cache.
    ///
    /// This will reset the rest of the cache to 0xFF
    ///
    /// Use [SpiNandBlocking::program_random_load_cmd] to write without resetting
    ///
    /// Use [SpiNandBlocking::program_execute_cmd] to write the cache to a page
    fn program_load_cmd(
        &self,
        spi: &mut SPI,
        column: ColumnAddress,
        buf: &[u8],
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(
            spi,
            Command::ProgramLoad,
            column.as_u16() as u32,
            Data::Transmit(buf),
        )
    }

    /// Write bytes to the device cache, keeping what was loaded before
    fn program_random_load_cmd(
        &self,
        spi: &mut SPI,
        column: ColumnAddress,
        buf: &[u8],
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(
            spi,
            Command::ProgramLoadRandom,
            column.as_u16() as u32,
            Data::Transmit(buf),
        )
    }

    /// Write the device cache to a page
    ///
    /// Use [SpiNandBlocking::write_enable_cmd] before this command
    fn program_execute_cmd(&self, spi: &mut SPI, page: PageIndex) -> Result<(), SpiFlashError<SPI::Error>> {
        execute(spi, Command::ProgramExecute, page.as_u32(), Data::None)
    }

    // ============= Feature registers ============

    /// Read and decode a feature register
    fn read_register<R: FeatureRegister>(&self, spi: &mut SPI) -> Result<R, SpiFlashError<SPI::Error>> {
        Ok(R::from(self.get_feature_cmd(spi, R::ADDRESS)?))
    }

    /// Encode and write a feature register
    fn write_register<R: WritableRegister>(
        &self,
        spi: &mut SPI,
        value: R,
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        self.set_feature_cmd(spi, R::ADDRESS, value.into())
    }

    fn status(&self, spi: &mut SPI) -> Result<Status, SpiFlashError<SPI::Error>> {
        self.read_register(spi)
    }

    fn block_lock(&self, spi: &mut SPI) -> Result<BlockLock, SpiFlashError<SPI::Error>> {
        self.read_register(spi)
    }

    fn set_block_lock(&self, spi: &mut SPI, value: BlockLock) -> Result<(), SpiFlashError<SPI::Error>> {
        self.write_register(spi, value)
    }

    fn configuration(&self, spi: &mut SPI) -> Result<Configuration, SpiFlashError<SPI::Error>> {
        self.read_register(spi)
    }

    fn set_configuration(
        &self,
        spi: &mut SPI,
        value: Configuration,
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        self.write_register(spi, value)
    }

    /// Lift the protection of every block
    fn unlock_all_blocks(&self, spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
        self.set_block_lock(spi, BlockLock::all_unlocked())
    }

    /// Protect every block
    fn lock_all_blocks(&self, spi: &mut SPI) -> Result<(), SpiFlashError<SPI::Error>> {
        self.set_block_lock(spi, BlockLock::all_locked())
    }

    fn ecc_enabled(&self, spi: &mut SPI) -> Result<bool, SpiFlashError<SPI::Error>> {
        Ok(self.configuration(spi)?.ecc_enable())
    }

    /// Turn on-chip ECC on or off, returning the previous state.
    ///
    /// The configuration register is only written when the state changes.
    /// Its other bits are written back as read.
    fn set_ecc_enabled(&self, spi: &mut SPI, enable: bool) -> Result<bool, SpiFlashError<SPI::Error>> {
        let config = self.configuration(spi)?;
        let previous = config.ecc_enable();
        if previous != enable {
            debug!("ECC {}", if enable { "enabled" } else { "disabled" });
            self.set_configuration(spi, config.with_ecc_enable(enable))?;
        }
        Ok(previous)
    }

    // ============= Busy wait ============

    /// Poll the status register until the operation in progress bit clears.
    ///
    /// Returns the final status and the number of polls that reported busy.
    /// Fails with [SpiFlashError::BusyTimeout] after [SpiNand::BUSY_POLL_LIMIT]
    /// busy polls.
    fn wait_not_busy_counted(&self, spi: &mut SPI) -> Result<(Status, u32), SpiFlashError<SPI::Error>> {
        let mut polls = 0;
        loop {
            let status = self.status(spi)?;
            if !status.is_busy() {
                trace!("Ready after {} busy polls", polls);
                return Ok((status, polls));
            }
            if polls >= Self::BUSY_POLL_LIMIT {
                warn!("Device still busy after {} polls", polls);
                return Err(SpiFlashError::BusyTimeout);
            }
            polls += 1;
        }
    }

    /// Poll the status register until the device is ready
    fn wait_not_busy(&self, spi: &mut SPI) -> Result<Status, SpiFlashError<SPI::Error>> {
        self.wait_not_busy_counted(spi).map(|(status, _)| status)
    }

    // ============= Page and block operations =============

    /// Load a page into the device cache and wait for it.
    ///
    /// The returned status carries the ECC outcome of the load.
    fn load_page(&self, spi: &mut SPI, page: PageIndex) -> Result<Status, SpiFlashError<SPI::Error>> {
        check_page::<Self, _>(page)?;
        self.page_read_cmd(spi, page)?;
        self.wait_not_busy(spi)
    }

    /// Copy regions of the device cache into the region buffers
    fn read_cache(
        &self,
        spi: &mut SPI,
        regions: &mut [PageRegionMut<'_>],
    ) -> Result<(), SpiFlashError<SPI::Error>> {
        for region in regions.iter() {
            check_region::<Self, _>(region.column, region.data.len())?;
        }
        for region in regions.iter_mut() {
            self.read_cache_cmd(spi, region.column, region.data)?;
        }
        Ok(())
    }

    /// Read regions of a page
    fn read_page(
        &self,
        spi: &mut SPI,
        page: PageIndex,
        regions: &mut [PageRegionMut<'_>],
    ) -> Result<Status, SpiFlashError<SPI::Error>> {
        for region in regions.iter() {
            check_region::<Self, _>(region.column, region.data.len())?;
        }
        let status = self.load_page(spi, page)?;
        self.read_cache(spi, regions)?;
        Ok(status)
    }

    /// Program regions of a page in one program operation.
    ///
    /// The first region is loaded with program load, which resets the cache
    /// to 0xFF, the rest with random program load. Bytes outside the regions
    /// are left unprogrammed. The block must be erased first.
    fn write_page(
        &self,
        spi: &mut SPI,
        page: PageIndex,
        regions: &[PageRegion<'_>],
    ) -> Result<Status, SpiFlashError<SPI::Error>> {
        check_page::<Self, _>(page)?;
        let (first, rest) = regions.split_first().ok_or(SpiFlashError::NoRegions)?;
        for region in regions {
            check_region::<Self, _>(region.column, region.data.len())?;
        }
        trace!("Programming {} regions of page {}", regions.len(), page.as_u32());
        self.write_enable_cmd(spi)?;
        self.unlock_all_blocks(spi)?;
        self.program_load_cmd(spi, first.column, first.data)?;
        for region in rest {
            self.program_random_load_cmd(spi, region.column, region.data)?;
        }
        self.program_execute_cmd(spi, page)?;
        self.wait_not_busy(spi)
    }

    /// Erase a block, leaving every byte 0xFF
    fn erase_block(&self, spi: &mut SPI, block: BlockIndex) -> Result<Status, SpiFlashError<SPI::Error>> {
        check_block::<Self, _>(block)?;
        debug!("Erasing block {}", block.as_u16());
        self.write_enable_cmd(spi)?;
        self.unlock_all_blocks(spi)?;
        self.erase_block_cmd(spi, block)?;
        self.wait_not_busy(spi)
    }

    // ============ Bad Block functions ============

    /// Check the bad block marker in the spare area of the first page.
    ///
    /// Returns true if every marker byte is 0xFF
    fn check_block_ok(&self, spi: &mut SPI, block: BlockIndex) -> Result<bool, SpiFlashError<SPI::Error>> {
        check_block::<Self, _>(block)?;
        let len = marker_len::<Self>();
        let mut marker = [0; MAX_MARKER_LEN];
        self.read_page(
            spi,
            block.first_page(Self::PAGES_PER_BLOCK),
            &mut [PageRegionMut::new(
                ColumnAddress::new(Self::BAD_BLOCK_MARKER_OFFSET),
                &mut marker[..len],
            )],
        )?;
        let ok = marker[..len].iter().all(|&b| b == 0xFF);
        if !ok {
            debug!("Block {} is marked bad", block.as_u16());
        }
        Ok(ok)
    }

    /// Write zeros over the bad block marker of a block.
    ///
    /// On-chip ECC is disabled for the write, since the marker is written on
    /// top of existing data, and restored to its previous state afterwards
    /// even when the write fails. A write error takes precedence over a
    /// restore error.
    fn mark_block_bad(&self, spi: &mut SPI, block: BlockIndex) -> Result<Status, SpiFlashError<SPI::Error>> {
        check_block::<Self, _>(block)?;
        warn!("Marking block {} bad", block.as_u16());
        let config = self.configuration(spi)?;
        let zeros = [0; MAX_MARKER_LEN];
        let written = if config.ecc_enable() {
            self.set_configuration(spi, config.with_ecc_enable(false))
        } else {
            Ok(())
        }
        .and_then(|()| {
            self.write_page(
                spi,
                block.first_page(Self::PAGES_PER_BLOCK),
                &[PageRegion::new(
                    ColumnAddress::new(Self::BAD_BLOCK_MARKER_OFFSET),
                    &zeros[..marker_len::<Self>()],
                )],
            )
        });
        let restored = if config.ecc_enable() {
            self.set_configuration(spi, config)
        } else {
            Ok(())
        };
        let status = written?;
        restored?;
        Ok(status)
    }

    // ============ Initialisation ============

    /// Bring the device into a known state.
    ///
    /// Flushes the bus with two status reads, resets the device and waits for
    /// it, then checks the ID. On a match the write enable latch is cleared,
    /// every block locked and on-chip ECC enabled. Nothing after the ID check
    /// is done on a mismatch.
    fn init(&self, spi: &mut SPI) -> Result<JedecID, SpiFlashError<SPI::Error>> {
        self.status(spi)?;
        self.status(spi)?;
        self.reset_cmd(spi)?;
        self.wait_not_busy(spi)?;

        let found = self.read_jedec_id_cmd(spi)?;
        let expected = JedecID::of::<Self>();
        if found != expected {
            error!("Unexpected device {}, expected {}", found, expected);
            return Err(SpiFlashError::IdentityMismatch { expected, found });
        }

        self.write_disable_cmd(spi)?;
        self.lock_all_blocks(spi)?;
        self.set_ecc_enabled(spi, true)?;
        info!("Initialised device {}", found);
        Ok(found)
    }
}

fn marker_len<D: SpiNand + ?Sized>() -> usize {
    D::BAD_BLOCK_MARKER_LEN.min(MAX_MARKER_LEN)
}

fn check_page<D: SpiNand + ?Sized, E>(page: PageIndex) -> Result<(), SpiFlashError<E>> {
    if page.as_u32() < D::PAGES_PER_BLOCK * D::BLOCK_COUNT {
        Ok(())
    } else {
        Err(SpiFlashError::OutOfBounds)
    }
}

fn check_block<D: SpiNand + ?Sized, E>(block: BlockIndex) -> Result<(), SpiFlashError<E>> {
    if (block.as_u16() as u32) < D::BLOCK_COUNT {
        Ok(())
    } else {
        Err(SpiFlashError::OutOfBounds)
    }
}

fn check_region<D: SpiNand + ?Sized, E>(column: ColumnAddress, len: usize) -> Result<(), SpiFlashError<E>> {
    if column.end(len) <= D::RAW_PAGE_SIZE as usize {
        Ok(())
    } else {
        Err(SpiFlashError::OutOfBounds)
    }
}
