//! [ChunkDriver] for [SpiNandDevice]: one filesystem chunk is one page.
use embedded_hal::spi::SpiDevice;
use embedded_nand::{
    BlockIndex, ChunkDriver, ColumnAddress, EccResult, ErrorType, PageIndex,
};

use crate::{cmd_blocking::SpiNandBlocking, error::SpiFlashError, PageRegion, PageRegionMut, SpiNandDevice};

impl<SPI: SpiDevice, D: SpiNandBlocking<SPI>> ErrorType for SpiNandDevice<SPI, D> {
    type Error = SpiFlashError<SPI::Error>;
}

impl<SPI: SpiDevice, D: SpiNandBlocking<SPI>> ChunkDriver for SpiNandDevice<SPI, D> {
    const DATA_BYTES_PER_CHUNK: usize = D::PAGE_SIZE as usize;
    const SPARE_BYTES_PER_CHUNK: usize = D::OOB_TAGS_SIZE as usize;
    const CHUNKS_PER_BLOCK: usize = D::PAGES_PER_BLOCK as usize;
    const BLOCK_COUNT: usize = D::BLOCK_COUNT as usize;

    fn initialise(&mut self) -> Result<(), Self::Error> {
        self.init().map(|_| ())
    }

    fn deinitialise(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn write_chunk(&mut self, chunk: PageIndex, data: &[u8], oob: &[u8]) -> Result<(), Self::Error> {
        trace!("Write chunk {}: {} data, {} tags", chunk.as_u32(), data.len(), oob.len());
        check_lengths::<SPI, D>(data.len(), oob.len())?;
        let data_region = PageRegion::new(ColumnAddress::new(0), data);
        let oob_region = PageRegion::new(ColumnAddress::new(D::OOB_TAGS_OFFSET), oob);
        match (data.is_empty(), oob.is_empty()) {
            (true, true) => Ok(()),
            (false, true) => self.write_page(chunk, &[data_region]),
            (true, false) => self.write_page(chunk, &[oob_region]),
            (false, false) => self.write_page(chunk, &[data_region, oob_region]),
        }
    }

    fn read_chunk(
        &mut self,
        chunk: PageIndex,
        data: &mut [u8],
        oob: &mut [u8],
        ecc: &mut EccResult,
    ) -> Result<(), Self::Error> {
        trace!("Read chunk {}: {} data, {} tags", chunk.as_u32(), data.len(), oob.len());
        check_lengths::<SPI, D>(data.len(), oob.len())?;
        let status = self.device.load_page(&mut self.spi, chunk)?;
        *ecc = status.ecc_result();
        if *ecc == EccResult::Uncorrectable {
            warn!("Uncorrectable ECC error in chunk {}", chunk.as_u32());
        }

        let data_column = ColumnAddress::new(0);
        let oob_column = ColumnAddress::new(D::OOB_TAGS_OFFSET);
        match (data.is_empty(), oob.is_empty()) {
            (true, true) => Ok(()),
            (false, true) => self
                .device
                .read_cache(&mut self.spi, &mut [PageRegionMut::new(data_column, data)]),
            (true, false) => self
                .device
                .read_cache(&mut self.spi, &mut [PageRegionMut::new(oob_column, oob)]),
            (false, false) => self.device.read_cache(
                &mut self.spi,
                &mut [
                    PageRegionMut::new(data_column, data),
                    PageRegionMut::new(oob_column, oob),
                ],
            ),
        }
    }

    fn erase_block(&mut self, block: BlockIndex) -> Result<(), Self::Error> {
        SpiNandDevice::erase_block(self, block)
    }

    fn mark_bad_block(&mut self, block: BlockIndex) -> Result<(), Self::Error> {
        self.mark_block_bad(block)
    }

    fn check_bad_block(&mut self, block: BlockIndex) -> Result<(), Self::Error> {
        if self.check_block_ok(block)? {
            Ok(())
        } else {
            Err(SpiFlashError::BadBlock(block))
        }
    }
}

/// Data must fit the main area and tags the free spare bytes,
/// anything longer would spill onto the bad block marker or the next region
fn check_lengths<SPI: SpiDevice, D: SpiNandBlocking<SPI>>(
    data: usize,
    oob: usize,
) -> Result<(), SpiFlashError<SPI::Error>> {
    if data > D::PAGE_SIZE as usize || oob > D::OOB_TAGS_SIZE as usize {
        error!("Chunk of {} data, {} tags does not fit a page", data, oob);
        return Err(SpiFlashError::OutOfBounds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sim::{SimNand, TestChip},
        SpiNand,
    };
    use embedded_nand::{BlockStatus, NandFlashError, NandFlashErrorKind};
    use test_log::test;

    type Flash = SpiNandDevice<SimNand<TestChip>, TestChip>;

    const DATA: usize = <Flash as ChunkDriver>::DATA_BYTES_PER_CHUNK;
    const SPARE: usize = <Flash as ChunkDriver>::SPARE_BYTES_PER_CHUNK;

    fn flash() -> Flash {
        let mut flash = SpiNandDevice::new(SimNand::new().with_busy_polls(2), TestChip);
        flash.initialise().unwrap();
        flash.spi.clear_logs();
        flash
    }

    #[test]
    fn geometry_follows_device() {
        assert_eq!(DATA, 2048);
        assert_eq!(SPARE, TestChip::OOB_SIZE as usize - 4);
        assert_eq!(<Flash as ChunkDriver>::CHUNKS_PER_BLOCK, 64);
        assert_eq!(<Flash as ChunkDriver>::BLOCK_COUNT, 8);
    }

    #[test]
    fn erase_then_read_is_blank() {
        let mut flash = flash();
        flash.spi.write_raw(128, 0, &[0; 16]);
        ChunkDriver::erase_block(&mut flash, BlockIndex::new(2)).unwrap();

        let mut data = [0; DATA];
        let mut oob = [0; SPARE];
        let mut ecc = EccResult::Corrected;
        flash
            .read_chunk(PageIndex::new(128), &mut data, &mut oob, &mut ecc)
            .unwrap();
        assert_eq!(ecc, EccResult::NoError);
        assert!(data.iter().chain(oob.iter()).all(|&b| b == 0xFF));
    }

    #[test]
    fn hello_round_trip() {
        let mut flash = flash();
        let chunk = PageIndex::new(5);
        flash.write_chunk(chunk, b"hello", &[1, 2, 3]).unwrap();

        let mut data = [0; 5];
        let mut oob = [0; 3];
        let mut ecc = EccResult::default();
        flash.read_chunk(chunk, &mut data, &mut oob, &mut ecc).unwrap();
        assert_eq!(&data, b"hello");
        assert_eq!(oob, [1, 2, 3]);
        assert_eq!(ecc, EccResult::NoError);
        assert_eq!(flash.spi.busy_violations, 0);
    }

    #[test]
    fn tags_do_not_touch_bad_block_marker() {
        let mut flash = flash();
        flash.write_chunk(PageIndex::new(0), &[], &[0; SPARE]).unwrap();
        assert!(flash.check_bad_block(BlockIndex::new(0)).is_ok());
        let raw = flash.spi.raw_page(0);
        assert_eq!(raw[..DATA], [0xFF; DATA]);
        assert_eq!(raw[DATA..DATA + 4], [0xFF; 4]);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut flash = flash();
        let err = flash
            .write_chunk(PageIndex::new(0), &[0; DATA + 2], &[])
            .unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::OutOfBounds);
        let err = flash
            .write_chunk(PageIndex::new(0), &[], &[0; SPARE + 1])
            .unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::OutOfBounds);
        assert!(flash.spi.commands.is_empty());
        assert_eq!(flash.block_status(BlockIndex::new(0)).unwrap(), BlockStatus::Ok);
        assert_eq!(flash.spi.raw_page(0)[DATA..DATA + 4], [0xFF; 4]);

        let mut ecc = EccResult::Corrected;
        let err = flash
            .read_chunk(PageIndex::new(0), &mut [0; DATA + 1], &mut [], &mut ecc)
            .unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::OutOfBounds);
        let err = flash
            .read_chunk(PageIndex::new(0), &mut [], &mut [0; SPARE + 1], &mut ecc)
            .unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::OutOfBounds);
        assert_eq!(ecc, EccResult::Corrected);

        // Full sized chunks still fit
        flash
            .write_chunk(PageIndex::new(0), &[0; DATA], &[0; SPARE])
            .unwrap();
        assert!(flash.check_bad_block(BlockIndex::new(0)).is_ok());
    }

    #[test]
    fn empty_chunk_write_is_a_no_op() {
        let mut flash = flash();
        flash.write_chunk(PageIndex::new(3), &[], &[]).unwrap();
        assert!(flash.spi.commands.is_empty());
    }

    #[test]
    fn only_requested_parts_are_read() {
        let mut flash = flash();
        flash.write_chunk(PageIndex::new(7), b"data", b"tags").unwrap();
        flash.spi.clear_logs();

        let mut oob = [0; 4];
        let mut ecc = EccResult::default();
        flash.read_chunk(PageIndex::new(7), &mut [], &mut oob, &mut ecc).unwrap();
        assert_eq!(&oob, b"tags");
        assert_eq!(flash.spi.count(0x03), 1);
    }

    #[test]
    fn bad_block_round_trip() {
        let mut flash = flash();
        let block = BlockIndex::new(4);
        assert!(flash.block_status(block).unwrap().is_ok());

        flash.mark_bad_block(block).unwrap();
        let err = flash.check_bad_block(block).unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::BadBlock(block));
        assert_eq!(flash.block_status(block).unwrap(), BlockStatus::Failed);
        assert!(flash.check_bad_block(BlockIndex::new(5)).is_ok());
    }

    #[test]
    fn uncorrectable_read_still_returns_bytes() {
        let mut flash = flash();
        flash.write_chunk(PageIndex::new(9), b"worn", &[]).unwrap();
        flash.spi.set_ecc_status(2);

        let mut data = [0; 4];
        let mut ecc = EccResult::default();
        flash.read_chunk(PageIndex::new(9), &mut data, &mut [], &mut ecc).unwrap();
        assert_eq!(ecc, EccResult::Uncorrectable);
        assert_eq!(&data, b"worn");
    }

    #[test]
    fn ecc_reported_when_cache_read_fails() {
        let mut flash = flash();
        flash.spi.set_ecc_status(3);
        flash.spi.set_busy_polls(0);
        // Page read and status poll succeed, the cache read fails
        flash.spi.fail_after(2);

        let mut data = [0; 4];
        let mut ecc = EccResult::default();
        let err = flash
            .read_chunk(PageIndex::new(1), &mut data, &mut [], &mut ecc)
            .unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::Transport);
        assert_eq!(ecc, EccResult::Corrected);
    }

    #[test]
    fn identity_mismatch_fails_initialise() {
        let mut sim = SimNand::<TestChip>::new();
        sim.set_id(0x2C, 0x24);
        let mut flash = SpiNandDevice::new(sim, TestChip);
        let err = flash.initialise().unwrap_err();
        assert_eq!(err.kind(), NandFlashErrorKind::Identity);
        assert!(flash.spi.feature_writes.is_empty());
        assert!(flash.deinitialise().is_ok());
    }
}
