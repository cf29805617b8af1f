use thiserror::Error;

use crate::{BlockIndex, ChunkDriver};

/// Reasons a device registration is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamsError {
    #[error("Device name is empty")]
    EmptyName,
    #[error("Start block is after end block")]
    InvertedRange,
    #[error("Block range exceeds the device")]
    OutOfBounds,
    #[error("Block range does not leave room beyond the reserved blocks")]
    TooFewBlocks,
}

/// Geometry and policy handed to the filesystem when the device is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceParams {
    /// Main data bytes per chunk
    pub data_bytes_per_chunk: u32,
    /// Tag bytes per chunk stored out-of-band
    pub spare_bytes_per_chunk: u32,
    /// Chunks per erase block
    pub chunks_per_block: u32,
    /// Blocks the filesystem keeps in reserve for garbage collection
    pub reserved_blocks: u32,
    /// First block given to the filesystem
    pub start_block: BlockIndex,
    /// Last block given to the filesystem, inclusive
    pub end_block: BlockIndex,
    /// ECC is handled by the driver (on-chip), not by the filesystem
    pub use_nand_ecc: bool,
    /// Number of chunk caches the filesystem should keep
    pub cache_count: u32,
}

impl DeviceParams {
    pub const DEFAULT_RESERVED_BLOCKS: u32 = 5;
    pub const DEFAULT_CACHE_COUNT: u32 = 2;

    /// Parameters for the whole of `D`
    pub fn for_driver<D: ChunkDriver>() -> Self {
        DeviceParams {
            data_bytes_per_chunk: D::DATA_BYTES_PER_CHUNK as u32,
            spare_bytes_per_chunk: D::SPARE_BYTES_PER_CHUNK as u32,
            chunks_per_block: D::CHUNKS_PER_BLOCK as u32,
            reserved_blocks: Self::DEFAULT_RESERVED_BLOCKS,
            start_block: BlockIndex::new(0),
            end_block: BlockIndex::new(
                u16::try_from(D::BLOCK_COUNT.saturating_sub(1)).unwrap_or(u16::MAX),
            ),
            use_nand_ecc: true,
            cache_count: Self::DEFAULT_CACHE_COUNT,
        }
    }

    /// Restrict to the inclusive block range `start..=end`
    pub fn with_block_range(mut self, start: BlockIndex, end: BlockIndex) -> Self {
        self.start_block = start;
        self.end_block = end;
        self
    }

    pub fn with_reserved_blocks(mut self, reserved: u32) -> Self {
        self.reserved_blocks = reserved;
        self
    }

    /// Blocks in the configured range
    pub fn block_count(&self) -> u32 {
        (self.end_block.as_u16() as u32 + 1).saturating_sub(self.start_block.as_u16() as u32)
    }

    /// Check the parameters against a device with `device_blocks` blocks
    pub fn validate(&self, device_blocks: usize) -> Result<(), ParamsError> {
        if self.start_block > self.end_block {
            return Err(ParamsError::InvertedRange);
        }
        if self.end_block.as_u16() as usize >= device_blocks {
            return Err(ParamsError::OutOfBounds);
        }
        if self.block_count() <= self.reserved_blocks {
            return Err(ParamsError::TooFewBlocks);
        }
        Ok(())
    }
}

/// A named driver together with the parameters the filesystem mounts it with.
///
/// Construct one per physical device and pass it to the filesystem's mount call.
#[derive(Debug)]
pub struct ChunkDevice<'n, D> {
    name: &'n str,
    params: DeviceParams,
    driver: D,
}

impl<'n, D: ChunkDriver> ChunkDevice<'n, D> {
    /// Register `driver` under `name`, giving the filesystem blocks
    /// `start_block..=end_block` with the default policy.
    pub fn load(
        name: &'n str,
        driver: D,
        start_block: BlockIndex,
        end_block: BlockIndex,
    ) -> Result<Self, ParamsError> {
        let params = DeviceParams::for_driver::<D>().with_block_range(start_block, end_block);
        Self::with_params(name, driver, params)
    }

    /// Register `driver` under `name` with explicit parameters
    pub fn with_params(name: &'n str, driver: D, params: DeviceParams) -> Result<Self, ParamsError> {
        if name.is_empty() {
            return Err(ParamsError::EmptyName);
        }
        params.validate(D::BLOCK_COUNT)?;
        info!(
            "Loaded device with blocks {} to {}, {} reserved",
            params.start_block.as_u16(),
            params.end_block.as_u16(),
            params.reserved_blocks
        );
        Ok(ChunkDevice {
            name,
            params,
            driver,
        })
    }

    pub fn name(&self) -> &'n str {
        self.name
    }

    pub fn params(&self) -> &DeviceParams {
        &self.params
    }

    pub fn driver(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }
}
