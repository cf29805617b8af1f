use core::{fmt::Display, ops::Add};

/// Index of a page in the flash device.
///
/// A filesystem chunk maps 1:1 onto a page, so this is also the chunk index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageIndex(pub(crate) u32);

impl PageIndex {
    pub const fn new(index: u32) -> Self {
        PageIndex(index)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// The block containing this page
    pub const fn as_block_index(&self, pages_per_block: u32) -> BlockIndex {
        BlockIndex((self.0 / pages_per_block) as u16)
    }

    /// Offset of this page within its block
    pub const fn page_in_block(&self, pages_per_block: u32) -> u32 {
        self.0 % pages_per_block
    }

    /// The first page of a block
    pub const fn from_block_index(block: BlockIndex, pages_per_block: u32) -> Self {
        PageIndex(block.0 as u32 * pages_per_block)
    }
}

impl From<u32> for PageIndex {
    fn from(index: u32) -> Self {
        PageIndex(index)
    }
}

impl From<PageIndex> for u32 {
    fn from(pa: PageIndex) -> Self {
        pa.as_u32()
    }
}

impl Add<u32> for PageIndex {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        PageIndex(self.0 + rhs)
    }
}

impl Display for PageIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Index of a block (the unit of erase) in the flash device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockIndex(pub(crate) u16);

impl BlockIndex {
    pub const fn new(index: u16) -> Self {
        BlockIndex(index)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// First page of the block
    pub const fn first_page(&self, pages_per_block: u32) -> PageIndex {
        PageIndex::from_block_index(*self, pages_per_block)
    }
}

impl From<u16> for BlockIndex {
    fn from(index: u16) -> Self {
        BlockIndex(index)
    }
}

impl From<BlockIndex> for u16 {
    fn from(bi: BlockIndex) -> Self {
        bi.as_u16()
    }
}

impl Add<u16> for BlockIndex {
    type Output = Self;

    fn add(self, rhs: u16) -> Self::Output {
        BlockIndex(self.0 + rhs)
    }
}

impl Display for BlockIndex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a byte within a page, including the spare (OOB) area
/// which starts directly after the main data region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ColumnAddress(pub(crate) u16);

impl ColumnAddress {
    pub const fn new(address: u16) -> Self {
        ColumnAddress(address)
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    /// Column one past the end of a `len` byte run starting here
    pub const fn end(&self, len: usize) -> usize {
        self.0 as usize + len
    }
}

impl Display for ColumnAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}
