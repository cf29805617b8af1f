use embedded_nand::ColumnAddress;

/// Bytes to program at a column of the device cache
#[derive(Debug, Clone, Copy)]
pub struct PageRegion<'a> {
    pub column: ColumnAddress,
    pub data: &'a [u8],
}

impl<'a> PageRegion<'a> {
    pub fn new(column: ColumnAddress, data: &'a [u8]) -> Self {
        PageRegion { column, data }
    }
}

/// Buffer to fill from a column of the device cache
#[derive(Debug)]
pub struct PageRegionMut<'a> {
    pub column: ColumnAddress,
    pub data: &'a mut [u8],
}

impl<'a> PageRegionMut<'a> {
    pub fn new(column: ColumnAddress, data: &'a mut [u8]) -> Self {
        PageRegionMut { column, data }
    }
}
