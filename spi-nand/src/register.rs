//! Feature registers, accessed with the get/set feature commands.
use embedded_nand::EccResult;
use modular_bitfield::prelude::*;

/// Addresses of the feature registers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FeatureAddress {
    BlockLock = 0xA0,
    Configuration = 0xB0,
    Status = 0xC0,
}

impl FeatureAddress {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A typed feature register
pub trait FeatureRegister: From<u8> + Into<u8> + Copy {
    const ADDRESS: FeatureAddress;
}

/// Marker for registers the host may write
pub trait WritableRegister: FeatureRegister {}

/// Block lock register (0xA0)
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLock {
    #[skip]
    reserved: B1,
    /// WP# and HOLD# pins disabled
    pub wp_hold_disable: bool,
    /// Block protection bits, all set locks the whole array
    pub lock_bits: B5,
    /// Block register write disable
    pub brwd: bool,
}

impl BlockLock {
    const ALL_LOCK_BITS: u8 = 0x1F;

    /// Every block locked, WP# and HOLD# disabled
    pub fn all_locked() -> Self {
        BlockLock::new()
            .with_wp_hold_disable(true)
            .with_lock_bits(Self::ALL_LOCK_BITS)
    }

    /// No block locked, WP# and HOLD# disabled
    pub fn all_unlocked() -> Self {
        BlockLock::new().with_wp_hold_disable(true)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_bits() != 0
    }
}

impl From<u8> for BlockLock {
    fn from(value: u8) -> Self {
        BlockLock::from_bytes([value])
    }
}

impl From<BlockLock> for u8 {
    fn from(value: BlockLock) -> Self {
        value.into_bytes()[0]
    }
}

impl FeatureRegister for BlockLock {
    const ADDRESS: FeatureAddress = FeatureAddress::BlockLock;
}
impl WritableRegister for BlockLock {}

/// Configuration register (0xB0).
///
/// Only the ECC enable bit is interpreted, the other bits are carried through
/// unchanged.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Configuration {
    #[skip]
    low: B4,
    pub ecc_enable: bool,
    #[skip]
    high: B3,
}

impl From<u8> for Configuration {
    fn from(value: u8) -> Self {
        Configuration::from_bytes([value])
    }
}

impl From<Configuration> for u8 {
    fn from(value: Configuration) -> Self {
        value.into_bytes()[0]
    }
}

impl FeatureRegister for Configuration {
    const ADDRESS: FeatureAddress = FeatureAddress::Configuration;
}
impl WritableRegister for Configuration {}

/// Status register (0xC0), read only
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Operation in progress
    pub oip: bool,
    /// Write enable latch
    pub wel: bool,
    /// Erase failure
    pub erase_fail: bool,
    /// Program failure
    pub program_fail: bool,
    /// ECC status of the last page read
    pub ecc: B3,
    #[skip]
    reserved: B1,
}

impl Status {
    /// ECC status value reporting an uncorrectable page
    pub const ECC_UNCORRECTABLE: u8 = 0b010;

    pub fn is_busy(&self) -> bool {
        self.oip()
    }

    /// Decode the ECC bits.
    ///
    /// 0 and 1 are clean reads, 2 is uncorrectable and every other value
    /// reports a correction of increasing severity.
    pub fn ecc_result(&self) -> EccResult {
        match self.ecc() {
            0 | 1 => EccResult::NoError,
            Self::ECC_UNCORRECTABLE => EccResult::Uncorrectable,
            _ => EccResult::Corrected,
        }
    }
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        Status::from_bytes([value])
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        value.into_bytes()[0]
    }
}

impl FeatureRegister for Status {
    const ADDRESS: FeatureAddress = FeatureAddress::Status;
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn block_lock_layout() {
        assert_eq!(u8::from(BlockLock::all_locked()), 0x7E);
        assert_eq!(u8::from(BlockLock::all_unlocked()), 0x02);
        assert!(BlockLock::from(0x38).is_locked());
        assert!(!BlockLock::from(0x82).is_locked());
        assert!(BlockLock::from(0x82).brwd());
    }

    #[test]
    fn configuration_keeps_other_bits() {
        let cfg = Configuration::from(0xC3);
        assert!(!cfg.ecc_enable());
        let enabled = cfg.with_ecc_enable(true);
        assert_eq!(u8::from(enabled), 0xD3);
        assert_eq!(u8::from(enabled.with_ecc_enable(false)), 0xC3);
    }

    #[test]
    fn status_bits() {
        let status = Status::from(0b0010_1101);
        assert!(status.is_busy());
        assert!(!status.wel());
        assert!(status.erase_fail());
        assert!(status.program_fail());
        assert_eq!(status.ecc(), 0b010);
    }

    #[test]
    fn ecc_decode() {
        let decode = |ecc: u8| Status::from(ecc << 4).ecc_result();
        assert_eq!(decode(0), EccResult::NoError);
        assert_eq!(decode(1), EccResult::NoError);
        assert_eq!(decode(2), EccResult::Uncorrectable);
        for ecc in 3..=7 {
            assert_eq!(decode(ecc), EccResult::Corrected);
        }
    }
}
