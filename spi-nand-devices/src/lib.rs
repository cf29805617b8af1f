#![cfg_attr(not(test), no_std)]
//! Device descriptions for [spi_nand].
//!
//! Each part is a zero sized type implementing [spi_nand::SpiNand] and
//! [spi_nand::cmd_blocking::SpiNandBlocking], to be used with
//! [spi_nand::SpiNandDevice].
pub mod micron;
