//! Command protocol engine.
//!
//! Every SPI NAND command is an opcode, followed by a fixed number of address
//! bytes (most significant first), a fixed number of dummy bytes and an
//! optional data phase. The shape of each command is fixed by the
//! [CommandDescriptor] table, so callers only pick a [Command] and supply the
//! address and data.
use embedded_hal::spi::{Operation, SpiDevice};

use crate::error::SpiFlashError;

/// Longest possible header: opcode, 3 address bytes and 2 dummy bytes
pub const MAX_HEADER_LEN: usize = 6;

/// Direction of the data phase following the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Header only
    None,
    /// Host to device
    Transmit,
    /// Device to host
    Receive,
}

/// Wire shape of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandDescriptor {
    pub opcode: u8,
    /// Address bytes following the opcode, 0 to 3
    pub address_bytes: u8,
    /// Dummy bytes following the address, 0 to 2
    pub dummy_bytes: u8,
    pub direction: Direction,
    /// Data phase runs over four data lines
    pub quad: bool,
}

impl CommandDescriptor {
    const fn new(opcode: u8, address_bytes: u8, dummy_bytes: u8, direction: Direction) -> Self {
        CommandDescriptor {
            opcode,
            address_bytes,
            dummy_bytes,
            direction,
            quad: false,
        }
    }

    const fn quad(self) -> Self {
        CommandDescriptor { quad: true, ..self }
    }

    /// Length of the header on the wire
    pub const fn header_len(&self) -> usize {
        1 + self.address_bytes as usize + self.dummy_bytes as usize
    }
}

/// The fixed set of commands the driver issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Reset,
    GetFeature,
    SetFeature,
    ReadId,
    /// Load a page from the array into the device cache
    PageReadToCache,
    ReadFromCache,
    ReadFromCacheQuad,
    WriteEnable,
    WriteDisable,
    BlockErase,
    /// Program the device cache into a page
    ProgramExecute,
    /// Load bytes into the device cache, resetting the rest of it to 0xFF
    ProgramLoad,
    /// Load bytes into the device cache, keeping the rest of it
    ProgramLoadRandom,
    ProgramLoadQuad,
    ProgramLoadRandomQuad,
}

// Indexed by the declaration order of [Command]
static DESCRIPTORS: [CommandDescriptor; 15] = [
    CommandDescriptor::new(0xFF, 0, 0, Direction::None),
    CommandDescriptor::new(0x0F, 1, 0, Direction::Receive),
    CommandDescriptor::new(0x1F, 1, 0, Direction::Transmit),
    CommandDescriptor::new(0x9F, 0, 1, Direction::Receive),
    CommandDescriptor::new(0x13, 3, 0, Direction::None),
    CommandDescriptor::new(0x03, 2, 1, Direction::Receive),
    CommandDescriptor::new(0x6B, 2, 1, Direction::Receive).quad(),
    CommandDescriptor::new(0x06, 0, 0, Direction::None),
    CommandDescriptor::new(0x04, 0, 0, Direction::None),
    CommandDescriptor::new(0xD8, 3, 0, Direction::None),
    CommandDescriptor::new(0x10, 3, 0, Direction::None),
    CommandDescriptor::new(0x02, 2, 0, Direction::Transmit),
    CommandDescriptor::new(0x84, 2, 0, Direction::Transmit),
    CommandDescriptor::new(0x32, 2, 0, Direction::Transmit).quad(),
    CommandDescriptor::new(0x34, 2, 0, Direction::Transmit).quad(),
];

impl Command {
    pub const ALL: [Command; 15] = [
        Command::Reset,
        Command::GetFeature,
        Command::SetFeature,
        Command::ReadId,
        Command::PageReadToCache,
        Command::ReadFromCache,
        Command::ReadFromCacheQuad,
        Command::WriteEnable,
        Command::WriteDisable,
        Command::BlockErase,
        Command::ProgramExecute,
        Command::ProgramLoad,
        Command::ProgramLoadRandom,
        Command::ProgramLoadQuad,
        Command::ProgramLoadRandomQuad,
    ];

    pub fn descriptor(self) -> &'static CommandDescriptor {
        &DESCRIPTORS[self as usize]
    }

    pub fn opcode(self) -> u8 {
        self.descriptor().opcode
    }
}

/// Encoded command header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    bytes: [u8; MAX_HEADER_LEN],
    len: usize,
}

impl Header {
    /// Opcode, then `address` truncated to the descriptor's address bytes
    /// MSB first, then zeroed dummy bytes.
    pub fn encode(descriptor: &CommandDescriptor, address: u32) -> Self {
        let mut bytes = [0; MAX_HEADER_LEN];
        bytes[0] = descriptor.opcode;
        let n = descriptor.address_bytes as usize;
        for (i, byte) in bytes[1..=n].iter_mut().enumerate() {
            *byte = (address >> (8 * (n - 1 - i))) as u8;
        }
        Header {
            bytes,
            len: descriptor.header_len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

/// Data phase of a transaction
#[derive(Debug)]
pub enum Data<'a> {
    None,
    Transmit(&'a [u8]),
    Receive(&'a mut [u8]),
}

impl Data<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            Data::None => Direction::None,
            Data::Transmit(_) => Direction::Transmit,
            Data::Receive(_) => Direction::Receive,
        }
    }
}

/// Run `command` as exactly one SPI transaction.
///
/// Chip select framing is the job of the [SpiDevice]: it is held for the
/// header and the data phase and released afterwards. Nothing is retried.
pub fn execute<SPI: SpiDevice>(
    spi: &mut SPI,
    command: Command,
    address: u32,
    data: Data<'_>,
) -> Result<(), SpiFlashError<SPI::Error>> {
    let descriptor = command.descriptor();
    if descriptor.quad {
        return Err(SpiFlashError::QuadNotSupported);
    }
    if descriptor.direction != data.direction() {
        return Err(SpiFlashError::DirectionMismatch);
    }
    let header = Header::encode(descriptor, address);
    trace!(
        "Command {:#X} address {:#X}",
        descriptor.opcode,
        address
    );
    let result = match data {
        Data::None => spi.transaction(&mut [Operation::Write(header.as_bytes())]),
        Data::Transmit(buf) => spi.transaction(&mut [
            Operation::Write(header.as_bytes()),
            Operation::Write(buf),
        ]),
        Data::Receive(buf) => spi.transaction(&mut [
            Operation::Write(header.as_bytes()),
            Operation::Read(buf),
        ]),
    };
    result.map_err(SpiFlashError::SPI)
}
