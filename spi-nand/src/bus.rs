//! Transport layer.
//!
//! [SpiNandBus] turns a raw SPI bus and a chip select pin into an
//! [embedded_hal::spi::SpiDevice] for the command engine. Short transfers run
//! as blocking bus calls, long ones are started in the background (DMA or
//! interrupt driven) and the caller spins on a [TransferComplete] flag that the
//! transfer complete interrupt sets.
use core::{
    fmt::Debug,
    sync::atomic::{AtomicBool, Ordering},
};

use embedded_hal::{
    digital::OutputPin,
    spi::{self, ErrorKind, ErrorType, Operation, SpiBus, SpiDevice},
};

/// Completion flag shared between the transfer complete interrupt (writer)
/// and the thread waiting for the transfer (reader).
///
/// Only one transfer may be outstanding per flag.
#[derive(Debug)]
pub struct TransferComplete {
    done: AtomicBool,
}

impl TransferComplete {
    pub const fn new() -> Self {
        TransferComplete {
            done: AtomicBool::new(true),
        }
    }

    /// Clear the flag before starting a transfer
    pub fn arm(&self) {
        self.done.store(false, Ordering::Release);
    }

    /// Mark the transfer as complete. Called from interrupt context.
    pub fn signal(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Spin until the flag is set, at most `limit` times.
    ///
    /// Returns the number of spins, or [None] if the limit ran out.
    pub fn wait(&self, limit: u32) -> Option<u32> {
        let mut spins = 0;
        while !self.is_complete() {
            if spins >= limit {
                return None;
            }
            spins += 1;
            core::hint::spin_loop();
        }
        Some(spins)
    }
}

impl Default for TransferComplete {
    fn default() -> Self {
        Self::new()
    }
}

/// A SPI bus that can also run transfers in the background.
///
/// `start_write` / `start_read` return once the transfer is started. The
/// implementation must call [TransferComplete::signal] on the flag returned by
/// [DmaBus::completion] when the transfer has finished. The buffers stay
/// borrowed until the caller has seen the flag set.
pub trait DmaBus: SpiBus<u8> {
    fn start_write(&mut self, words: &[u8]) -> Result<(), Self::Error>;
    fn start_read(&mut self, words: &mut [u8]) -> Result<(), Self::Error>;
    fn completion(&self) -> &TransferComplete;
}

/// Gives a blocking [SpiBus] the [DmaBus] interface by running every
/// "background" transfer to completion immediately.
#[derive(Debug)]
pub struct Polled<BUS> {
    bus: BUS,
    complete: TransferComplete,
}

impl<BUS> Polled<BUS> {
    pub fn new(bus: BUS) -> Self {
        Polled {
            bus,
            complete: TransferComplete::new(),
        }
    }

    pub fn into_inner(self) -> BUS {
        self.bus
    }
}

impl<BUS: ErrorType> ErrorType for Polled<BUS> {
    type Error = BUS::Error;
}

impl<BUS: SpiBus> SpiBus for Polled<BUS> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(words)
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        self.bus.transfer(read, write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.transfer_in_place(words)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.bus.flush()
    }
}

impl<BUS: SpiBus> DmaBus for Polled<BUS> {
    fn start_write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.bus.write(words)?;
        self.complete.signal();
        Ok(())
    }

    fn start_read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.bus.read(words)?;
        self.complete.signal();
        Ok(())
    }

    fn completion(&self) -> &TransferComplete {
        &self.complete
    }
}

/// Runtime transport settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransportConfig {
    /// Transfers of at least this many bytes go through the background path
    pub dma_threshold: usize,
    /// Spins allowed while waiting for a background transfer
    pub completion_spin_limit: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            dma_threshold: 10,
            completion_spin_limit: 1_000_000,
        }
    }
}

/// Errors of [SpiNandBus]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError<BE, CE> {
    /// The bus failed a transfer
    #[error("SPI bus error: {0:?}")]
    Spi(BE),
    /// The chip select pin could not be driven
    #[error("Chip select error: {0:?}")]
    ChipSelect(CE),
    /// A background transfer was never signalled complete
    #[error("Transfer did not complete")]
    Timeout,
    /// [Operation::DelayNs] inside a transaction
    #[error("Delay operations are not supported")]
    DelayNotSupported,
}

impl<BE: spi::Error, CE: Debug> spi::Error for TransportError<BE, CE> {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Spi(e) => e.kind(),
            TransportError::ChipSelect(_) => ErrorKind::ChipSelectFault,
            TransportError::Timeout | TransportError::DelayNotSupported => ErrorKind::Other,
        }
    }
}

/// Exclusive SPI device for the NAND chip on a single chip select line.
///
/// Chip select is driven twice on every edge so the line has settled before
/// the clock starts, and it is always released at the end of a transaction,
/// even if the transfer failed.
#[derive(Debug)]
pub struct SpiNandBus<BUS, CS> {
    bus: BUS,
    cs: CS,
    config: TransportConfig,
}

impl<BUS, CS> SpiNandBus<BUS, CS> {
    pub fn new(bus: BUS, cs: CS) -> Self {
        Self::with_config(bus, cs, TransportConfig::default())
    }

    pub fn with_config(bus: BUS, cs: CS, config: TransportConfig) -> Self {
        SpiNandBus { bus, cs, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Give back the bus and pin
    pub fn release(self) -> (BUS, CS) {
        (self.bus, self.cs)
    }
}

impl<BUS: DmaBus, CS: OutputPin> SpiNandBus<BUS, CS> {
    fn select(&mut self) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        self.cs.set_low().map_err(TransportError::ChipSelect)?;
        self.cs.set_low().map_err(TransportError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        self.cs.set_high().map_err(TransportError::ChipSelect)?;
        self.cs.set_high().map_err(TransportError::ChipSelect)
    }

    fn write_words(&mut self, words: &[u8]) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        if words.len() < self.config.dma_threshold {
            return self.bus.write(words).map_err(TransportError::Spi);
        }
        self.bus.completion().arm();
        self.bus.start_write(words).map_err(TransportError::Spi)?;
        self.wait_complete()
    }

    fn read_words(
        &mut self,
        words: &mut [u8],
    ) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        if words.len() < self.config.dma_threshold {
            return self.bus.read(words).map_err(TransportError::Spi);
        }
        self.bus.completion().arm();
        self.bus.start_read(words).map_err(TransportError::Spi)?;
        self.wait_complete()
    }

    fn wait_complete(&self) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        match self
            .bus
            .completion()
            .wait(self.config.completion_spin_limit)
        {
            Some(spins) => {
                trace!("Background transfer complete after {} spins", spins);
                Ok(())
            }
            None => {
                warn!("Background transfer not complete");
                Err(TransportError::Timeout)
            }
        }
    }

    fn run(
        &mut self,
        operation: &mut Operation<'_, u8>,
    ) -> Result<(), TransportError<BUS::Error, CS::Error>> {
        match operation {
            Operation::Write(words) => self.write_words(words),
            Operation::Read(words) => self.read_words(words),
            Operation::Transfer(read, write) => {
                self.bus.transfer(read, write).map_err(TransportError::Spi)
            }
            Operation::TransferInPlace(words) => {
                self.bus.transfer_in_place(words).map_err(TransportError::Spi)
            }
            Operation::DelayNs(_) => Err(TransportError::DelayNotSupported),
        }
    }
}

impl<BUS: ErrorType, CS: OutputPin> ErrorType for SpiNandBus<BUS, CS> {
    type Error = TransportError<BUS::Error, CS::Error>;
}

impl<BUS: DmaBus, CS: OutputPin> SpiDevice for SpiNandBus<BUS, CS> {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Self::Error> {
        if let Err(e) = self.select() {
            // Leave the line released, the select error is what matters
            let _ = self.deselect();
            return Err(e);
        }
        let result = operations.iter_mut().try_for_each(|op| self.run(op));
        let flushed = self.bus.flush().map_err(TransportError::Spi);
        let deselected = self.deselect();
        result.and(flushed).and(deselected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::{cell::RefCell, rc::Rc, sync::Arc, thread, time::Duration, vec::Vec};
    use test_log::test;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        CsLow,
        CsHigh,
        Write(Vec<u8>),
        Read(usize),
        DmaWrite(Vec<u8>),
        DmaRead(usize),
        Flush,
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct Pin(Log);

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Event::CsLow);
            Ok(())
        }
        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Event::CsHigh);
            Ok(())
        }
    }

    /// Bus whose background transfers are completed by another thread,
    /// standing in for the transfer complete interrupt.
    struct Bus {
        log: Log,
        complete: Arc<TransferComplete>,
        /// Never signal background transfers
        stall: bool,
        /// Fail blocking reads
        fail_reads: bool,
    }

    impl Bus {
        fn new(log: Log) -> Self {
            Bus {
                log,
                complete: Arc::new(TransferComplete::new()),
                stall: false,
                fail_reads: false,
            }
        }

        fn finish_later(&self) {
            if self.stall {
                return;
            }
            let flag = self.complete.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(1));
                flag.signal();
            });
        }
    }

    impl ErrorType for Bus {
        type Error = ErrorKind;
    }

    impl SpiBus for Bus {
        fn read(&mut self, words: &mut [u8]) -> Result<(), ErrorKind> {
            if self.fail_reads {
                return Err(ErrorKind::Overrun);
            }
            words.fill(0xA5);
            self.log.borrow_mut().push(Event::Read(words.len()));
            Ok(())
        }
        fn write(&mut self, words: &[u8]) -> Result<(), ErrorKind> {
            self.log.borrow_mut().push(Event::Write(words.to_vec()));
            Ok(())
        }
        fn transfer(&mut self, _read: &mut [u8], _write: &[u8]) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }
        fn transfer_in_place(&mut self, _words: &mut [u8]) -> Result<(), ErrorKind> {
            Err(ErrorKind::Other)
        }
        fn flush(&mut self) -> Result<(), ErrorKind> {
            self.log.borrow_mut().push(Event::Flush);
            Ok(())
        }
    }

    impl DmaBus for Bus {
        fn start_write(&mut self, words: &[u8]) -> Result<(), ErrorKind> {
            self.log.borrow_mut().push(Event::DmaWrite(words.to_vec()));
            self.finish_later();
            Ok(())
        }
        fn start_read(&mut self, words: &mut [u8]) -> Result<(), ErrorKind> {
            words.fill(0x5A);
            self.log.borrow_mut().push(Event::DmaRead(words.len()));
            self.finish_later();
            Ok(())
        }
        fn completion(&self) -> &TransferComplete {
            &self.complete
        }
    }

    fn device(bus: Bus, log: &Log, spin_limit: u32) -> SpiNandBus<Bus, Pin> {
        SpiNandBus::with_config(
            bus,
            Pin(log.clone()),
            TransportConfig {
                dma_threshold: 10,
                completion_spin_limit: spin_limit,
            },
        )
    }

    #[test]
    fn short_transfers_are_polled_and_framed() {
        let log: Log = Default::default();
        let mut dev = device(Bus::new(log.clone()), &log, u32::MAX);
        let mut buf = [0; 2];
        dev.transaction(&mut [Operation::Write(&[0x9F, 0x00]), Operation::Read(&mut buf)])
            .unwrap();
        assert_eq!(buf, [0xA5, 0xA5]);
        assert_eq!(
            *log.borrow(),
            [
                Event::CsLow,
                Event::CsLow,
                Event::Write(std::vec![0x9F, 0x00]),
                Event::Read(2),
                Event::Flush,
                Event::CsHigh,
                Event::CsHigh,
            ]
        );
    }

    #[test]
    fn long_transfers_wait_for_completion_flag() {
        let log: Log = Default::default();
        let mut dev = device(Bus::new(log.clone()), &log, u32::MAX);
        let mut page = [0; 64];
        dev.transaction(&mut [
            Operation::Write(&[0x03, 0x00, 0x00, 0x00]),
            Operation::Read(&mut page),
        ])
        .unwrap();
        assert!(page.iter().all(|&b| b == 0x5A));

        let data = [0x11; 10];
        dev.transaction(&mut [Operation::Write(&[0x02, 0x00, 0x00]), Operation::Write(&data)])
            .unwrap();

        let log = log.borrow();
        assert!(log.contains(&Event::DmaRead(64)));
        assert!(log.contains(&Event::DmaWrite(data.to_vec())));
        // Headers stay below the threshold
        assert!(log.contains(&Event::Write(std::vec![0x03, 0x00, 0x00, 0x00])));
        assert_eq!(log.iter().filter(|e| **e == Event::CsLow).count(), 4);
        assert_eq!(log.iter().filter(|e| **e == Event::CsHigh).count(), 4);
    }

    #[test]
    fn stalled_transfer_times_out_and_releases_cs() {
        let log: Log = Default::default();
        let mut bus = Bus::new(log.clone());
        bus.stall = true;
        let mut dev = device(bus, &log, 1000);
        let mut page = [0; 32];
        let err = dev
            .transaction(&mut [Operation::Write(&[0x03, 0, 0, 0]), Operation::Read(&mut page)])
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(log.borrow().last(), Some(&Event::CsHigh));
    }

    #[test]
    fn failed_transfer_releases_cs() {
        let log: Log = Default::default();
        let mut bus = Bus::new(log.clone());
        bus.fail_reads = true;
        let mut dev = device(bus, &log, 1000);
        let mut buf = [0; 1];
        let err = dev
            .transaction(&mut [Operation::Write(&[0x0F, 0xC0]), Operation::Read(&mut buf)])
            .unwrap_err();
        assert_eq!(err, TransportError::Spi(ErrorKind::Overrun));
        assert_eq!(spi::Error::kind(&err), ErrorKind::Overrun);
        let log = log.borrow();
        let n = log.len();
        assert_eq!(&log[n - 2..], &[Event::CsHigh, Event::CsHigh]);
    }

    #[test]
    fn delay_is_rejected() {
        let log: Log = Default::default();
        let mut dev = device(Bus::new(log.clone()), &log, 1000);
        assert_eq!(
            dev.transaction(&mut [Operation::DelayNs(10)]).unwrap_err(),
            TransportError::DelayNotSupported
        );
    }

    #[test]
    fn polled_bus_signals_immediately() {
        let log: Log = Default::default();
        let mut polled = Polled::new(Bus::new(log.clone()));
        polled.completion().arm();
        polled.start_write(&[1; 16]).unwrap();
        assert!(polled.completion().is_complete());
        assert_eq!(polled.completion().wait(0), Some(0));
        let bus = polled.into_inner();
        assert_eq!(*bus.log.borrow(), [Event::Write(std::vec![1; 16])]);
    }

    #[test]
    fn completion_flag_wait_limit() {
        let flag = TransferComplete::new();
        assert!(flag.is_complete());
        flag.arm();
        assert_eq!(flag.wait(5), None);
        flag.signal();
        assert_eq!(flag.wait(5), Some(0));
    }
}
