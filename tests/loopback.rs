//! Loopback test suite for the transfer engines, run against the
//! bus-functional controller model.

use std::cell::Cell;

use zynq_spi::mock::MockSpi;
use zynq_spi::spi::{Config, SlaveSelect, Spi, SpiEvent, StatusHandler};

#[derive(Default)]
struct Recorder {
    event: Cell<Option<SpiEvent>>,
    bytes: Cell<usize>,
}

impl StatusHandler for Recorder {
    fn on_event(&self, event: SpiEvent, bytes_transferred: usize) {
        self.event.set(Some(event));
        self.bytes.set(bytes_transferred);
    }
}

#[test]
fn polled_transfer_round_trips() {
    let dev = MockSpi::<8>::new();
    let mut spi = Spi::new(
        &dev,
        Config::default()
            .with_manual_start(true)
            .with_manual_slave_select(true),
    );
    spi.set_slave_select(SlaveSelect::Ss0).unwrap();

    let tx: Vec<u8> = (0u8..50).collect();
    let mut rx = vec![0u8; 50];
    spi.polled_transfer(&tx, Some(&mut rx)).unwrap();

    assert_eq!(rx, tx);
    assert_eq!(dev.start_pulses(), 7);
    assert!(!spi.is_busy());
}

#[test]
fn interrupt_transfer_signals_completion() {
    let dev = MockSpi::<8>::new();
    let mut spi = Spi::new(&dev, Config::default().with_manual_start(true));
    let handler = Recorder::default();
    spi.set_status_handler(&handler);

    let tx = [0xA5u8; 20];
    let mut rx = [0u8; 20];
    spi.transfer(&tx, Some(&mut rx)).unwrap();

    while dev.irq_pending() {
        spi.handle_interrupt();
    }

    assert_eq!(handler.event.get(), Some(SpiEvent::TransferDone));
    assert_eq!(handler.bytes.get(), 20);

    let (_, rx_back) = spi.take_buffers().unwrap();
    assert_eq!(rx_back.unwrap(), &[0xA5u8; 20][..]);
}

#[test]
#[cfg(feature = "embedded-hal")]
fn spi_bus_write_then_read() {
    use embedded_hal::spi::SpiBus;

    let dev = MockSpi::<8>::new();
    let mut spi = Spi::new(&dev, Config::default());

    let write = [0xde, 0xad, 0xbe, 0xef];
    let mut read = [0u8; 4];
    SpiBus::transfer(&mut spi, &mut read, &write).unwrap();
    assert_eq!(read, write);
}
