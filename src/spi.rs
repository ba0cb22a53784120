//! # Serial Peripheral Interface - PS SPI transfer engine
//!
//! ## Overview
//!
//! The PS SPI controller moves bytes through a pair of 128-byte FIFOs.
//! This driver mediates all byte-level movement between caller-supplied
//! buffers and those FIFOs, in master or slave role, through two
//! engines sharing one batching algorithm:
//!
//! - a blocking, polled engine ([`Spi::polled_transfer`]) that runs a
//!   transfer to completion before returning, and
//! - a non-blocking, interrupt-driven engine ([`Spi::transfer`]) that
//!   queues the first FIFO batch and advances from
//!   [`Spi::handle_interrupt`], reporting completion and faults through
//!   a registered [`StatusHandler`].
//!
//! For every byte transmitted the bus delivers one received byte, so
//! each engine drains exactly as many bytes as it queued in the
//! preceding fill pass. The receive side always trails the transmit
//! side, which is what makes the in-place variants sound.
//!
//! ## Configuration
//!
//! Master/slave role, clock mode and divider, manual start and manual
//! chip-select are collected in [`Config`] and applied at construction
//! or through [`Spi::apply_config`].
//!
//! ## Usage
//!
//! The driver implements the blocking [`SpiBus`](embedded_hal::spi::SpiBus)
//! and non-blocking [`FullDuplex`](embedded_hal_nb::spi::FullDuplex)
//! traits from embedded-hal@1.x.
//!
//! The driver claims no interrupt vector; call
//! [`Spi::handle_interrupt`] from the platform handler for the
//! controller, and share the driver between that handler and thread
//! context with whatever mutual exclusion the platform provides (for
//! example a `critical_section::Mutex<RefCell<...>>`).
//!
//! ## Examples
//!
//! ```rust,no_run
//! use zynq_spi::regs::Mmio;
//! use zynq_spi::spi::{Config, SlaveSelect, Spi};
//!
//! let mut spi = Spi::new(
//!     unsafe { Mmio::spi0() },
//!     Config::default().with_manual_slave_select(true),
//! );
//! spi.set_slave_select(SlaveSelect::Ss0).unwrap();
//!
//! let tx = [0x9F, 0x00, 0x00, 0x00];
//! let mut rx = [0u8; 4];
//! spi.polled_transfer(&tx, Some(&mut rx)).unwrap();
//! ```

use core::cmp;

use enumset::{EnumSet, EnumSetType};

use crate::regs::{cr, ixr, Instance, Reg};

/// Padding byte transmitted when there are more bytes to receive than
/// were supplied for sending.
const EMPTY_WRITE_PAD: u8 = 0x00;

/// SPI transfer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Another transfer is already in progress. The driver never
    /// retries internally; the caller decides when to try again.
    Busy,
}

#[cfg(feature = "embedded-hal")]
impl embedded_hal::spi::Error for Error {
    fn kind(&self) -> embedded_hal::spi::ErrorKind {
        embedded_hal::spi::ErrorKind::Other
    }
}

/// Events reported to the registered [`StatusHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiEvent {
    /// The requested transfer completed; every byte has round-tripped
    /// through the controller.
    TransferDone,
    /// The controller was selected as a slave while configured as a
    /// master. The in-flight transfer has been aborted.
    ModeFault,
    /// Received data was dropped because the RX FIFO was full.
    RxOverrun,
    /// The bus clocked data out of an empty TX FIFO (slave role).
    TxUnderrun,
}

/// Enumeration of the controller's interrupt sources.
#[derive(Debug, Hash, EnumSetType)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiInterrupt {
    /// Received data was dropped because the RX FIFO was full.
    RxOverrun,
    /// Selected as a slave while configured as a master.
    ModeFault,
    /// TX FIFO fill level dropped below the threshold.
    TxFifoNotFull,
    /// TX FIFO is full.
    TxFifoFull,
    /// RX FIFO holds at least one byte.
    RxFifoNotEmpty,
    /// RX FIFO is full.
    RxFifoFull,
    /// The bus clocked data out of an empty TX FIFO (slave role).
    TxUnderflow,
}

impl SpiInterrupt {
    fn mask(self) -> u32 {
        match self {
            SpiInterrupt::RxOverrun => ixr::RX_OVERFLOW,
            SpiInterrupt::ModeFault => ixr::MODE_FAULT,
            SpiInterrupt::TxFifoNotFull => ixr::TX_NOT_FULL,
            SpiInterrupt::TxFifoFull => ixr::TX_FULL,
            SpiInterrupt::RxFifoNotEmpty => ixr::RX_NOT_EMPTY,
            SpiInterrupt::RxFifoFull => ixr::RX_FULL,
            SpiInterrupt::TxUnderflow => ixr::TX_UNDERFLOW,
        }
    }
}

fn interrupt_bits(interrupts: EnumSet<SpiInterrupt>) -> u32 {
    interrupts
        .iter()
        .fold(0, |bits, interrupt| bits | interrupt.mask())
}

/// Upper-layer sink for transfer status events.
///
/// Invoked from [`Spi::handle_interrupt`], i.e. in interrupt context;
/// implementations should record the event and return quickly. When a
/// fault is delivered the driver has already returned the controller to
/// an idle state, so the handler never has to clean up.
pub trait StatusHandler {
    /// Called with the event and the number of bytes that had completed
    /// the round trip through the controller when the event was raised.
    fn on_event(&self, event: SpiEvent, bytes_transferred: usize);
}

/// Master or slave operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// The controller drives SCLK and the chip-select lines.
    #[default]
    Master,
    /// An external master drives the bus.
    Slave,
}

/// SPI mode (clock polarity and phase).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SpiMode {
    /// CPOL = 0, CPHA = 0
    #[default]
    Mode0,
    /// CPOL = 0, CPHA = 1
    Mode1,
    /// CPOL = 1, CPHA = 0
    Mode2,
    /// CPOL = 1, CPHA = 1
    Mode3,
}

/// Divisor applied to the SPI reference clock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockDivider {
    /// Divide by 4.
    #[default]
    Div4 = 0b001,
    /// Divide by 8.
    Div8 = 0b010,
    /// Divide by 16.
    Div16 = 0b011,
    /// Divide by 32.
    Div32 = 0b100,
    /// Divide by 64.
    Div64 = 0b101,
    /// Divide by 128.
    Div128 = 0b110,
    /// Divide by 256.
    Div256 = 0b111,
}

/// Chip-select line selection.
///
/// The hardware drives the selected line low and the others high; the
/// register field is active low, one line per selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveSelect {
    /// Chip-select line 0.
    Ss0,
    /// Chip-select line 1.
    Ss1,
    /// Chip-select line 2.
    Ss2,
    /// No line asserted.
    Unselected,
}

impl SlaveSelect {
    /// Encodes the selection as the active-low chip-select field value.
    fn encode(self) -> u32 {
        match self {
            SlaveSelect::Ss0 => 0xE,
            SlaveSelect::Ss1 => 0xD,
            SlaveSelect::Ss2 => 0xB,
            SlaveSelect::Unselected => 0xF,
        }
    }

    /// Decodes a chip-select field value back to a line selection.
    ///
    /// Field values whose 4-bit complement is zero or greater than four
    /// decode to [`SlaveSelect::Unselected`]; everything else maps
    /// through `complement / 2`. A corrupted value with two lines
    /// driven low can therefore decode to a single line instead of
    /// being rejected.
    fn decode(field: u32) -> Self {
        let inverted = !field & 0xF;
        if inverted == 0 || inverted > 4 {
            return SlaveSelect::Unselected;
        }
        match inverted / 2 {
            0 => SlaveSelect::Ss0,
            1 => SlaveSelect::Ss1,
            _ => SlaveSelect::Ss2,
        }
    }
}

/// SPI controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub struct Config {
    /// Master or slave operation.
    pub role: Role,

    /// SPI mode.
    pub mode: SpiMode,

    /// Reference clock divisor.
    pub clock_divider: ClockDivider,

    /// Require an explicit start command per FIFO batch instead of
    /// clocking as soon as data is queued (master role only).
    pub manual_start: bool,

    /// Software asserts the chip-select line for the whole transfer and
    /// deasserts it afterwards, instead of the hardware framing each
    /// word.
    pub manual_slave_select: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            role: Role::Master,
            mode: SpiMode::Mode0,
            clock_divider: ClockDivider::Div4,
            manual_start: false,
            manual_slave_select: false,
        }
    }
}

impl Config {
    /// Assigns the master or slave role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Assigns the SPI mode.
    pub fn with_mode(mut self, mode: SpiMode) -> Self {
        self.mode = mode;
        self
    }

    /// Assigns the reference clock divisor.
    pub fn with_clock_divider(mut self, clock_divider: ClockDivider) -> Self {
        self.clock_divider = clock_divider;
        self
    }

    /// Enables or disables manual start.
    pub fn with_manual_start(mut self, manual_start: bool) -> Self {
        self.manual_start = manual_start;
        self
    }

    /// Enables or disables manual chip-select control.
    pub fn with_manual_slave_select(mut self, manual_slave_select: bool) -> Self {
        self.manual_slave_select = manual_slave_select;
        self
    }

    fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// Control-register value for this configuration, with the
    /// chip-select field supplied by the caller.
    fn cr_value(&self, slave_select: u32) -> u32 {
        let mut value = cr::MODEFAIL_GEN_EN | slave_select;
        value |= (self.clock_divider as u32) << cr::BAUD_DIV_SHIFT;
        if self.is_master() {
            value |= cr::MASTER;
        }
        if self.manual_start {
            value |= cr::MANSTRT_EN;
        }
        if self.manual_slave_select {
            value |= cr::MANUAL_CS;
        }
        match self.mode {
            SpiMode::Mode0 => {}
            SpiMode::Mode1 => value |= cr::CPHA,
            SpiMode::Mode2 => value |= cr::CPOL,
            SpiMode::Mode3 => value |= cr::CPOL | cr::CPHA,
        }
        value
    }
}

/// Cursors over the caller-supplied storage of one transfer.
///
/// The receive cursor trails the transmit cursor by however many bytes
/// sit in the FIFOs. An in-place slot is therefore only written after
/// the byte it held has been consumed by the hardware.
enum TransferBuffers<'t> {
    /// Send only; received bytes are discarded.
    Tx { tx: &'t [u8], pos: usize },
    /// Receive only; the pad byte is transmitted for every byte read.
    Rx { rx: &'t mut [u8], pos: usize },
    /// Distinct send and receive buffers. A shorter send side is padded
    /// and a shorter receive side discards the excess.
    TxRx {
        tx: &'t [u8],
        tx_pos: usize,
        rx: &'t mut [u8],
        rx_pos: usize,
    },
    /// One buffer for both directions, overwritten in place.
    InPlace {
        buf: &'t mut [u8],
        tx_pos: usize,
        rx_pos: usize,
    },
}

impl<'t> TransferBuffers<'t> {
    /// Total transfer length in bytes.
    fn len(&self) -> usize {
        match self {
            TransferBuffers::Tx { tx, .. } => tx.len(),
            TransferBuffers::Rx { rx, .. } => rx.len(),
            TransferBuffers::TxRx { tx, rx, .. } => cmp::max(tx.len(), rx.len()),
            TransferBuffers::InPlace { buf, .. } => buf.len(),
        }
    }

    fn next_send_byte(&mut self) -> u8 {
        match self {
            TransferBuffers::Tx { tx, pos } => {
                let byte = tx[*pos];
                *pos += 1;
                byte
            }
            TransferBuffers::Rx { .. } => EMPTY_WRITE_PAD,
            TransferBuffers::TxRx { tx, tx_pos, .. } => {
                let byte = tx.get(*tx_pos).copied().unwrap_or(EMPTY_WRITE_PAD);
                *tx_pos += 1;
                byte
            }
            TransferBuffers::InPlace { buf, tx_pos, .. } => {
                let byte = buf[*tx_pos];
                *tx_pos += 1;
                byte
            }
        }
    }

    fn store_recv_byte(&mut self, byte: u8) {
        match self {
            TransferBuffers::Tx { .. } => {}
            TransferBuffers::Rx { rx, pos } => {
                rx[*pos] = byte;
                *pos += 1;
            }
            TransferBuffers::TxRx { rx, rx_pos, .. } => {
                if let Some(slot) = rx.get_mut(*rx_pos) {
                    *slot = byte;
                }
                *rx_pos += 1;
            }
            TransferBuffers::InPlace { buf, rx_pos, .. } => {
                buf[*rx_pos] = byte;
                *rx_pos += 1;
            }
        }
    }

    fn into_parts(self) -> (Option<&'t [u8]>, Option<&'t mut [u8]>) {
        match self {
            TransferBuffers::Tx { tx, .. } => (Some(tx), None),
            TransferBuffers::Rx { rx, .. } => (None, Some(rx)),
            TransferBuffers::TxRx { tx, rx, .. } => (Some(tx), Some(rx)),
            TransferBuffers::InPlace { buf, .. } => (None, Some(buf)),
        }
    }
}

/// Fills the TX FIFO from the send cursor, bounded by the FIFO depth
/// and the bytes left to queue. Returns the number of bytes queued.
fn fill_tx_fifo<I: Instance>(
    spi: &mut I,
    buffers: &mut TransferBuffers<'_>,
    remaining: &mut usize,
) -> usize {
    let mut queued = 0;
    while *remaining > 0 && queued < I::FIFO_DEPTH {
        let byte = buffers.next_send_byte();
        spi.write_reg(Reg::TxData, byte.into());
        *remaining -= 1;
        queued += 1;
    }
    queued
}

/// Pops `count` bytes from the RX FIFO, mirroring the batch that was
/// just clocked out. The bus delivers one received byte per transmitted
/// byte, so the drain count always equals the preceding fill count.
fn drain_rx_fifo<I: Instance>(
    spi: &mut I,
    buffers: &mut TransferBuffers<'_>,
    requested: &mut usize,
    count: usize,
) {
    for _ in 0..count {
        let byte = spi.read_reg(Reg::RxData) as u8;
        buffers.store_recv_byte(byte);
        *requested -= 1;
    }
}

/// PS SPI driver.
///
/// At most one transfer is in flight per driver instance, enforced by
/// the busy flag. The busy check is not atomic: correctness relies on a
/// single calling thread plus the one asynchronous entry point,
/// [`Spi::handle_interrupt`].
pub struct Spi<'d, I: Instance> {
    spi: I,
    config: Config,
    /// Cached chip-select field, kept in control-register position.
    slave_select: u32,
    handler: Option<&'d dyn StatusHandler>,
    buffers: Option<TransferBuffers<'d>>,
    /// Bytes not yet retired from the receive side.
    requested_bytes: usize,
    /// Bytes not yet handed to the TX FIFO.
    remaining_bytes: usize,
    busy: bool,
}

impl<'d, I: Instance> Spi<'d, I> {
    /// Constructs the driver, resets the controller into its documented
    /// idle state and applies `config`.
    pub fn new(spi: I, config: Config) -> Self {
        let mut this = Spi {
            spi,
            config,
            slave_select: cr::SS_MASK,
            handler: None,
            buffers: None,
            requested_bytes: 0,
            remaining_bytes: 0,
            busy: false,
        };
        this.reset();
        this.write_config();
        this
    }

    /// Releases the register access object.
    pub fn free(self) -> I {
        self.spi
    }

    /// Registers the status handler that receives completion and fault
    /// events from the interrupt-driven engine.
    ///
    /// Raising an event without a registered handler is an upper-layer
    /// wiring bug and panics.
    pub fn set_status_handler(&mut self, handler: &'d dyn StatusHandler) {
        self.handler = Some(handler);
    }

    /// Reconfigures the controller.
    ///
    /// Fails with [`Error::Busy`] while a transfer is in flight.
    pub fn apply_config(&mut self, config: &Config) -> Result<(), Error> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.config = *config;
        self.write_config();
        Ok(())
    }

    /// True from the moment a transfer is accepted until it completes,
    /// faults or is aborted.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Selects which chip-select line is driven low during transfers,
    /// or deselects all of them.
    ///
    /// Fails with [`Error::Busy`] while a transfer is in flight; the
    /// selection must not change mid-transfer. Updates both the cached
    /// selection and the control register, clearing the previously
    /// asserted line first.
    pub fn set_slave_select(&mut self, select: SlaveSelect) -> Result<(), Error> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.slave_select = select.encode() << cr::SS_SHIFT;

        let mut config = self.spi.read_reg(Reg::Config);
        config &= !cr::SS_MASK;
        config |= self.slave_select;
        self.spi.write_reg(Reg::Config, config);
        Ok(())
    }

    /// Returns the line selection decoded from the cached chip-select
    /// field. See [`SlaveSelect`] decoding for how non-one-hot values
    /// are treated.
    pub fn slave_select(&self) -> SlaveSelect {
        SlaveSelect::decode(self.slave_select >> cr::SS_SHIFT)
    }

    /// Starts an interrupt-driven transfer and returns as soon as the
    /// first FIFO batch is queued.
    ///
    /// Completion and faults are signaled through the registered
    /// [`StatusHandler`]; the buffers are owned by the driver until
    /// then and are handed back by [`Spi::take_buffers`]. When `rx` is
    /// `None` the received bytes are discarded.
    ///
    /// Fails with [`Error::Busy`] while another transfer is in flight,
    /// leaving that transfer untouched. An empty `tx` or a receive
    /// buffer of different length is a caller bug and panics.
    pub fn transfer(&mut self, tx: &'d [u8], rx: Option<&'d mut [u8]>) -> Result<(), Error> {
        assert!(!tx.is_empty(), "zero-length transfer");
        let buffers = match rx {
            Some(rx) => {
                assert_eq!(tx.len(), rx.len(), "send and receive length mismatch");
                TransferBuffers::TxRx {
                    tx,
                    tx_pos: 0,
                    rx,
                    rx_pos: 0,
                }
            }
            None => TransferBuffers::Tx { tx, pos: 0 },
        };
        self.start_transfer(buffers)
    }

    /// Starts an interrupt-driven transfer that overwrites `buf` in
    /// place with the received bytes.
    ///
    /// See [`Spi::transfer`] for the completion contract.
    pub fn transfer_in_place(&mut self, buf: &'d mut [u8]) -> Result<(), Error> {
        assert!(!buf.is_empty(), "zero-length transfer");
        self.start_transfer(TransferBuffers::InPlace {
            buf,
            tx_pos: 0,
            rx_pos: 0,
        })
    }

    fn start_transfer(&mut self, mut buffers: TransferBuffers<'d>) -> Result<(), Error> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.busy = true;

        let len = buffers.len();
        self.requested_bytes = len;
        self.remaining_bytes = len;

        if self.config.manual_slave_select {
            self.assert_slave_select();
        }
        self.enable();

        // Stale sticky flags would fire as soon as the sources are
        // unmasked below.
        self.spi.write_reg(Reg::IntrStatus, ixr::WR_TO_CLR);

        fill_tx_fifo(&mut self.spi, &mut buffers, &mut self.remaining_bytes);
        self.buffers = Some(buffers);

        self.spi.write_reg(Reg::IntrEnable, ixr::DFLT);
        self.start_if_manual();
        Ok(())
    }

    /// Hands back the buffers of the most recent interrupt-driven
    /// transfer as `(send, receive)` once it is no longer in flight.
    ///
    /// In-place transfers return their buffer on the receive side.
    /// Returns `None` while a transfer is active or when there is
    /// nothing to hand back.
    pub fn take_buffers(&mut self) -> Option<(Option<&'d [u8]>, Option<&'d mut [u8]>)> {
        if self.busy {
            return None;
        }
        self.buffers.take().map(TransferBuffers::into_parts)
    }

    /// Transfers `tx` on the bus in polled mode, blocking until every
    /// byte has round-tripped through the controller.
    ///
    /// When `rx` is `None` the received bytes are discarded. Fails with
    /// [`Error::Busy`] while another transfer is in flight. An empty
    /// `tx` or a receive buffer of different length is a caller bug and
    /// panics.
    pub fn polled_transfer(&mut self, tx: &[u8], rx: Option<&mut [u8]>) -> Result<(), Error> {
        assert!(!tx.is_empty(), "zero-length transfer");
        let mut buffers = match rx {
            Some(rx) => {
                assert_eq!(tx.len(), rx.len(), "send and receive length mismatch");
                TransferBuffers::TxRx {
                    tx,
                    tx_pos: 0,
                    rx,
                    rx_pos: 0,
                }
            }
            None => TransferBuffers::Tx { tx, pos: 0 },
        };
        self.polled_run(&mut buffers)
    }

    /// Polled transfer that overwrites `buf` in place with the received
    /// bytes.
    pub fn polled_transfer_in_place(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        assert!(!buf.is_empty(), "zero-length transfer");
        self.polled_run(&mut TransferBuffers::InPlace {
            buf,
            tx_pos: 0,
            rx_pos: 0,
        })
    }

    /// The polled engine: fill, start, busy-wait, drain, until both
    /// counters reach zero.
    fn polled_run(&mut self, buffers: &mut TransferBuffers<'_>) -> Result<(), Error> {
        if self.busy {
            return Err(Error::Busy);
        }
        self.busy = true;

        let len = buffers.len();
        self.requested_bytes = len;
        self.remaining_bytes = len;

        if self.config.manual_slave_select {
            self.assert_slave_select();
        }
        self.enable();

        while self.remaining_bytes > 0 || self.requested_bytes > 0 {
            let queued = fill_tx_fifo(&mut self.spi, buffers, &mut self.remaining_bytes);
            self.start_if_manual();

            // The controller reports TX-not-full once the batch has
            // been clocked out.
            while self.spi.read_reg(Reg::IntrStatus) & ixr::TX_NOT_FULL == 0 {}

            drain_rx_fifo(&mut self.spi, buffers, &mut self.requested_bytes, queued);
        }

        if self.config.manual_slave_select {
            self.deassert_slave_select();
        }
        self.busy = false;
        self.disable();
        Ok(())
    }

    /// Services one controller interrupt. Call from the platform's
    /// interrupt handler for this instance.
    ///
    /// The raw status is latched, its sticky bits cleared and the
    /// completion source masked before any processing, so events raised
    /// while the handler itself runs are not lost. A mode fault
    /// invalidates the in-flight transfer and short-circuits the
    /// remaining status bits; the other flags are serviced
    /// independently and more than one may be handled per invocation.
    pub fn handle_interrupt(&mut self) {
        let status = self.spi.read_reg(Reg::IntrStatus);
        self.spi.write_reg(Reg::IntrStatus, status & ixr::WR_TO_CLR);
        // Refilling the FIFO from within the handler would re-raise the
        // completion source immediately.
        self.spi.write_reg(Reg::IntrDisable, ixr::TX_NOT_FULL);

        if status & ixr::MODE_FAULT != 0 {
            let bytes_done = self.bytes_transferred();
            warn!("mode fault after {} bytes", bytes_done);
            self.abort();
            self.notify(SpiEvent::ModeFault, bytes_done);
            return;
        }

        if status & ixr::TX_NOT_FULL != 0 && self.busy {
            // A batch finished clocking; every transmitted byte has a
            // received counterpart waiting in the RX FIFO.
            if let Some(buffers) = self.buffers.as_mut() {
                let in_flight = self.requested_bytes - self.remaining_bytes;
                drain_rx_fifo(
                    &mut self.spi,
                    buffers,
                    &mut self.requested_bytes,
                    in_flight,
                );
                fill_tx_fifo(&mut self.spi, buffers, &mut self.remaining_bytes);
            }

            if self.remaining_bytes == 0 && self.requested_bytes == 0 {
                self.spi.write_reg(Reg::IntrDisable, ixr::DFLT);
                if self.config.manual_slave_select {
                    self.deassert_slave_select();
                }
                self.busy = false;
                self.disable();
                self.notify(SpiEvent::TransferDone, self.bytes_transferred());
            } else {
                self.spi.write_reg(Reg::IntrEnable, ixr::TX_NOT_FULL);
                self.start_if_manual();
            }
        }

        if status & ixr::RX_OVERFLOW != 0 {
            let bytes_done = self.bytes_transferred();
            warn!("receive overrun after {} bytes", bytes_done);
            self.busy = false;
            if self.config.manual_slave_select {
                self.deassert_slave_select();
            }
            self.notify(SpiEvent::RxOverrun, bytes_done);
        }

        if status & ixr::TX_UNDERFLOW != 0 {
            let bytes_done = self.bytes_transferred();
            warn!("transmit underrun after {} bytes", bytes_done);
            self.busy = false;
            if self.config.manual_slave_select {
                self.deassert_slave_select();
            }
            self.notify(SpiEvent::TxUnderrun, bytes_done);
        }
    }

    /// Forcibly terminates any transfer in progress.
    ///
    /// Disables the controller, drains and discards everything in the
    /// RX FIFO, clears the mode-fault flag and zeroes the byte counters
    /// and the busy flag. Safe to call at any time; with no transfer
    /// active it only clears stale state.
    pub fn abort(&mut self) {
        trace!("spi abort");
        self.disable();

        while self.spi.read_reg(Reg::IntrStatus) & ixr::RX_NOT_EMPTY != 0 {
            let _ = self.spi.read_reg(Reg::RxData);
        }

        self.spi.write_reg(Reg::IntrStatus, ixr::MODE_FAULT);

        self.remaining_bytes = 0;
        self.requested_bytes = 0;
        self.busy = false;
    }

    /// Aborts any transfer in progress and restores the control
    /// register to its documented reset value.
    ///
    /// The cached configuration is not reapplied; follow up with
    /// [`Spi::apply_config`] to bring the controller back to the
    /// configured state.
    pub fn reset(&mut self) {
        trace!("spi reset");
        self.abort();
        self.spi.write_reg(Reg::Config, cr::RESET_STATE);
    }

    /// Unmasks interrupt generation for the given sources.
    pub fn listen(&mut self, interrupts: impl Into<EnumSet<SpiInterrupt>>) {
        self.spi
            .write_reg(Reg::IntrEnable, interrupt_bits(interrupts.into()));
    }

    /// Masks interrupt generation for the given sources.
    pub fn unlisten(&mut self, interrupts: impl Into<EnumSet<SpiInterrupt>>) {
        self.spi
            .write_reg(Reg::IntrDisable, interrupt_bits(interrupts.into()));
    }

    /// Returns the interrupt sources currently asserted in the status
    /// register.
    pub fn interrupts(&mut self) -> EnumSet<SpiInterrupt> {
        let status = self.spi.read_reg(Reg::IntrStatus);
        let mut res = EnumSet::new();
        for interrupt in EnumSet::<SpiInterrupt>::all() {
            if status & interrupt.mask() != 0 {
                res.insert(interrupt);
            }
        }
        res
    }

    /// Clears the sticky status bits among the given sources.
    pub fn clear_interrupts(&mut self, interrupts: impl Into<EnumSet<SpiInterrupt>>) {
        self.spi
            .write_reg(Reg::IntrStatus, interrupt_bits(interrupts.into()));
    }

    /// Reads a byte from the RX FIFO without blocking.
    pub fn read_byte(&mut self) -> nb::Result<u8, Error> {
        if self.spi.read_reg(Reg::IntrStatus) & ixr::RX_NOT_EMPTY == 0 {
            return Err(nb::Error::WouldBlock);
        }
        Ok(self.spi.read_reg(Reg::RxData) as u8)
    }

    /// Queues a byte into the TX FIFO without blocking.
    pub fn write_byte(&mut self, word: u8) -> nb::Result<(), Error> {
        if self.spi.read_reg(Reg::IntrStatus) & ixr::TX_FULL != 0 {
            return Err(nb::Error::WouldBlock);
        }
        self.spi.write_reg(Reg::TxData, word.into());
        Ok(())
    }

    /// Bytes retired from the receive side of the current or most
    /// recent transfer.
    fn bytes_transferred(&self) -> usize {
        self.buffers
            .as_ref()
            .map_or(0, |buffers| buffers.len() - self.requested_bytes)
    }

    fn notify(&self, event: SpiEvent, bytes_transferred: usize) {
        match self.handler {
            Some(handler) => handler.on_event(event, bytes_transferred),
            None => panic!("SPI status event raised with no handler registered"),
        }
    }

    fn write_config(&mut self) {
        self.spi
            .write_reg(Reg::Config, self.config.cr_value(self.slave_select));
    }

    fn assert_slave_select(&mut self) {
        let mut config = self.spi.read_reg(Reg::Config);
        config &= !cr::SS_MASK;
        config |= self.slave_select;
        self.spi.write_reg(Reg::Config, config);
    }

    fn deassert_slave_select(&mut self) {
        let config = self.spi.read_reg(Reg::Config);
        self.spi.write_reg(Reg::Config, config | cr::SS_MASK);
    }

    fn start_if_manual(&mut self) {
        if self.config.manual_start && self.config.is_master() {
            let config = self.spi.read_reg(Reg::Config);
            self.spi.write_reg(Reg::Config, config | cr::MANSTRT);
        }
    }

    fn enable(&mut self) {
        self.spi.write_reg(Reg::Enable, 1);
    }

    fn disable(&mut self) {
        self.spi.write_reg(Reg::Enable, 0);
    }
}

#[cfg(feature = "embedded-hal")]
impl<I: Instance> embedded_hal::spi::ErrorType for Spi<'_, I> {
    type Error = Error;
}

#[cfg(feature = "embedded-hal")]
impl<I: Instance> embedded_hal::spi::SpiBus for Spi<'_, I> {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.polled_run(&mut TransferBuffers::Rx { rx: words, pos: 0 })
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.polled_run(&mut TransferBuffers::Tx { tx: words, pos: 0 })
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        if read.is_empty() && write.is_empty() {
            return Ok(());
        }
        self.polled_run(&mut TransferBuffers::TxRx {
            tx: write,
            tx_pos: 0,
            rx: read,
            rx_pos: 0,
        })
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        if words.is_empty() {
            return Ok(());
        }
        self.polled_run(&mut TransferBuffers::InPlace {
            buf: words,
            tx_pos: 0,
            rx_pos: 0,
        })
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        // The polled engine drains both FIFOs before returning.
        Ok(())
    }
}

#[cfg(feature = "embedded-hal")]
impl<I: Instance> embedded_hal_nb::spi::FullDuplex for Spi<'_, I> {
    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.read_byte()
    }

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.write_byte(word)
    }
}
