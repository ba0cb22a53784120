//! Bare-metal (`no_std`) driver for the SPI controller found in the AMD
//! Zynq-7000 processing system. Where applicable the driver implements
//! the [embedded-hal] traits.
//!
//! ## Overview
//!
//! The controller moves bytes through 128-byte transmit and receive
//! FIFOs and can operate as bus master or slave. The driver in [`spi`]
//! offers a blocking polled engine and a non-blocking interrupt-driven
//! engine over the same FIFO batching algorithm. The register-access
//! boundary in [`regs`] binds a driver to one of the two controller
//! instances or, behind the `mock` feature, to a host-side model for
//! testing upper-layer code.
//!
//! [embedded-hal]: https://docs.rs/embedded-hal/latest/embedded_hal/
//!
//! ## Feature Flags
#![doc = document_features::document_features!()]
#![deny(missing_docs)]
#![no_std]

// MUST go first so the other modules see its macros.
mod fmt;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod regs;
pub mod spi;
