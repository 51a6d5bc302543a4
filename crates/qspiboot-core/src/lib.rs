//! qspiboot-core - Protocol engine for the qspiboot UART bootloader
//!
//! This crate implements the portable part of a UART-controlled
//! bootloader/programmer for a microcontroller with external QSPI NOR
//! flash: a CRC-protected, length-delimited request/response state
//! machine layered over a ring-buffered serial transport, driving a
//! small set of flash operations (SFDP discovery, sector erase, page
//! program, chunked read/checksum).
//!
//! Hardware is consumed only through narrow traits so the same engine
//! runs on the device and against the in-memory emulation in
//! `qspiboot-dummy`:
//!
//! - [`transport::UartBus`] - non-blocking UART byte stream
//! - [`qspi::QspiBus`] - raw QSPI transfer primitive
//! - [`device::Board`] - chip id, watchdog, system reset
//!
//! # Example
//!
//! ```ignore
//! use qspiboot_core::device::{Board, Bootloader};
//!
//! let mut boot = Bootloader::new(uart, qspi, board);
//! boot.start();
//! boot.run(); // does not return on hardware
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod crc32;
pub mod device;
pub mod error;
pub mod flash;
pub mod qspi;
pub mod sfdp;
pub mod transport;
pub mod wire;

pub use error::{Error, Result};
