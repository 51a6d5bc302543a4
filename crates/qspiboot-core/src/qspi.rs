//! QSPI bus seam and JEDEC flash constants
//!
//! The raw bit-transfer primitive (single/dual/quad I/O byte shifting)
//! is hardware-specific and lives behind [`QspiBus`]; this crate only
//! composes transfers out of it.

use crate::error::Result;
use bitflags::bitflags;

/// Transfer width on the flash bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Single I/O (1-1-1)
    Single,
    /// Dual I/O
    Dual,
    /// Quad I/O
    Quad,
}

/// JEDEC NOR flash opcodes used by the backend
pub mod opcodes {
    /// Read JEDEC ID
    pub const RDID: u8 = 0x9F;
    /// Read SFDP data
    pub const RDSFDP: u8 = 0x5A;
    /// Write enable
    pub const WREN: u8 = 0x06;
    /// Write disable
    pub const WRDI: u8 = 0x04;
    /// Read status register 1
    pub const RDSR: u8 = 0x05;
    /// Read data (3-byte address)
    pub const READ: u8 = 0x03;
    /// Page program (3-byte address)
    pub const PP: u8 = 0x02;
    /// 4KiB sector erase, the fallback when SFDP reports none
    pub const SE: u8 = 0x20;
}

bitflags! {
    /// Status register 1 bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Write in progress
        const WIP = 1 << 0;
        /// Write enable latch
        const WEL = 1 << 1;
    }
}

/// Raw QSPI transfer primitive (external collaborator)
///
/// Transfers are half-duplex: a TX phase, optional dummy cycles, then
/// an optional RX phase, all under one chip select.
pub trait QspiBus {
    /// Shift `tx` out, run `dummy_cycles`, then shift `rx.len()` bytes in
    fn write_then_read(
        &mut self,
        mode: IoMode,
        tx: &[u8],
        dummy_cycles: usize,
        rx: &mut [u8],
    ) -> Result<()>;

    /// Shift several TX buffers out under a single chip select
    ///
    /// Lets ProgramPage send opcode+address and the page payload without
    /// gathering them into one buffer first.
    fn scatter_write(&mut self, mode: IoMode, parts: &[&[u8]]) -> Result<()>;

    /// Drive the external write-protect line
    fn set_write_protect(&mut self, protect: bool);
}

/// Encode a 3-byte big-endian flash address
pub fn addr3(addr: u32) -> [u8; 3] {
    [(addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}
