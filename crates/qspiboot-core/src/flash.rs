//! Flash command sequences
//!
//! Erase, program and read built from raw QSPI transfers plus
//! write-status polling. Every write operation is bracketed: clear the
//! external write protect and latch WREN before, re-assert protection
//! after, regardless of outcome. Poll loops take a pet callback so the
//! watchdog is serviced inside every data-dependent wait.

use crate::error::{Error, Result};
use crate::qspi::{addr3, opcodes, IoMode, QspiBus, Status};

/// Poll budget for a sector erase before reporting FlashTimeout
pub const ERASE_POLL_BUDGET: u32 = 0x4000;

/// Poll budget for a page program before reporting FlashTimeout
pub const PROGRAM_POLL_BUDGET: u32 = 0x400;

/// Read status register 1
pub fn read_status<Q: QspiBus + ?Sized>(bus: &mut Q) -> Result<Status> {
    let mut status = [0u8; 1];
    bus.write_then_read(IoMode::Single, &[opcodes::RDSR], 0, &mut status)?;
    Ok(Status::from_bits_truncate(status[0]))
}

/// Clear external write protect and latch the write enable bit
pub fn write_enable<Q: QspiBus + ?Sized>(bus: &mut Q) -> Result<()> {
    bus.set_write_protect(false);
    bus.write_then_read(IoMode::Single, &[opcodes::WREN], 0, &mut [])
}

/// Poll the write-in-progress bit until it clears or `budget` runs out
///
/// `pet` is called once per poll so long erases keep the watchdog fed.
pub fn wait_write_finished<Q, F>(bus: &mut Q, budget: u32, mut pet: F) -> Result<()>
where
    Q: QspiBus + ?Sized,
    F: FnMut(),
{
    for _ in 0..=budget {
        pet();
        if !read_status(bus)?.contains(Status::WIP) {
            return Ok(());
        }
    }
    Err(Error::FlashTimeout)
}

/// Erase the sector containing `addr` with the given erase opcode
pub fn erase_sector<Q, F>(bus: &mut Q, erase_opcode: u8, addr: u32, pet: F) -> Result<()>
where
    Q: QspiBus + ?Sized,
    F: FnMut(),
{
    write_enable(bus)?;

    let a = addr3(addr);
    let cmd = [erase_opcode, a[0], a[1], a[2]];
    let issued = bus.write_then_read(IoMode::Single, &cmd, 0, &mut []);

    let result = match issued {
        Ok(()) => wait_write_finished(bus, ERASE_POLL_BUDGET, pet),
        Err(e) => Err(e),
    };

    // Protection is re-asserted on the timeout path too
    bus.set_write_protect(true);
    result
}

/// Program one page at `addr`
///
/// Opcode+address and payload go out as one scatter transfer so the
/// page never has to be copied into a staging buffer.
pub fn program_page<Q, F>(bus: &mut Q, addr: u32, page: &[u8], pet: F) -> Result<()>
where
    Q: QspiBus + ?Sized,
    F: FnMut(),
{
    write_enable(bus)?;

    let a = addr3(addr);
    let cmd = [opcodes::PP, a[0], a[1], a[2]];
    let issued = bus.scatter_write(IoMode::Single, &[&cmd, page]);

    let result = match issued {
        Ok(()) => wait_write_finished(bus, PROGRAM_POLL_BUDGET, pet),
        Err(e) => Err(e),
    };

    bus.set_write_protect(true);
    result
}

/// Read `buf.len()` bytes starting at `addr`
pub fn read_into<Q: QspiBus + ?Sized>(bus: &mut Q, addr: u32, buf: &mut [u8]) -> Result<()> {
    let a = addr3(addr);
    let cmd = [opcodes::READ, a[0], a[1], a[2]];
    bus.write_then_read(IoMode::Single, &cmd, 0, buf)
}
