//! qspiboot-dummy - In-memory hardware emulation for testing
//!
//! Provides the three collaborators a [`Bootloader`] needs, backed by
//! plain memory: a NOR flash behind [`DummyQspi`] (including a small
//! SFDP image so geometry discovery runs for real), a [`DummyUart`]
//! whose far end is held by the test as a [`HostPort`], and a
//! [`DummyBoard`] that counts watchdog pets and resets. Useful for
//! end-to-end protocol tests without hardware.
//!
//! [`Bootloader`]: qspiboot_core::device::Bootloader

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use qspiboot_core::device::Board;
use qspiboot_core::qspi::{opcodes, IoMode, QspiBus};
use qspiboot_core::transport::UartBus;
use qspiboot_core::Result;

/// Baud rates the emulated UART divisor can produce
pub const BAUD_RATES: [u32; 5] = [9_600, 19_200, 57_600, 115_200, 230_400];

/// Configuration for the emulated flash
#[derive(Debug, Clone)]
pub struct DummyConfig {
    /// Flash size in bytes (power of two)
    pub size: usize,
    /// Smallest erase granularity
    pub sector_size: usize,
    /// Erase opcode advertised in the SFDP basic table
    pub erase_opcode: u8,
    /// Status polls an erase stays busy for
    pub erase_polls: u32,
    /// Status polls a page program stays busy for
    pub program_polls: u32,
    /// Serve an SFDP image; false emulates a pre-SFDP flash
    pub sfdp_supported: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            size: 1024 * 1024,
            sector_size: 4096,
            erase_opcode: 0x20,
            erase_polls: 4,
            program_polls: 2,
            sfdp_supported: true,
        }
    }
}

/// In-memory NOR flash behind the QSPI bus seam
///
/// Models the parts of flash behavior the bootloader depends on:
/// programming only pulls bits low, erase requires a latched write
/// enable with the protect line released, and writes hold the WIP bit
/// for a configurable number of status polls.
pub struct DummyQspi {
    config: DummyConfig,
    data: Vec<u8>,
    sfdp: Vec<u8>,
    write_enabled: bool,
    protected: bool,
    busy_polls: u32,
    wip_jammed: bool,
}

impl DummyQspi {
    /// Create an erased flash from `config`
    pub fn new(config: DummyConfig) -> Self {
        let sfdp = if config.sfdp_supported {
            build_sfdp_image(&config)
        } else {
            Vec::new()
        };
        let data = vec![0xFF; config.size];
        Self {
            config,
            data,
            sfdp,
            write_enabled: false,
            protected: true,
            busy_polls: 0,
            wip_jammed: false,
        }
    }

    /// Create an erased flash with the default 1 MiB configuration
    pub fn new_default() -> Self {
        Self::new(DummyConfig::default())
    }

    /// The raw flash contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable flash contents, for seeding test images
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The configuration this flash was built from
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Fault injection: the WIP bit never clears again
    pub fn jam_write_in_progress(&mut self) {
        self.wip_jammed = true;
    }

    fn addr_be24(tx: &[u8]) -> usize {
        ((tx[1] as usize) << 16) | ((tx[2] as usize) << 8) | tx[3] as usize
    }

    fn start_write(&mut self, polls: u32) {
        self.busy_polls = if self.wip_jammed { u32::MAX } else { polls };
    }

    fn handle_sfdp_read(&self, addr: usize, rx: &mut [u8]) {
        for (i, slot) in rx.iter_mut().enumerate() {
            // Out-of-image reads float high, like a real bus
            *slot = self.sfdp.get(addr + i).copied().unwrap_or(0xFF);
        }
    }

    fn handle_erase(&mut self, addr: usize) {
        if self.write_enabled && !self.protected {
            let sector = addr & !(self.config.sector_size - 1);
            let end = (sector + self.config.sector_size).min(self.data.len());
            self.data[sector..end].fill(0xFF);
            let polls = self.config.erase_polls;
            self.start_write(polls);
        }
        self.write_enabled = false;
    }

    fn handle_program(&mut self, addr: usize, payload: &[u8]) {
        if self.write_enabled && !self.protected {
            for (i, &byt) in payload.iter().enumerate() {
                if let Some(slot) = self.data.get_mut(addr + i) {
                    // Programming only pulls bits low
                    *slot &= byt;
                }
            }
            let polls = self.config.program_polls;
            self.start_write(polls);
        }
        self.write_enabled = false;
    }
}

impl QspiBus for DummyQspi {
    fn write_then_read(
        &mut self,
        _mode: IoMode,
        tx: &[u8],
        _dummy_cycles: usize,
        rx: &mut [u8],
    ) -> Result<()> {
        match tx[0] {
            opcodes::RDSFDP => self.handle_sfdp_read(Self::addr_be24(tx), rx),
            opcodes::RDSR => {
                rx[0] = if self.busy_polls > 0 { 0x01 } else { 0x00 };
                if self.busy_polls > 0 && !self.wip_jammed {
                    self.busy_polls -= 1;
                }
            }
            opcodes::WREN => self.write_enabled = true,
            opcodes::WRDI => self.write_enabled = false,
            opcodes::READ => {
                let addr = Self::addr_be24(tx);
                for (i, slot) in rx.iter_mut().enumerate() {
                    *slot = self.data.get(addr + i).copied().unwrap_or(0xFF);
                }
            }
            op if op == self.config.erase_opcode => self.handle_erase(Self::addr_be24(tx)),
            other => {
                log::warn!("DummyQspi: ignoring opcode 0x{:02X}", other);
            }
        }
        Ok(())
    }

    fn scatter_write(&mut self, _mode: IoMode, parts: &[&[u8]]) -> Result<()> {
        let mut stream = Vec::new();
        for part in parts {
            stream.extend_from_slice(part);
        }
        match stream[0] {
            opcodes::PP => {
                let addr = Self::addr_be24(&stream);
                let payload = stream[4..].to_vec();
                self.handle_program(addr, &payload);
            }
            other => {
                log::warn!("DummyQspi: ignoring scatter opcode 0x{:02X}", other);
            }
        }
        Ok(())
    }

    fn set_write_protect(&mut self, protect: bool) {
        self.protected = protect;
    }
}

/// SFDP image: header, one parameter header, the basic table at 0x30
fn build_sfdp_image(config: &DummyConfig) -> Vec<u8> {
    const TABLE_OFFSET: usize = 0x30;
    let mut sfdp = vec![0xFF; TABLE_OFFSET + 36];
    sfdp[0..4].copy_from_slice(b"SFDP");
    sfdp[4] = 0x06; // minor revision
    sfdp[5] = 0x01; // major revision
    sfdp[6] = 0x00; // one parameter header

    sfdp[8] = 0x00; // basic flash parameter table
    sfdp[9] = 0x06;
    sfdp[10] = 0x01;
    sfdp[11] = 9; // 9 dwords
    sfdp[12..15].copy_from_slice(&[TABLE_OFFSET as u8, 0x00, 0x00]);

    sfdp[TABLE_OFFSET + 2] = config.erase_opcode;
    let density_bits = 0x8000_0000u32 | ((config.size as u32).trailing_zeros() + 3);
    sfdp[TABLE_OFFSET + 4..TABLE_OFFSET + 8].copy_from_slice(&density_bits.to_le_bytes());
    // Sector type 1: the configured sector, type 2: 64 KiB block erase
    sfdp[TABLE_OFFSET + 28] = config.sector_size.trailing_zeros() as u8;
    sfdp[TABLE_OFFSET + 29] = config.erase_opcode;
    sfdp[TABLE_OFFSET + 30] = 16;
    sfdp[TABLE_OFFSET + 31] = 0xD8;
    sfdp
}

struct WirePair {
    host_to_device: VecDeque<u8>,
    device_to_host: VecDeque<u8>,
    baud: u32,
}

/// Device end of an emulated serial link
pub struct DummyUart(Rc<RefCell<WirePair>>);

/// Test-side end of an emulated serial link
pub struct HostPort(Rc<RefCell<WirePair>>);

/// Create a connected UART pair
pub fn uart_pair() -> (DummyUart, HostPort) {
    let wire = Rc::new(RefCell::new(WirePair {
        host_to_device: VecDeque::new(),
        device_to_host: VecDeque::new(),
        baud: 115_200,
    }));
    (DummyUart(wire.clone()), HostPort(wire))
}

impl UartBus for DummyUart {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut wire = self.0.borrow_mut();
        let mut n = 0;
        while n < buf.len() {
            match wire.host_to_device.pop_front() {
                Some(byt) => {
                    buf[n] = byt;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let mut wire = self.0.borrow_mut();
        wire.device_to_host.extend(data.iter().copied());
        data.len()
    }

    fn tx_idle(&self) -> bool {
        true
    }

    fn baudrate_supported(&self, baud: u32) -> bool {
        BAUD_RATES.contains(&baud)
    }

    fn set_baudrate(&mut self, baud: u32) -> bool {
        if !BAUD_RATES.contains(&baud) {
            return false;
        }
        self.0.borrow_mut().baud = baud;
        true
    }
}

impl HostPort {
    /// Queue bytes for the device to receive
    pub fn send(&self, data: &[u8]) {
        self.0
            .borrow_mut()
            .host_to_device
            .extend(data.iter().copied());
    }

    /// Take everything the device has transmitted so far
    pub fn receive(&self) -> Vec<u8> {
        self.0.borrow_mut().device_to_host.drain(..).collect()
    }

    /// Current UART divisor setting
    pub fn baud(&self) -> u32 {
        self.0.borrow().baud
    }
}

/// Board collaborator that records what the engine asked of it
pub struct DummyBoard {
    chip_id: [u8; 5],
    /// Watchdog services since construction
    pub pets: u64,
    /// Reset requests since construction
    pub resets: u32,
}

impl DummyBoard {
    /// Board reporting the given identification registers
    pub fn new(chip_id: [u8; 5]) -> Self {
        Self {
            chip_id,
            pets: 0,
            resets: 0,
        }
    }
}

impl Default for DummyBoard {
    fn default() -> Self {
        Self::new([0x34, 0x38, 0x30, 0x08, 0x01])
    }
}

impl Board for DummyBoard {
    fn chip_id(&mut self) -> [u8; 5] {
        self.chip_id
    }

    fn pet_watchdog(&mut self) {
        self.pets += 1;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qspiboot_core::flash;
    use qspiboot_core::sfdp;

    #[test]
    fn sfdp_probe_reports_configured_geometry() {
        let mut qspi = DummyQspi::new_default();
        let geometry = sfdp::probe(&mut qspi).unwrap();
        assert_eq!(geometry.size_bytes, 1024 * 1024);
        assert_eq!(geometry.erase_opcode_4kib, 0x20);
        assert_eq!(geometry.sector_types[0].size_exponent, 12);
        assert_eq!(geometry.sector_types[1].erase_opcode, 0xD8);
    }

    #[test]
    fn flash_without_sfdp_probes_as_unknown() {
        let mut qspi = DummyQspi::new(DummyConfig {
            sfdp_supported: false,
            ..DummyConfig::default()
        });
        let geometry = sfdp::probe(&mut qspi).unwrap();
        assert_eq!(geometry.size_bytes, 0);
        // The JEDEC fallback still allows erasing
        assert_eq!(geometry.sector_erase_opcode(), 0x20);
    }

    #[test]
    fn program_pulls_bits_low_and_erase_restores() {
        let mut qspi = DummyQspi::new_default();
        let page = [0x5Au8; 256];
        flash::program_page(&mut qspi, 0x2000, &page, || {}).unwrap();
        assert_eq!(&qspi.data()[0x2000..0x2100], &page);

        // A second program cannot raise bits back to one
        let overlay = [0xA5u8; 256];
        flash::program_page(&mut qspi, 0x2000, &overlay, || {}).unwrap();
        assert!(qspi.data()[0x2000..0x2100].iter().all(|&b| b == 0x00));

        flash::erase_sector(&mut qspi, 0x20, 0x2000, || {}).unwrap();
        assert!(qspi.data()[0x2000..0x3000].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn writes_without_write_enable_are_ignored() {
        let mut qspi = DummyQspi::new_default();
        let cmd = [0x02, 0x00, 0x30, 0x00];
        let page = [0x00u8; 256];
        qspi.scatter_write(IoMode::Single, &[&cmd, &page]).unwrap();
        assert!(qspi.data()[0x3000..0x3100].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn jammed_wip_times_out() {
        let mut qspi = DummyQspi::new_default();
        qspi.jam_write_in_progress();
        let err = flash::erase_sector(&mut qspi, 0x20, 0, || {}).unwrap_err();
        assert_eq!(err, qspiboot_core::Error::FlashTimeout);
    }

    #[test]
    fn uart_pair_is_full_duplex() {
        let (mut uart, host) = uart_pair();
        host.send(&[1, 2, 3]);
        let mut buf = [0u8; 8];
        assert_eq!(uart.read(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        assert_eq!(uart.write(&[9, 8]), 2);
        assert_eq!(host.receive(), [9, 8]);

        assert!(uart.set_baudrate(230_400));
        assert_eq!(host.baud(), 230_400);
        assert!(!uart.set_baudrate(12_345));
    }
}
