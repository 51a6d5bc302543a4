//! Bootloader command engine
//!
//! The cooperative main loop: pump the transport, advance the framing
//! state machine, dispatch complete commands to the flash backend, and
//! keep the watchdog fed. Every state carries an iteration budget; a
//! link that goes quiet mid-frame exhausts it and the device resets
//! rather than wedging in a half-parsed state.
//!
//! CRC checks always run before any side effect. Every rejected command
//! produces exactly one response frame, then the receive stream is
//! restarted so host and device re-agree on frame boundaries.

use heapless::Vec;

use crate::crc32::{self, Crc32};
use crate::error::{Error, Result};
use crate::flash;
use crate::qspi::QspiBus;
use crate::sfdp::{self, FlashGeometry};
use crate::transport::{Transport, UartBus};
use crate::wire::{
    CommandHeader, Opcode, ResponseCode, ResponseHeader, BROADCAST_ID, COMMAND_HEADER_LEN,
    CRC_LEN, FRAME_MARKER, PAGE_SIZE,
};

/// Iteration budget while scanning for a frame marker
pub const HEADER_BUDGET: u32 = 0x10_0000;

/// Iteration budget between marker and complete header
pub const COMMAND_BUDGET: u32 = 0x1000;

/// Iteration budget between header and complete parameter block
pub const PARAM_BUDGET: u32 = 0x1_0000;

/// Iteration budget for draining the transmit path
pub const FLUSH_BUDGET: u32 = 0x10_0000;

/// Capacity of the parameter staging buffer
///
/// The largest frame is ProgramPage: 4 address bytes, one 256-byte page
/// and the 4-byte CRC trailer.
pub const PARAM_CAPACITY: usize = 512;

/// Chunk size for streaming flash reads
const READ_CHUNK: usize = PAGE_SIZE;

/// Board-level collaborators the portable engine cannot provide
pub trait Board {
    /// Chip identification registers, id1/id2/id3/mem_size/revision
    fn chip_id(&mut self) -> [u8; 5];

    /// Service the hardware watchdog
    fn pet_watchdog(&mut self);

    /// Trigger a system reset; on real hardware this does not return
    fn reset(&mut self);
}

/// Countdown guard for every data-dependent wait
///
/// One `tick` per loop iteration; exhaustion means the peer stopped
/// talking and the only safe answer is a reset.
struct PollBudget {
    remaining: u32,
}

impl PollBudget {
    fn new(limit: u32) -> Self {
        Self { remaining: limit }
    }

    /// False once the budget is spent
    fn tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Framing state between main-loop iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Scanning byte-by-byte for the frame marker
    WaitHeader,
    /// Marker seen, waiting for the 13-byte command header
    WaitCommand,
    /// Header accepted, waiting for parameters plus CRC trailer
    WaitParameter {
        opcode: Opcode,
        transaction_id: u32,
        param_len: u32,
    },
}

/// What a single engine step decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep looping
    Continue,
    /// Stop the loop and reset the board
    Shutdown(Shutdown),
}

/// Why the main loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// An iteration budget ran out, or the transmit path never drained
    LinkStalled,
    /// The host sent a Reset command
    HostReset,
}

fn read_le32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// The bootloader proper: transport, flash backend and framing engine
pub struct Bootloader<U: UartBus, Q: QspiBus, B: Board> {
    transport: Transport<U>,
    qspi: Q,
    board: B,
    geometry: FlashGeometry,
    state: State,
    budget: PollBudget,
    params: Vec<u8, PARAM_CAPACITY>,
}

impl<U: UartBus, Q: QspiBus, B: Board> Bootloader<U, Q, B> {
    /// Assemble a bootloader; flash geometry is unknown until [`start`]
    ///
    /// [`start`]: Self::start
    pub fn new(uart: U, qspi: Q, board: B) -> Self {
        Self {
            transport: Transport::new(uart),
            qspi,
            board,
            geometry: FlashGeometry::unknown(),
            state: State::WaitHeader,
            budget: PollBudget::new(HEADER_BUDGET),
            params: Vec::new(),
        }
    }

    /// Boot sequence: discover the flash, announce presence on the link
    pub fn start(&mut self) -> Result<()> {
        self.probe_flash()?;
        self.announce_online();
        Ok(())
    }

    /// Flash geometry discovered at boot
    pub fn geometry(&self) -> &FlashGeometry {
        &self.geometry
    }

    /// The board collaborator, for hosted inspection
    pub fn board(&self) -> &B {
        &self.board
    }

    fn probe_flash(&mut self) -> Result<()> {
        self.geometry = sfdp::probe(&mut self.qspi)?;
        log::info!("Flash size {} bytes", self.geometry.size_bytes);
        Ok(())
    }

    fn announce_online(&mut self) {
        for _ in 0..3 {
            self.send_status(ResponseCode::Online, BROADCAST_ID);
        }
    }

    /// Run the main loop until a fatal condition, then reset the board
    pub fn run(&mut self) -> Shutdown {
        loop {
            if let Flow::Shutdown(cause) = self.step() {
                self.board.reset();
                return cause;
            }
        }
    }

    /// One main-loop iteration: pump I/O, advance framing, tick budgets
    pub fn step(&mut self) -> Flow {
        self.transport.poll();
        if self.transport.overrun() {
            log::warn!("Receive overrun, resynchronizing");
            self.resync();
        }

        let flow = self.advance();
        self.board.pet_watchdog();
        if let Flow::Shutdown(_) = flow {
            return flow;
        }

        if self.budget.tick() {
            Flow::Continue
        } else {
            self.debug_message("Timeout elapsed, resetting\r\n");
            let _ = self.flush_link();
            Flow::Shutdown(Shutdown::LinkStalled)
        }
    }

    fn advance(&mut self) -> Flow {
        match self.state {
            State::WaitHeader => {
                if let Some(byt) = self.transport.read_byte() {
                    if byt == FRAME_MARKER {
                        self.state = State::WaitCommand;
                        self.budget = PollBudget::new(COMMAND_BUDGET);
                    }
                }
                Flow::Continue
            }
            State::WaitCommand => {
                self.take_command_header();
                Flow::Continue
            }
            State::WaitParameter {
                opcode,
                transaction_id,
                param_len,
            } => self.take_parameters(opcode, transaction_id, param_len),
        }
    }

    fn take_command_header(&mut self) {
        let mut raw = [0u8; COMMAND_HEADER_LEN];
        if !self.transport.copy_to(&mut raw) {
            return;
        }
        let hdr = CommandHeader::decode(&raw);

        if !hdr.crc_valid() {
            self.debug_message("Invalid CRC32 on header\r\n");
            self.send_status(ResponseCode::InvalidCrc, hdr.transaction_id);
            self.resync();
            return;
        }

        let Some(opcode) = Opcode::from_u8(hdr.opcode) else {
            self.send_status(ResponseCode::CmdInvalid, hdr.transaction_id);
            self.resync();
            return;
        };

        if hdr.param_len < opcode.min_param_len() {
            self.send_status(ResponseCode::ParamTooShort, hdr.transaction_id);
            self.resync();
            return;
        }

        // A parameter block that can never fit the staging buffer would
        // wedge WaitParameter until the budget fires; reject it up front.
        if hdr.param_len as usize + CRC_LEN > PARAM_CAPACITY {
            self.send_status(ResponseCode::InvalidParam, hdr.transaction_id);
            self.resync();
            return;
        }

        self.state = State::WaitParameter {
            opcode,
            transaction_id: hdr.transaction_id,
            param_len: hdr.param_len,
        };
        self.budget = PollBudget::new(PARAM_BUDGET);
    }

    fn take_parameters(&mut self, opcode: Opcode, transaction_id: u32, param_len: u32) -> Flow {
        let param_len = param_len as usize;

        if param_len == 0 {
            self.params.clear();
            let flow = self.dispatch(opcode, transaction_id);
            self.resync();
            return flow;
        }

        if self.transport.available() < param_len + CRC_LEN {
            return Flow::Continue;
        }

        self.params.clear();
        if self.params.resize(param_len, 0).is_err() {
            // Unreachable past the capacity gate in take_command_header
            self.send_status(ResponseCode::InvalidParam, transaction_id);
            self.resync();
            return Flow::Continue;
        }
        self.transport.copy_to(&mut self.params);

        let mut crc_raw = [0u8; CRC_LEN];
        self.transport.copy_to(&mut crc_raw);
        let expected = u32::from_le_bytes(crc_raw);

        if crc32::checksum(&self.params) != expected {
            self.debug_message("Invalid CRC32 on params\r\n");
            self.send_status(ResponseCode::InvalidCrc, transaction_id);
            self.resync();
            return Flow::Continue;
        }

        let flow = self.dispatch(opcode, transaction_id);
        self.resync();
        flow
    }

    /// Drop buffered input and re-arm the marker scan
    fn resync(&mut self) {
        self.transport.restart();
        self.state = State::WaitHeader;
        self.budget = PollBudget::new(HEADER_BUDGET);
    }

    fn dispatch(&mut self, opcode: Opcode, id: u32) -> Flow {
        match opcode {
            Opcode::Ping => {
                self.send_status(ResponseCode::Ok, id);
                Flow::Continue
            }
            Opcode::SetBaudrate => self.handle_set_baudrate(id),
            Opcode::FlashInfo => {
                let size = self.geometry.size_bytes;
                self.send_with_payload(ResponseCode::FlashInfo, id, &size.to_le_bytes());
                Flow::Continue
            }
            Opcode::EraseSector => {
                self.handle_erase_sector(id);
                Flow::Continue
            }
            Opcode::ProgramPage => {
                self.handle_program_page(id);
                Flow::Continue
            }
            Opcode::Reset => {
                self.send_status(ResponseCode::Ok, id);
                match self.flush_link() {
                    Ok(()) => Flow::Shutdown(Shutdown::HostReset),
                    Err(_) => Flow::Shutdown(Shutdown::LinkStalled),
                }
            }
            Opcode::ReadFlash => {
                self.handle_read_flash(id);
                Flow::Continue
            }
            Opcode::Checksum => {
                self.handle_checksum(id);
                Flow::Continue
            }
            Opcode::ChipId => {
                let chip_id = self.board.chip_id();
                self.send_with_payload(ResponseCode::ChipId, id, &chip_id);
                Flow::Continue
            }
        }
    }

    fn handle_set_baudrate(&mut self, id: u32) -> Flow {
        let baud = read_le32(&self.params);
        if !self.transport.baudrate_supported(baud) {
            self.send_status(ResponseCode::InvalidParam, id);
            return Flow::Continue;
        }

        // Acknowledge at the old rate, then switch once the line is dry
        self.send_status(ResponseCode::Ok, id);
        if self.flush_link().is_err() {
            return Flow::Shutdown(Shutdown::LinkStalled);
        }
        if !self.transport.set_baudrate(baud) {
            log::warn!("Baud rate {} rejected after support check", baud);
        }
        Flow::Continue
    }

    fn handle_erase_sector(&mut self, id: u32) {
        let addr = read_le32(&self.params);
        let erase_opcode = self.geometry.sector_erase_opcode();
        let Self { qspi, board, .. } = self;
        let result = flash::erase_sector(qspi, erase_opcode, addr, || board.pet_watchdog());
        self.send_flash_result(result, id);
    }

    fn handle_program_page(&mut self, id: u32) {
        let addr = read_le32(&self.params);
        let Self { qspi, board, params, .. } = self;
        let page = &params[4..4 + PAGE_SIZE];
        let result = flash::program_page(qspi, addr, page, || board.pet_watchdog());
        self.send_flash_result(result, id);
    }

    fn send_flash_result(&mut self, result: Result<()>, id: u32) {
        match result {
            Ok(()) => self.send_status(ResponseCode::Ok, id),
            Err(Error::FlashTimeout) => self.send_status(ResponseCode::FlashTimeout, id),
            Err(err) => {
                log::warn!("Flash operation failed: {}", err);
                self.send_status(ResponseCode::FlashTimeout, id);
            }
        }
    }

    fn handle_read_flash(&mut self, id: u32) {
        let mut addr = read_le32(&self.params[..4]);
        let mut remaining = read_le32(&self.params[4..8]);

        // The header commits to the full length; stream from there on
        self.send_header(ResponseCode::Ok, id, remaining);

        let mut crc = Crc32::new();
        let mut chunk = [0u8; READ_CHUNK];
        while remaining > 0 {
            let take = (remaining as usize).min(READ_CHUNK);
            if flash::read_into(&mut self.qspi, addr, &mut chunk[..take]).is_err() {
                // Length already promised; keep the frame aligned
                log::warn!("Flash read failed at 0x{:06X}", addr);
            }
            crc.update(&chunk[..take]);
            self.transport.write(&chunk[..take]);
            self.board.pet_watchdog();
            addr += take as u32;
            remaining -= take as u32;
        }
        self.transport.write(&crc.finalize().to_le_bytes());
    }

    fn handle_checksum(&mut self, id: u32) {
        let mut addr = read_le32(&self.params[..4]);
        let mut remaining = read_le32(&self.params[4..8]);

        let mut crc = Crc32::new();
        let mut chunk = [0u8; READ_CHUNK];
        let mut failed = false;
        while remaining > 0 {
            let take = (remaining as usize).min(READ_CHUNK);
            if flash::read_into(&mut self.qspi, addr, &mut chunk[..take]).is_err() {
                failed = true;
                break;
            }
            crc.update(&chunk[..take]);
            self.board.pet_watchdog();
            addr += take as u32;
            remaining -= take as u32;
        }

        if failed {
            self.send_status(ResponseCode::FlashTimeout, id);
        } else {
            let sum = crc.finalize();
            self.send_with_payload(ResponseCode::Checksum, id, &sum.to_le_bytes());
        }
    }

    /// Emit an unsolicited diagnostic frame on the broadcast id
    pub fn debug_message(&mut self, text: &str) {
        self.send_with_payload(ResponseCode::Debug, BROADCAST_ID, text.as_bytes());
    }

    fn send_status(&mut self, code: ResponseCode, id: u32) {
        self.send_header(code, id, 0);
    }

    fn send_header(&mut self, code: ResponseCode, id: u32, payload_len: u32) {
        let hdr = ResponseHeader::new(code, id, payload_len);
        self.transport.write(&hdr.encode());
    }

    fn send_with_payload(&mut self, code: ResponseCode, id: u32, payload: &[u8]) {
        self.send_header(code, id, payload.len() as u32);
        self.transport.write(payload);
        self.transport.write(&crc32::checksum(payload).to_le_bytes());
    }

    /// Drain the transmit path; LinkStalled if it never runs dry
    fn flush_link(&mut self) -> Result<()> {
        let mut budget = PollBudget::new(FLUSH_BUDGET);
        loop {
            if self.transport.flush_step() {
                return Ok(());
            }
            self.board.pet_watchdog();
            if !budget.tick() {
                return Err(Error::LinkStalled);
            }
        }
    }
}
