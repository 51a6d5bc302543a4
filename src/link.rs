//! Serial link to the bootloader
//!
//! Implements the host side of the framed command protocol: send a
//! marker-prefixed command header (plus parameters and their CRC), then
//! scan the receive stream for response frames. Debug frames from the
//! device are surfaced to the log, responses are matched to commands by
//! transaction id, and read timeouts scale with the payload size and
//! the current baud rate.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use qspiboot_core::crc32;
use qspiboot_core::wire::{
    CommandHeader, Opcode, ResponseCode, ResponseHeader, BROADCAST_ID, CRC_LEN, FRAME_MARKER,
    PAGE_SIZE, RESPONSE_HEADER_LEN,
};
use serialport::SerialPort;
use thiserror::Error;

/// Chunk size for host-driven flash reads
pub const READ_CHUNK_SIZE: u32 = 4096;

/// Retries per read chunk before giving up
pub const READ_RETRIES: u32 = 5;

/// Base response timeout on top of any size-scaled component
const BASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors talking to the bootloader
#[derive(Debug, Error)]
pub enum LinkError {
    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// I/O error during communication
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device never answered a ping
    #[error("failed to synchronize with the bootloader")]
    SyncFailed,

    /// No matching response before the deadline
    #[error("no response to transaction {0}")]
    Timeout(u32),

    /// Response header CRC mismatch
    #[error("response header failed CRC check")]
    HeaderCrc,

    /// Response payload CRC mismatch
    #[error("response payload failed CRC check")]
    PayloadCrc,

    /// The device answered with an error code
    #[error("device rejected command: {0:?}")]
    Rejected(ResponseCode),

    /// A response code this tool does not know
    #[error("unexpected response code 0x{0:02X}")]
    UnexpectedResponse(u8),

    /// Payload shorter or longer than the operation requires
    #[error("expected {want} payload bytes, got {got}")]
    PayloadSize { want: usize, got: usize },
}

/// Result alias for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// One decoded response frame
#[derive(Debug)]
pub struct Frame {
    /// Raw response code byte
    pub code: u8,
    /// Transaction id echoed by the device
    pub id: u32,
    /// Payload, CRC already verified and stripped
    pub payload: Vec<u8>,
}

impl Frame {
    fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::from_u8(self.code)
    }
}

/// Serial connection to a running bootloader
pub struct Link {
    port: Box<dyn SerialPort>,
    baud: u32,
    next_id: u32,
}

impl Link {
    /// Open a serial port at the given baud rate (8N1, no flow control)
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(BASE_TIMEOUT)
            .open()?;
        log::info!("Opened serial port {} at {} baud", device, baud);
        Ok(Self {
            port,
            baud,
            next_id: 0,
        })
    }

    /// The baud rate the link currently runs at
    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Seconds it takes to move `bytes` over the wire, with margin
    fn wire_time(&self, bytes: usize) -> Duration {
        // 10 bits per byte at 8N1, doubled for margin
        Duration::from_secs_f64(2.0 * bytes as f64 / (self.baud as f64 / 10.0))
    }

    fn send_command(&mut self, opcode: Opcode, params: &[u8]) -> Result<u32> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let header = CommandHeader::new(opcode, id, params.len() as u32);
        let mut data = vec![FRAME_MARKER];
        data.extend_from_slice(&header.encode());
        if !params.is_empty() {
            data.extend_from_slice(params);
            data.extend_from_slice(&crc32::checksum(params).to_le_bytes());
        }
        log::debug!("Dispatching {:?} id {} ({} param bytes)", opcode, id, params.len());
        self.port.write_all(&data)?;
        Ok(id)
    }

    /// Read one frame from the stream; None on timeout or line noise
    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let mut sync = [0u8; 1];
        match self.port.read(&mut sync) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        if sync[0] != FRAME_MARKER {
            log::trace!("Skipping non-marker byte 0x{:02X}", sync[0]);
            return Ok(None);
        }

        let mut raw = [0u8; RESPONSE_HEADER_LEN];
        raw[0] = FRAME_MARKER;
        self.port.read_exact(&mut raw[1..])?;
        let header = ResponseHeader::decode(&raw);
        if !header.crc_valid() {
            return Err(LinkError::HeaderCrc);
        }

        let mut payload = Vec::new();
        if header.payload_len > 0 {
            let total = header.payload_len as usize + CRC_LEN;
            let old_timeout = self.port.timeout();
            self.port.set_timeout(BASE_TIMEOUT + self.wire_time(total))?;
            payload.resize(total, 0);
            let result = self.port.read_exact(&mut payload);
            self.port.set_timeout(old_timeout)?;
            result?;

            let mut crc_raw = [0u8; CRC_LEN];
            crc_raw.copy_from_slice(&payload[payload.len() - CRC_LEN..]);
            payload.truncate(header.payload_len as usize);
            if crc32::checksum(&payload) != u32::from_le_bytes(crc_raw) {
                return Err(LinkError::PayloadCrc);
            }
        }

        Ok(Some(Frame {
            code: header.code,
            id: header.transaction_id,
            payload,
        }))
    }

    /// Wait for the response to `id`, logging unsolicited frames
    fn await_response(&mut self, id: u32, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.receive_frame() {
                Ok(Some(frame)) => {
                    match frame.response_code() {
                        Some(ResponseCode::Debug) => {
                            let text = String::from_utf8_lossy(&frame.payload);
                            log::info!("device: {}", text.trim_end());
                            continue;
                        }
                        Some(ResponseCode::Online) if frame.id == BROADCAST_ID => {
                            log::debug!("Bootloader announced itself");
                            continue;
                        }
                        _ => {}
                    }
                    if frame.id == id {
                        return Ok(frame);
                    }
                    log::warn!(
                        "Dropping stale response to id {} (code 0x{:02X})",
                        frame.id,
                        frame.code
                    );
                }
                Ok(None) => {}
                // Corrupt frames leave the stream in an unknown state;
                // keep scanning for the next marker until the deadline
                Err(err @ (LinkError::HeaderCrc | LinkError::PayloadCrc)) => {
                    log::warn!("{}", err);
                }
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout(id));
            }
        }
    }

    fn transact(&mut self, opcode: Opcode, params: &[u8], extra: Duration) -> Result<Frame> {
        let id = self.send_command(opcode, params)?;
        self.await_response(id, BASE_TIMEOUT + extra)
    }

    /// Check the frame answers with `want`; map error codes to errors
    fn expect(frame: Frame, want: ResponseCode) -> Result<Frame> {
        match frame.response_code() {
            Some(code) if code == want => Ok(frame),
            Some(
                code @ (ResponseCode::InvalidCrc
                | ResponseCode::CmdInvalid
                | ResponseCode::ParamTooShort
                | ResponseCode::InvalidParam
                | ResponseCode::FlashTimeout),
            ) => Err(LinkError::Rejected(code)),
            _ => Err(LinkError::UnexpectedResponse(frame.code)),
        }
    }

    fn expect_payload(frame: Frame, want: ResponseCode, len: usize) -> Result<Vec<u8>> {
        let frame = Self::expect(frame, want)?;
        if frame.payload.len() != len {
            return Err(LinkError::PayloadSize {
                want: len,
                got: frame.payload.len(),
            });
        }
        Ok(frame.payload)
    }

    /// Ping until the device answers, draining boot-time frames
    pub fn sync(&mut self) -> Result<()> {
        for attempt in 1..=3 {
            match self.ping() {
                Ok(()) => {
                    log::debug!("Synchronized in {} attempts", attempt);
                    return Ok(());
                }
                Err(LinkError::Timeout(_)) | Err(LinkError::Rejected(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(LinkError::SyncFailed)
    }

    /// Liveness probe
    pub fn ping(&mut self) -> Result<()> {
        let frame = self.transact(Opcode::Ping, &[], Duration::ZERO)?;
        Self::expect(frame, ResponseCode::Ok).map(|_| ())
    }

    /// Chip identification registers: id1, id2, id3, mem_size, revision
    pub fn chip_id(&mut self) -> Result<[u8; 5]> {
        let frame = self.transact(Opcode::ChipId, &[], Duration::ZERO)?;
        let payload = Self::expect_payload(frame, ResponseCode::ChipId, 5)?;
        let mut id = [0u8; 5];
        id.copy_from_slice(&payload);
        Ok(id)
    }

    /// Flash size in bytes as discovered by the bootloader
    pub fn flash_info(&mut self) -> Result<u32> {
        let frame = self.transact(Opcode::FlashInfo, &[], Duration::ZERO)?;
        let payload = Self::expect_payload(frame, ResponseCode::FlashInfo, 4)?;
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Read one chunk of flash
    pub fn read_flash_chunk(&mut self, addr: u32, len: u32) -> Result<Vec<u8>> {
        let mut params = [0u8; 8];
        params[..4].copy_from_slice(&addr.to_le_bytes());
        params[4..].copy_from_slice(&len.to_le_bytes());
        let extra = self.wire_time(len as usize);
        let frame = self.transact(Opcode::ReadFlash, &params, extra)?;
        Self::expect_payload(frame, ResponseCode::Ok, len as usize)
    }

    /// CRC-32 of a flash region, computed on the device
    pub fn checksum(&mut self, addr: u32, len: u32) -> Result<u32> {
        let mut params = [0u8; 8];
        params[..4].copy_from_slice(&addr.to_le_bytes());
        params[4..].copy_from_slice(&len.to_le_bytes());
        // The device reads the whole region before answering
        let extra = Duration::from_secs_f64(len as f64 * 8.0 / 100_000.0);
        let frame = self.transact(Opcode::Checksum, &params, extra)?;
        let payload = Self::expect_payload(frame, ResponseCode::Checksum, 4)?;
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Erase the sector containing `addr`
    pub fn erase_sector(&mut self, addr: u32) -> Result<()> {
        let frame = self.transact(
            Opcode::EraseSector,
            &addr.to_le_bytes(),
            Duration::from_millis(500),
        )?;
        Self::expect(frame, ResponseCode::Ok).map(|_| ())
    }

    /// Program one 256-byte page at `addr`
    pub fn program_page(&mut self, addr: u32, page: &[u8]) -> Result<()> {
        assert_eq!(page.len(), PAGE_SIZE);
        let mut params = Vec::with_capacity(4 + PAGE_SIZE);
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(page);
        let extra = self.wire_time(params.len()) + Duration::from_millis(3);
        let frame = self.transact(Opcode::ProgramPage, &params, extra)?;
        Self::expect(frame, ResponseCode::Ok).map(|_| ())
    }

    /// Switch the link to a new baud rate
    ///
    /// The device acknowledges at the old rate before switching, so the
    /// local port is only reconfigured after the Ok arrives.
    pub fn set_baudrate(&mut self, baud: u32) -> Result<()> {
        let frame = self.transact(Opcode::SetBaudrate, &baud.to_le_bytes(), Duration::ZERO)?;
        Self::expect(frame, ResponseCode::Ok)?;
        self.port.set_baud_rate(baud)?;
        self.baud = baud;
        log::info!("Switched link to {} baud", baud);
        Ok(())
    }

    /// Ask the device to reset itself
    pub fn reset(&mut self) -> Result<()> {
        let frame = self.transact(Opcode::Reset, &[], Duration::ZERO)?;
        Self::expect(frame, ResponseCode::Ok).map(|_| ())
    }
}
