//! Ring-buffered serial transport
//!
//! Decouples the framing engine from UART timing. On hardware the
//! receive side of the ring is filled by a circular DMA burst and the
//! transmit side drained by another; here both become the producer half
//! of [`RingBuffer`], pumped from [`Transport::poll`] once per main-loop
//! iteration, so the engine remains the sole consumer of RX metadata
//! and sole producer of TX metadata and no locking is needed.
//!
//! The ring never hands out raw pointers into its storage: block reads
//! are wrap-aware copies, and a producer write that would lap the
//! consumer sets a sticky overrun flag instead of silently corrupting a
//! partially received frame. The engine answers the flag with a
//! resynchronizing restart.

/// Capacity of the receive ring
///
/// Must exceed the largest single frame (ProgramPage: 13-byte header +
/// 260 parameter bytes + 4-byte CRC) so a complete command always fits.
pub const RX_RING_CAPACITY: usize = 1024;

/// Capacity of the transmit ring
pub const TX_RING_CAPACITY: usize = 1024;

/// Fixed-capacity circular byte buffer
///
/// One producer cursor, one consumer cursor, and an explicit length so
/// cursor equality never has to disambiguate full from empty.
pub struct RingBuffer<const N: usize> {
    buf: [u8; N],
    read: usize,
    write: usize,
    len: usize,
    overrun: bool,
}

impl<const N: usize> RingBuffer<N> {
    /// Create an empty ring
    pub fn new() -> Self {
        Self {
            buf: [0; N],
            read: 0,
            write: 0,
            len: 0,
            overrun: false,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        N
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space remaining
    pub fn free(&self) -> usize {
        N - self.len
    }

    /// True once a producer write has lapped the consumer
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    /// Producer half: append as much of `data` as fits
    ///
    /// Returns the number of bytes accepted. A short write marks the
    /// ring as overrun; the dropped bytes are unrecoverable and the
    /// consumer must resynchronize.
    pub fn push_slice(&mut self, data: &[u8]) -> usize {
        let accepted = data.len().min(self.free());
        if accepted < data.len() {
            self.overrun = true;
        }
        for &byt in &data[..accepted] {
            self.buf[self.write] = byt;
            self.write = (self.write + 1) % N;
        }
        self.len += accepted;
        accepted
    }

    /// Consumer half: take one byte
    pub fn pop(&mut self) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let byt = self.buf[self.read];
        self.read = (self.read + 1) % N;
        self.len -= 1;
        Some(byt)
    }

    /// Consumer half: wrap-aware copy of `out.len()` bytes
    ///
    /// Returns false (and consumes nothing) if fewer bytes are buffered.
    pub fn copy_to(&mut self, out: &mut [u8]) -> bool {
        if out.len() > self.len {
            return false;
        }
        for slot in out.iter_mut() {
            *slot = self.buf[self.read];
            self.read = (self.read + 1) % N;
        }
        self.len -= out.len();
        true
    }

    /// Consumer half: discard `n` buffered bytes
    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.len);
        self.read = (self.read + n) % N;
        self.len -= n;
    }

    /// Longest contiguous buffered run starting at the consumer cursor
    ///
    /// Used to hand the transmit DMA (or its stand-in) a slice it can
    /// send without copying; `skip` consumes what was actually taken.
    pub fn contiguous(&self) -> &[u8] {
        let run = self.len.min(N - self.read);
        &self.buf[self.read..self.read + run]
    }

    /// Drop everything and re-arm at offset zero
    pub fn restart(&mut self) {
        self.read = 0;
        self.write = 0;
        self.len = 0;
        self.overrun = false;
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// UART hardware seam
///
/// Both methods are non-blocking: they move whatever the hardware can
/// take right now and return the count. The cooperative main loop calls
/// them through [`Transport::poll`] in place of the RX/TX interrupts.
pub trait UartBus {
    /// Pull received bytes into `buf`, returning how many were available
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Push bytes towards the line, returning how many were accepted
    fn write(&mut self, data: &[u8]) -> usize;

    /// True once every accepted byte has left the shift register
    fn tx_idle(&self) -> bool;

    /// True if the divisor can produce `baud` exactly
    fn baudrate_supported(&self, baud: u32) -> bool;

    /// Switch the divisor; false if `baud` is unattainable
    fn set_baudrate(&mut self, baud: u32) -> bool;
}

/// Ring-buffered transport over a [`UartBus`]
pub struct Transport<U: UartBus> {
    uart: U,
    rx: RingBuffer<RX_RING_CAPACITY>,
    tx: RingBuffer<TX_RING_CAPACITY>,
}

impl<U: UartBus> Transport<U> {
    /// Wrap a UART in fresh rings
    pub fn new(uart: U) -> Self {
        Self {
            uart,
            rx: RingBuffer::new(),
            tx: RingBuffer::new(),
        }
    }

    /// Move bytes UART -> RX ring and TX ring -> UART
    ///
    /// Called once per main-loop iteration; stands in for the RX/TX
    /// DMA interrupts on hardware.
    pub fn poll(&mut self) {
        let mut chunk = [0u8; 64];
        loop {
            let n = self.uart.read(&mut chunk);
            if n == 0 {
                break;
            }
            self.rx.push_slice(&chunk[..n]);
        }
        self.pump_tx();
    }

    fn pump_tx(&mut self) {
        while !self.tx.is_empty() {
            let taken = self.uart.write(self.tx.contiguous());
            if taken == 0 {
                break;
            }
            self.tx.skip(taken);
        }
    }

    /// Bytes buffered and ready for the framing engine
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// True once the receive stream has lapped the engine
    pub fn overrun(&self) -> bool {
        self.rx.overrun()
    }

    /// Take a single received byte
    pub fn read_byte(&mut self) -> Option<u8> {
        self.rx.pop()
    }

    /// Wrap-aware block read; false if not enough bytes are buffered
    pub fn copy_to(&mut self, out: &mut [u8]) -> bool {
        self.rx.copy_to(out)
    }

    /// Drop all buffered RX bytes and re-arm the receive stream
    ///
    /// Invoked after every completed command cycle and after every
    /// fault, so host and device re-agree on frame boundaries.
    pub fn restart(&mut self) {
        self.rx.restart();
    }

    /// Append response bytes to the transmit ring (buffer-and-forget)
    ///
    /// If the ring fills, the transport drains it through the UART
    /// inline rather than dropping response bytes.
    pub fn write(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let pushed = self.tx.push_slice(data);
            data = &data[pushed..];
            if !data.is_empty() {
                self.pump_tx();
            }
        }
    }

    /// One flush step: pump the TX ring, report whether the line is dry
    ///
    /// The caller loops (petting the watchdog) until this returns true;
    /// required before a baud-rate change or reset so the response
    /// leaves at the old rate.
    pub fn flush_step(&mut self) -> bool {
        self.pump_tx();
        self.tx.is_empty() && self.uart.tx_idle()
    }

    /// True if the UART divisor can produce `baud`
    pub fn baudrate_supported(&self, baud: u32) -> bool {
        self.uart.baudrate_supported(baud)
    }

    /// Switch the UART divisor
    pub fn set_baudrate(&mut self, baud: u32) -> bool {
        self.uart.set_baudrate(baud)
    }
}
