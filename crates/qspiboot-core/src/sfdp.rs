//! SFDP-based flash geometry discovery
//!
//! Runs once at boot: read the 8-byte SFDP header, walk the parameter
//! headers, and pull capacity plus erase geometry out of the basic
//! flash parameter table (table id 0). A flash without SFDP support
//! (parameter header count reading back as all-ones) skips discovery
//! and leaves the geometry empty instead of walking 256 ghost tables.

use crate::error::Result;
use crate::qspi::{opcodes, IoMode, QspiBus};

/// SFDP reads clock one dummy cycle between address and data
const SFDP_DUMMY_CYCLES: usize = 1;

/// Largest parameter table the discovery will fetch
const MAX_PARAMETER_TABLE: usize = 64;

/// One erase sector type advertised by the flash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorType {
    /// Sector size as a power-of-two exponent; 0xFF means unused
    pub size_exponent: u8,
    /// Erase opcode for this sector size
    pub erase_opcode: u8,
}

impl SectorType {
    const UNUSED: Self = Self {
        size_exponent: 0xFF,
        erase_opcode: 0xFF,
    };

    /// True if the flash actually advertises this sector type
    pub fn is_valid(&self) -> bool {
        self.size_exponent != 0xFF
    }
}

/// Flash capacity and erase geometry, populated once at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    /// Total device size in bytes
    pub size_bytes: u32,
    /// Dedicated 4KiB erase opcode from the parameter table
    pub erase_opcode_4kib: u8,
    /// Up to four erase sector types
    pub sector_types: [SectorType; 4],
}

impl FlashGeometry {
    /// Empty geometry for a flash without SFDP
    pub const fn unknown() -> Self {
        Self {
            size_bytes: 0,
            erase_opcode_4kib: 0xFF,
            sector_types: [SectorType::UNUSED; 4],
        }
    }

    /// Opcode the EraseSector command should issue
    ///
    /// Prefers the discovered 4KiB opcode, falling back to the JEDEC
    /// common 0x20 when the table didn't provide one.
    pub fn sector_erase_opcode(&self) -> u8 {
        if self.erase_opcode_4kib != 0xFF && self.erase_opcode_4kib != 0x00 {
            self.erase_opcode_4kib
        } else {
            opcodes::SE
        }
    }
}

fn read_sfdp<Q: QspiBus + ?Sized>(bus: &mut Q, addr: u32, buf: &mut [u8]) -> Result<()> {
    let cmd = [
        opcodes::RDSFDP,
        (addr >> 16) as u8,
        (addr >> 8) as u8,
        addr as u8,
    ];
    bus.write_then_read(IoMode::Single, &cmd, SFDP_DUMMY_CYCLES, buf)
}

fn parse_basic_table(table: &[u8], geometry: &mut FlashGeometry) {
    if table.len() < 8 {
        log::debug!("Basic parameter table too short ({} bytes)", table.len());
        return;
    }

    geometry.erase_opcode_4kib = table[2];
    log::debug!("4KiB erase opcode 0x{:02X}", geometry.erase_opcode_4kib);

    let raw_density = u32::from_le_bytes([table[4], table[5], table[6], table[7]]);
    log::debug!("Raw flash density 0x{:08X}", raw_density);
    if raw_density & (1 << 31) != 0 {
        // 2^N bits format
        let n = raw_density & 0x7FFF_FFFF;
        if (3..35).contains(&n) {
            geometry.size_bytes = 1u32 << (n - 3);
        }
    } else {
        // Direct bit count, minus one
        geometry.size_bytes = (raw_density / 8) + u32::from(raw_density % 8 == 7);
    }

    // Erase type descriptors, dwords 8-9
    if table.len() >= 36 {
        for (i, sector) in geometry.sector_types.iter_mut().enumerate() {
            let off = 28 + 2 * i;
            *sector = SectorType {
                size_exponent: table[off],
                erase_opcode: table[off + 1],
            };
            if sector.is_valid() {
                log::debug!(
                    "Sector size 2^{} erase opcode 0x{:02X}",
                    sector.size_exponent,
                    sector.erase_opcode
                );
            }
        }
    }
}

fn read_parameter_table<Q: QspiBus + ?Sized>(
    bus: &mut Q,
    param_header: &[u8; 8],
    geometry: &mut FlashGeometry,
) -> Result<()> {
    let table_len = param_header[3] as usize * 4;
    if table_len > MAX_PARAMETER_TABLE {
        log::debug!("Parameter table > {} bytes, skipping", MAX_PARAMETER_TABLE);
        return Ok(());
    }

    let table_addr = u32::from_le_bytes([param_header[4], param_header[5], param_header[6], 0]);
    let mut table = [0u8; MAX_PARAMETER_TABLE];
    read_sfdp(bus, table_addr, &mut table[..table_len])?;

    let table_id = param_header[0];
    log::debug!("Parameter table id 0x{:02X} @0x{:06X}", table_id, table_addr);

    if table_id == 0x00 {
        parse_basic_table(&table[..table_len], geometry);
    }
    Ok(())
}

/// Probe the flash for SFDP data and extract its geometry
///
/// Returns [`FlashGeometry::unknown`] when the flash does not answer
/// SFDP reads (header count all-ones).
pub fn probe<Q: QspiBus + ?Sized>(bus: &mut Q) -> Result<FlashGeometry> {
    let mut geometry = FlashGeometry::unknown();

    let mut sfdp_header = [0u8; 8];
    read_sfdp(bus, 0, &mut sfdp_header)?;

    let num_param_headers = sfdp_header[6] as usize + 1;
    log::debug!("Found {} parameter headers", num_param_headers);
    if num_param_headers == 0x100 {
        log::info!("Flash does not support SFDP, skipping auto detection");
        return Ok(geometry);
    }

    for hdr_idx in 0..num_param_headers {
        let addr = (sfdp_header.len() + 8 * hdr_idx) as u32;
        let mut param_header = [0u8; 8];
        read_sfdp(bus, addr, &mut param_header)?;
        read_parameter_table(bus, &param_header, &mut geometry)?;
    }

    Ok(geometry)
}
