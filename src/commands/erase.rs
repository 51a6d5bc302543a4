//! Erase command implementation

use crate::commands::write::SECTOR_SIZE;
use crate::link::Link;

/// Run the erase command
pub fn run_erase(
    link: &mut Link,
    offset: u32,
    length: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    if offset % SECTOR_SIZE != 0 || length % SECTOR_SIZE != 0 {
        return Err(format!(
            "unaligned erase: offset and length must be multiples of {} bytes",
            SECTOR_SIZE
        )
        .into());
    }

    let mut addr = offset;
    while addr < offset + length {
        log::info!("Erasing sector at 0x{:08X}", addr);
        link.erase_sector(addr)?;
        addr += SECTOR_SIZE;
    }
    println!(
        "Erased {} bytes at 0x{:08X}-0x{:08X}",
        length,
        offset,
        offset + length
    );
    Ok(())
}
