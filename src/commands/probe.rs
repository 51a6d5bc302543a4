//! Identification commands: ping, chip-id, info, checksum

use crate::link::Link;

/// Run the ping command
pub fn run_ping(link: &mut Link) -> Result<(), Box<dyn std::error::Error>> {
    link.ping()?;
    println!("Bootloader is responding");
    Ok(())
}

/// Run the chip-id command
pub fn run_chip_id(link: &mut Link) -> Result<(), Box<dyn std::error::Error>> {
    let id = link.chip_id()?;
    let name: String = id[..3]
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
        .collect();
    // Revision nibbles encode letters, e.g. 0x00 -> "AxA"
    let major = (b'A' + (id[4] >> 4)) as char;
    let minor = (b'A' + (id[4] & 0x0F)) as char;
    println!(
        "Chip id: '{}' (0x{:02X}{:02X}{:02X}), mem size 0x{:02X}, revision {}x{} (0x{:02X})",
        name, id[0], id[1], id[2], id[3], major, minor, id[4]
    );
    Ok(())
}

/// Run the info command
pub fn run_info(link: &mut Link) -> Result<(), Box<dyn std::error::Error>> {
    let size = link.flash_info()?;
    if size == 0 {
        println!("Flash size unknown (no SFDP data)");
    } else {
        println!("Flash size: {} bytes ({} KiB)", size, size / 1024);
    }
    Ok(())
}

/// Run the checksum command
pub fn run_checksum(
    link: &mut Link,
    offset: u32,
    length: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let length = match length {
        Some(len) => len,
        None => link.flash_info()?,
    };
    let crc = link.checksum(offset, length)?;
    println!(
        "CRC-32 of 0x{:08X}-0x{:08X}: 0x{:08X}",
        offset,
        offset + length,
        crc
    );
    Ok(())
}
