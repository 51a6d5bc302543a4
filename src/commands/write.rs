//! Write command implementation
//!
//! Whole-sector writes only: erase each 4 KiB sector in the target
//! range, program it back in 256-byte pages, then have the device
//! checksum the range and compare against the local CRC.

use indicatif::{ProgressBar, ProgressStyle};
use qspiboot_core::crc32;
use qspiboot_core::wire::PAGE_SIZE;
use std::path::Path;

use crate::link::Link;

/// Sector granularity for erase operations
pub const SECTOR_SIZE: u32 = 4096;

/// Run the write command
pub fn run_write(
    link: &mut Link,
    input: &Path,
    offset: u32,
    length: Option<u32>,
    verify: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(input)?;
    let length = length.unwrap_or(data.len() as u32);

    if offset % SECTOR_SIZE != 0 || (offset + length) % SECTOR_SIZE != 0 {
        return Err(format!(
            "unaligned write: offset and offset+length must be multiples of {} bytes",
            SECTOR_SIZE
        )
        .into());
    }
    if (data.len() as u32) < length {
        return Err(format!(
            "input file is {} bytes, shorter than the requested {} byte write",
            data.len(),
            length
        )
        .into());
    }
    let data = &data[..length as usize];

    println!(
        "Writing {} bytes to 0x{:08X}-0x{:08X}",
        length,
        offset,
        offset + length
    );

    erase_range(link, offset, length)?;
    program_range(link, offset, data)?;

    if verify {
        let local = crc32::checksum(data);
        let remote = link.checksum(offset, length)?;
        if local != remote {
            return Err(format!(
                "verification failed: device CRC 0x{:08X}, local CRC 0x{:08X}",
                remote, local
            )
            .into());
        }
        println!("Verified, CRC-32 0x{:08X}", local);
    }

    Ok(())
}

fn progress_bar(total: u64) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

fn erase_range(
    link: &mut Link,
    offset: u32,
    length: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let pb = progress_bar(length as u64)?;
    let mut addr = offset;
    while addr < offset + length {
        link.erase_sector(addr)?;
        addr += SECTOR_SIZE;
        pb.set_position((addr - offset) as u64);
    }
    pb.finish_with_message("Erase complete");
    Ok(())
}

fn program_range(
    link: &mut Link,
    offset: u32,
    data: &[u8],
) -> Result<(), Box<dyn std::error::Error>> {
    let pb = progress_bar(data.len() as u64)?;
    for (i, page) in data.chunks(PAGE_SIZE).enumerate() {
        let addr = offset + (i * PAGE_SIZE) as u32;
        if page.len() == PAGE_SIZE {
            link.program_page(addr, page)?;
        } else {
            // Tail shorter than a page: pad with the erased value
            let mut padded = [0xFFu8; PAGE_SIZE];
            padded[..page.len()].copy_from_slice(page);
            link.program_page(addr, &padded)?;
        }
        pb.set_position((i * PAGE_SIZE + page.len()) as u64);
    }
    pb.finish_with_message("Program complete");
    Ok(())
}
