//! Read command implementation

use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::link::{Link, LinkError, READ_CHUNK_SIZE, READ_RETRIES};

/// Run the read command
pub fn run_read(
    link: &mut Link,
    output: &Path,
    offset: u32,
    length: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let length = match length {
        Some(len) => len,
        None => {
            let size = link.flash_info()?;
            if size == 0 {
                return Err("flash size unknown, specify a read length".into());
            }
            size.saturating_sub(offset)
        }
    };

    println!(
        "Reading {} bytes from 0x{:08X}-0x{:08X}",
        length,
        offset,
        offset + length
    );
    let data = read_flash_with_progress(link, offset, length)?;

    let mut file = File::create(output)?;
    file.write_all(&data)?;
    println!("Wrote {} bytes to {}", data.len(), output.display());
    Ok(())
}

/// Read a flash region in chunks, retrying failed chunks
pub fn read_flash_with_progress(
    link: &mut Link,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(length as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-"),
    );

    let mut data = Vec::with_capacity(length as usize);
    let mut addr = offset;
    let mut remaining = length;
    while remaining > 0 {
        let chunk_len = remaining.min(READ_CHUNK_SIZE);
        let chunk = read_chunk_with_retry(link, addr, chunk_len)?;
        data.extend_from_slice(&chunk);
        addr += chunk_len;
        remaining -= chunk_len;
        pb.set_position((length - remaining) as u64);
    }

    pb.finish_with_message("Read complete");
    Ok(data)
}

fn read_chunk_with_retry(
    link: &mut Link,
    addr: u32,
    len: u32,
) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut last_err: Option<LinkError> = None;
    for attempt in 1..=READ_RETRIES {
        match link.read_flash_chunk(addr, len) {
            Ok(chunk) => return Ok(chunk),
            Err(err) => {
                log::warn!(
                    "Failed to read chunk at 0x{:08X} (try {}/{}): {}",
                    addr,
                    attempt,
                    READ_RETRIES,
                    err
                );
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => Box::new(err),
        None => "read failed".into(),
    })
}
