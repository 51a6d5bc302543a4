//! CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Parse a string as a hex or decimal u32
pub fn parse_hex_u32(s: &str) -> Result<u32, String> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("Invalid hex value: {}", e))
    } else {
        s.parse::<u32>().map_err(|e| format!("Invalid number: {}", e))
    }
}

#[derive(Parser)]
#[command(name = "qspiboot")]
#[command(author, version, about = "UART bootloader flash tool", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Serial port device
    #[arg(short, long, default_value = "/dev/ttyUSB0", global = true)]
    pub port: String,

    /// Baud rate to switch to after synchronizing
    #[arg(short, long, default_value_t = 230_400, global = true)]
    pub baudrate: u32,

    /// Baud rate the bootloader comes up at
    #[arg(long, default_value_t = 9_600, global = true)]
    pub initial_baudrate: u32,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the bootloader answers
    Ping,

    /// Read the chip identification registers
    ChipId,

    /// Show the flash geometry discovered by the bootloader
    Info,

    /// Read flash contents to a file
    Read {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Flash offset to start reading at
        #[arg(value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Number of bytes to read (defaults to the whole flash)
        #[arg(value_parser = parse_hex_u32)]
        length: Option<u32>,
    },

    /// Write a file to flash (erase, program, verify)
    Write {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Flash offset to write at (4 KiB aligned)
        #[arg(value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Number of bytes to write (defaults to the file size)
        #[arg(value_parser = parse_hex_u32)]
        length: Option<u32>,

        /// Skip the checksum verification pass
        #[arg(long)]
        no_verify: bool,
    },

    /// Erase a range of flash sectors
    Erase {
        /// Flash offset to erase at (4 KiB aligned)
        #[arg(value_parser = parse_hex_u32)]
        offset: u32,

        /// Number of bytes to erase (4 KiB aligned)
        #[arg(value_parser = parse_hex_u32, default_value = "0x1000")]
        length: u32,
    },

    /// CRC-32 a flash region on the device
    Checksum {
        /// Flash offset
        #[arg(value_parser = parse_hex_u32, default_value = "0")]
        offset: u32,

        /// Number of bytes to checksum (defaults to the whole flash)
        #[arg(value_parser = parse_hex_u32)]
        length: Option<u32>,
    },

    /// Switch the device to a different baud rate
    Baud {
        /// Target baud rate
        rate: u32,
    },

    /// Reset the device
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_and_decimal_addresses() {
        assert_eq!(parse_hex_u32("0x1000"), Ok(0x1000));
        assert_eq!(parse_hex_u32("0X20"), Ok(0x20));
        assert_eq!(parse_hex_u32("4096"), Ok(4096));
        assert!(parse_hex_u32("0xZZ").is_err());
        assert!(parse_hex_u32("twelve").is_err());
    }

    #[test]
    fn cli_parses_read_command() {
        let cli = Cli::try_parse_from([
            "qspiboot", "-p", "/dev/ttyUSB1", "read", "-o", "dump.bin", "0x1000", "0x2000",
        ])
        .unwrap();
        assert_eq!(cli.port, "/dev/ttyUSB1");
        match cli.command {
            Commands::Read {
                output,
                offset,
                length,
            } => {
                assert_eq!(output.to_str(), Some("dump.bin"));
                assert_eq!(offset, 0x1000);
                assert_eq!(length, Some(0x2000));
            }
            _ => panic!("wrong subcommand"),
        }
    }
}
