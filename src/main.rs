//! qspiboot - Host tool for the qspiboot UART bootloader
//!
//! Talks the framed command protocol from `qspiboot-core::wire` over a
//! serial port to a device running the bootloader: identify the chip,
//! query the discovered flash geometry, and read, erase, write and
//! verify the external QSPI NOR flash.

mod cli;
mod commands;
mod link;

use clap::Parser;
use cli::{Cli, Commands};
use link::Link;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    let mut link = Link::open(&cli.port, cli.initial_baudrate)?;
    link.sync()?;

    if cli.baudrate != cli.initial_baudrate {
        log::info!(
            "Changing baud rate {} -> {}",
            cli.initial_baudrate,
            cli.baudrate
        );
        link.set_baudrate(cli.baudrate)?;
        link.sync()?;
    }

    match cli.command {
        Commands::Ping => commands::probe::run_ping(&mut link),
        Commands::ChipId => commands::probe::run_chip_id(&mut link),
        Commands::Info => commands::probe::run_info(&mut link),
        Commands::Read {
            output,
            offset,
            length,
        } => commands::read::run_read(&mut link, &output, offset, length),
        Commands::Write {
            input,
            offset,
            length,
            no_verify,
        } => commands::write::run_write(&mut link, &input, offset, length, !no_verify),
        Commands::Erase { offset, length } => commands::erase::run_erase(&mut link, offset, length),
        Commands::Checksum { offset, length } => {
            commands::probe::run_checksum(&mut link, offset, length)
        }
        Commands::Baud { rate } => {
            link.set_baudrate(rate)?;
            link.sync()?;
            println!("Link now running at {} baud", link.baud());
            Ok(())
        }
        Commands::Reset => {
            link.reset()?;
            println!("Device reset");
            Ok(())
        }
    }
}
