//! Subcommand implementations

pub mod erase;
pub mod probe;
pub mod read;
pub mod write;
