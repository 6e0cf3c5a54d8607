//! Subcommand handlers.

pub mod apply;
pub mod config_cmd;
pub mod resources;
