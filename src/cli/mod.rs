//! CLI subcommand implementations for the bazaar binary.

pub mod collect_cmd;
pub mod doctor;
