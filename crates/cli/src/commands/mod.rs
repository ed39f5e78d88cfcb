// CLI subcommands

pub mod config;
pub mod dlq;
pub mod jobs;
pub mod worker;
