//! Distlock CLI - configuration, logging and the contention demo behind the
//! `distlock` binary

pub mod config;
pub mod demo;
pub mod logging;

pub use config::{Cli, Command, Configuration, ContendArgs, DemoSettings};
pub use demo::{ContendReport, GrantRecord, run_contend};
pub use logging::{LoggingConfig, LoggingGuard, init_logging};
