//! CLI module for prism - command-line interface and subcommands.
//!
//! Provides the main entry point with the heartbeat subcommands and the
//! worker invocation spawned by the execute heartbeat.

pub mod commands;

pub use commands::Cli;
