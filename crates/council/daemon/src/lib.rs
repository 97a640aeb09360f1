//! councild
//!
//! Command-line front end for the council runtime: run a workflow against
//! a scripted provider, list the configured roles, replay a persisted
//! audit trail, and verify its hash chain.
//!
//! # Architecture
//!
//! - [`config`] — Layered configuration (defaults, file, `COUNCIL_*` env)
//! - [`commands`] — The operations behind each subcommand
//! - [`error`] — Daemon error type

#![deny(unsafe_code)]

pub mod commands;
pub mod config;
pub mod error;

pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
