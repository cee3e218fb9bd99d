//! # hsmwire-client
//!
//! Async client for HSMs speaking the hsmwire protocol.
//!
//! This crate provides:
//! - A multiplexed connection correlating replies by trace number
//! - Deadline-bounded requests via a shared [`DeadlineCoordinator`](hsmwire_deadline::DeadlineCoordinator)
//! - Typed helpers for common commands
//! - Layered configuration (defaults, YAML file, environment)

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod stream;

pub use client::{Client, DiagnosticsResult, GenerateKey, GenerateKeyResult};
pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
