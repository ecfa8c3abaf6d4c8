//! # Airflow Core
//!
//! Shared crate for the mass-flow controller telemetry sender: data model,
//! reply parsing, JSON wire format and TOML configuration.
//!
//! ## Modules
//! - [`types`] – Endpoint, raw reply, measurement and sample types
//! - [`parser`] – Fixed-field parsing of controller replies
//! - [`protocol`] – Serial query framing and JSON sample codec
//! - [`config`] – Unified TOML configuration

pub mod types;
pub mod parser;
pub mod protocol;
pub mod config;

// Convenient re-exports
pub use types::{DeviceEndpoint, Framing, Measurement, RawReply, Sample};
pub use parser::{parse, parse_measurement, NumberPolicy, ParseError};
pub use protocol::{decode_sample, encode_sample, ProtocolError, TERMINATOR};
pub use config::{AppConfig, SessionMode, Transport};
