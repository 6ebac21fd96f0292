#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jkbms_lib
//!
//! This crate provides a library for polling JK BMS (Battery Management System) devices
//! with the vendor "read all" request over a point-to-point serial link.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `jkbms` command-line tool.
//!
//! ### Client Features
//! - `tokio-serial-async`: Enables the **asynchronous** transport session and client using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing the decoded telemetry.
//! - `bin-dependencies`: Enables all features required by the `jkbms` binary executable.

/// Contains error types for the library.
mod error;
/// Static descriptor table of the telemetry fields and their value decoders.
pub mod fields;
/// Walks a validated response against the field table.
pub mod parser;
/// Defines the request frame and checksum of the JK BMS protocol.
pub mod protocol;

pub use error::{DecodeError, Error, TransportError};
pub use parser::{CellData, CellVoltage, PackData, TelemetryRecord};

/// Serial port lifecycle and request/response framing.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod session;

/// Asynchronous client for JK BMS communication.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
