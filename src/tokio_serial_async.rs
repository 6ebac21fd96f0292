//! Provides an asynchronous client for polling a JK BMS (Battery Management System)
//! using Tokio and the `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use jkbms_lib::tokio_serial_async::JkBms;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), jkbms_lib::Error> {
//!     let mut bms = JkBms::new("/dev/ttyUSB0", 115200);
//!     bms.set_timeout(Duration::from_secs(2));
//!
//!     let record = bms.fetch_once().await?;
//!     println!("Pack: {:?}", record.pack);
//!     println!("Cells: {:?}", record.cells);
//!
//!     Ok(())
//! }
//! ```

use crate::parser::{decode_response, TelemetryRecord};
use crate::protocol::RequestFrame;
use crate::session::{PortOpener, PortState, SessionConfig, TransportSession};
use crate::Error;
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Opens the serial device with the JK BMS line settings (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct SerialPortOpener {
    path: String,
    baud_rate: u32,
}

impl SerialPortOpener {
    pub fn new(path: &str, baud_rate: u32) -> Self {
        Self {
            path: path.to_string(),
            baud_rate,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl PortOpener for SerialPortOpener {
    type Port = tokio_serial::SerialStream;

    fn open(&mut self) -> std::io::Result<Self::Port> {
        log::debug!("Opening serial port {} at {} baud", self.path, self.baud_rate);
        tokio_serial::new(&self.path, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::from)
    }

    fn discard_pending(&mut self, port: &mut Self::Port) -> std::io::Result<()> {
        let pending = port.bytes_to_read().map_err(std::io::Error::from)?;
        if pending > 0 {
            log::trace!("Discarding {pending} pending bytes");
        }
        port.clear(tokio_serial::ClearBuffer::All)
            .map_err(std::io::Error::from)
    }
}

/// The main struct for polling a JK BMS asynchronously.
///
/// It owns the transport session and the read-all request, which is built once and
/// sent unchanged on every poll. Each [`JkBms::fetch_once`] call performs exactly one
/// request/response exchange; retrying and scheduling are left to the caller.
#[derive(Debug)]
pub struct JkBms<O: PortOpener = SerialPortOpener> {
    session: TransportSession<O>,
    request: RequestFrame,
}

impl JkBms<SerialPortOpener> {
    /// Creates a new `JkBms` for the given serial device.
    ///
    /// The port is not opened until the first fetch, so this never fails.
    ///
    /// # Arguments
    ///
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    /// * `baud_rate`: Line speed, usually [`DEFAULT_BAUD_RATE`].
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self::with_opener(
            SerialPortOpener::new(port, baud_rate),
            SessionConfig::default(),
        )
    }
}

impl<O: PortOpener> JkBms<O> {
    /// Creates a client on top of any [`PortOpener`], e.g. a simulated device.
    pub fn with_opener(opener: O, config: SessionConfig) -> Self {
        Self {
            session: TransportSession::new(opener, config),
            request: RequestFrame::read_all(),
        }
    }

    /// Sets the ceiling for one complete request/response exchange.
    pub fn set_timeout(&mut self, timeout: Duration) {
        log::trace!("set timeout to {timeout:?}");
        self.session.config_mut().response_timeout = timeout;
    }

    /// Sets how long the line has to stay silent before a response is considered complete.
    pub fn set_quiet_interval(&mut self, quiet_interval: Duration) {
        log::trace!("set quiet interval to {quiet_interval:?}");
        self.session.config_mut().quiet_interval = quiet_interval;
    }

    pub fn state(&self) -> PortState {
        self.session.state()
    }

    pub fn session(&self) -> &TransportSession<O> {
        &self.session
    }

    /// Closes the serial port; the next fetch reopens it.
    pub fn reset(&mut self) {
        self.session.reset();
    }

    /// Sends the read-all request and decodes the response.
    ///
    /// # Returns
    ///
    /// The decoded `TelemetryRecord`, or an `Error` telling transport faults
    /// (the port has been reset) apart from checksum and decode failures
    /// (the port stays open, only this poll's data is discarded).
    pub async fn fetch_once(&mut self) -> Result<TelemetryRecord> {
        log::trace!("Requesting data from BMS...");
        let response = self.session.request_response(&self.request).await?;
        decode_response(&response)
    }
}
