//! Owns the serial handle and its lifecycle.
//!
//! A response has no length prefix the host can trust before decoding, so a
//! frame is everything received until the line stays quiet for
//! [`SessionConfig::quiet_interval`].
//!
//! The session is driven through `&mut self`, which makes a second request
//! impossible while one is outstanding. If a request future is dropped before
//! it completes, the handle it was using is dropped with it and the next
//! [`TransportSession::ensure_open`] starts over with a fresh open.

use crate::TransportError;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 2048;

const READ_CHUNK: usize = 256;

/// Opens the underlying serial handle. Implemented for real ports by
/// [`crate::tokio_serial_async::SerialPortOpener`]; tests substitute in-memory pipes.
pub trait PortOpener {
    type Port: AsyncRead + AsyncWrite + Unpin + Send;

    fn open(&mut self) -> io::Result<Self::Port>;

    /// Drops whatever is buffered in either direction.
    fn discard_pending(&mut self, _port: &mut Self::Port) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub quiet_interval: Duration,
    /// Ceiling for writing the request and receiving the complete response.
    pub response_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quiet_interval: DEFAULT_QUIET_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Closed,
    Open,
    Faulted,
}

enum Link<P> {
    Closed,
    Open(P),
    /// Handle checked out by a request that has not completed.
    InFlight,
    Faulted,
}

pub struct TransportSession<O: PortOpener> {
    opener: O,
    link: Link<O::Port>,
    config: SessionConfig,
}

impl<O: PortOpener> std::fmt::Debug for TransportSession<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<O: PortOpener> TransportSession<O> {
    pub fn new(opener: O, config: SessionConfig) -> Self {
        Self {
            opener,
            link: Link::Closed,
            config,
        }
    }

    pub fn state(&self) -> PortState {
        match self.link {
            Link::Closed => PortState::Closed,
            Link::Open(_) => PortState::Open,
            // only observable once the request future has been dropped
            Link::InFlight | Link::Faulted => PortState::Faulted,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SessionConfig {
        &mut self.config
    }

    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Opens the port unless it already is. An open failure resets the session to `Closed`.
    pub fn ensure_open(&mut self) -> Result<(), TransportError> {
        let port = self.checkout()?;
        self.link = Link::Open(port);
        Ok(())
    }

    /// Takes the open handle out of the session, opening one first if needed.
    /// The link stays `InFlight` until the handle is put back or dropped.
    fn checkout(&mut self) -> Result<O::Port, TransportError> {
        match std::mem::replace(&mut self.link, Link::InFlight) {
            Link::Open(port) => return Ok(port),
            Link::InFlight => {
                log::warn!("Previous request was abandoned before its response arrived");
                self.reset();
            }
            Link::Faulted => self.reset(),
            Link::Closed => self.link = Link::Closed,
        }

        match self.opener.open() {
            Ok(port) => {
                log::info!("Serial port opened...");
                self.link = Link::InFlight;
                Ok(port)
            }
            Err(err) => {
                log::error!("Serial port open error: {err}");
                self.link = Link::Closed;
                Err(TransportError::OpenFailed(err))
            }
        }
    }

    /// Discards pending I/O and closes the handle. Safe to call in any state.
    pub fn reset(&mut self) {
        match std::mem::replace(&mut self.link, Link::Closed) {
            Link::Open(port) => {
                log::error!("Resetting serial port...");
                self.close(port);
            }
            Link::Faulted | Link::InFlight => log::debug!("Serial port reset to closed"),
            Link::Closed => {}
        }
    }

    fn close(&mut self, mut port: O::Port) {
        if let Err(err) = self.opener.discard_pending(&mut port) {
            log::debug!("Cannot discard pending serial data: {err}");
        }
        drop(port);
        log::info!("Serial port closed...");
    }

    fn fault(&mut self, port: O::Port, err: TransportError) -> TransportError {
        log::error!("{err}");
        self.link = Link::Faulted;
        self.close(port);
        self.reset();
        err
    }

    /// Writes `frame` and returns the next quiet-interval delimited response.
    ///
    /// Any failure leaves the session `Closed`; the following call reopens the port.
    pub async fn request_response(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut port = self.checkout()?;

        // A late answer to an earlier request must not be taken for this one
        if let Err(err) = self.opener.discard_pending(&mut port) {
            log::debug!("Cannot discard pending serial data: {err}");
        }

        let response_timeout = self.config.response_timeout;
        let write = async {
            port.write_all(frame).await?;
            port.flush().await
        };
        let written = tokio::time::timeout(response_timeout, write).await;
        match written {
            Ok(Ok(())) => log::trace!("Request sent (HEX): {frame:02X?}"),
            Ok(Err(err)) => return Err(self.fault(port, TransportError::WriteFailed(err))),
            Err(_) => return Err(self.fault(port, TransportError::Timeout(response_timeout))),
        }

        let read = read_frame(
            &mut port,
            self.config.quiet_interval,
            self.config.max_frame_length,
        );
        let received = tokio::time::timeout(response_timeout, read).await;
        match received {
            Ok(Ok(response)) => {
                log::trace!("Received raw data from BMS (HEX): {response:02X?}");
                self.link = Link::Open(port);
                Ok(response)
            }
            Ok(Err(err)) => Err(self.fault(port, err)),
            Err(_) => Err(self.fault(port, TransportError::Timeout(response_timeout))),
        }
    }
}

/// Reads until no byte arrives for `quiet_interval` or the peer closes.
/// Waiting for the first byte is bounded only by the caller's response timeout.
async fn read_frame<P: AsyncRead + Unpin>(
    port: &mut P,
    quiet_interval: Duration,
    max_frame_length: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut frame = Vec::with_capacity(READ_CHUNK);

    loop {
        let read = if frame.is_empty() {
            port.read(&mut chunk).await
        } else {
            match tokio::time::timeout(quiet_interval, port.read(&mut chunk)).await {
                Ok(read) => read,
                Err(_) => break,
            }
        };
        let received = read.map_err(TransportError::ReadFailed)?;
        if received == 0 {
            if frame.is_empty() {
                return Err(TransportError::Disconnected);
            }
            break;
        }
        frame.extend_from_slice(&chunk[..received]);
        if frame.len() > max_frame_length {
            return Err(TransportError::Overrun { len: frame.len() });
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{duplex, DuplexStream};

    #[derive(Default)]
    struct ScriptedOpener {
        ports: VecDeque<io::Result<DuplexStream>>,
        opened: usize,
    }

    impl ScriptedOpener {
        fn with(ports: impl IntoIterator<Item = io::Result<DuplexStream>>) -> Self {
            Self {
                ports: ports.into_iter().collect(),
                opened: 0,
            }
        }
    }

    impl PortOpener for ScriptedOpener {
        type Port = DuplexStream;

        fn open(&mut self) -> io::Result<DuplexStream> {
            self.opened += 1;
            self.ports
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::NotFound, "no such port")))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            quiet_interval: Duration::from_millis(50),
            response_timeout: Duration::from_millis(500),
            max_frame_length: 64,
        }
    }

    /// A port whose far end has already gone away, so every write fails.
    fn broken_port() -> DuplexStream {
        let (port, device) = duplex(64);
        drop(device);
        port
    }

    #[tokio::test]
    async fn ensure_open_is_a_no_op_when_open() {
        let (port, _device) = duplex(64);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());
        assert_eq!(session.state(), PortState::Closed);
        session.ensure_open().expect("open");
        session.ensure_open().expect("still open");
        assert_eq!(session.state(), PortState::Open);
        assert_eq!(session.opener().opened, 1);
    }

    #[tokio::test]
    async fn open_failure_resets_to_closed() {
        let mut session = TransportSession::new(ScriptedOpener::default(), config());
        assert!(matches!(
            session.ensure_open(),
            Err(TransportError::OpenFailed(_))
        ));
        assert_eq!(session.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let (port, _device) = duplex(64);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());
        session.reset();
        session.ensure_open().expect("open");
        session.reset();
        session.reset();
        assert_eq!(session.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn response_is_delimited_by_quiet_interval() {
        let (port, mut device) = duplex(256);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());

        let bms = tokio::spawn(async move {
            let mut request = [0u8; 3];
            device.read_exact(&mut request).await.expect("request");
            device.write_all(&[0x4E, 0x57]).await.expect("first part");
            tokio::time::sleep(Duration::from_millis(5)).await;
            device.write_all(&[0x01, 0x02]).await.expect("second part");
            (request, device)
        });

        let response = session.request_response(&[1, 2, 3]).await.expect("response");
        assert_eq!(response, vec![0x4E, 0x57, 0x01, 0x02]);
        assert_eq!(session.state(), PortState::Open);

        let (request, _device) = bms.await.expect("device task");
        assert_eq!(request, [1, 2, 3]);
    }

    #[tokio::test]
    async fn write_failure_closes_and_next_request_reopens() {
        let (port, mut device) = duplex(256);
        let opener = ScriptedOpener::with([Ok(broken_port()), Ok(port)]);
        let mut session = TransportSession::new(opener, config());

        assert!(matches!(
            session.request_response(&[0xAA]).await,
            Err(TransportError::WriteFailed(_))
        ));
        assert_eq!(session.state(), PortState::Closed);
        assert_eq!(session.opener().opened, 1);

        let bms = tokio::spawn(async move {
            let mut request = [0u8; 1];
            device.read_exact(&mut request).await.expect("request");
            device.write_all(&[0x55]).await.expect("response");
            device
        });
        let response = session.request_response(&[0xAA]).await.expect("response");
        assert_eq!(response, vec![0x55]);
        assert_eq!(session.opener().opened, 2);
        let _device = bms.await.expect("device task");
    }

    #[tokio::test]
    async fn silent_device_times_out_and_closes() {
        let (port, _device) = duplex(64);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());
        assert!(matches!(
            session.request_response(&[0xAA]).await,
            Err(TransportError::Timeout(_))
        ));
        assert_eq!(session.state(), PortState::Closed);
    }

    #[tokio::test]
    async fn device_hanging_up_is_reported() {
        let (port, mut device) = duplex(64);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());
        let bms = tokio::spawn(async move {
            let mut request = [0u8; 1];
            device.read_exact(&mut request).await.expect("request");
        });
        assert!(matches!(
            session.request_response(&[0xAA]).await,
            Err(TransportError::Disconnected)
        ));
        assert_eq!(session.state(), PortState::Closed);
        bms.await.expect("device task");
    }

    #[tokio::test]
    async fn endless_stream_is_an_overrun() {
        let (port, mut device) = duplex(1024);
        let mut session = TransportSession::new(ScriptedOpener::with([Ok(port)]), config());
        let bms = tokio::spawn(async move {
            let mut request = [0u8; 1];
            device.read_exact(&mut request).await.expect("request");
            let _ = device.write_all(&[0xFF; 128]).await;
            device
        });
        assert!(matches!(
            session.request_response(&[0xAA]).await,
            Err(TransportError::Overrun { .. })
        ));
        assert_eq!(session.state(), PortState::Closed);
        let _device = bms.await.expect("device task");
    }

    #[tokio::test]
    async fn abandoned_request_forces_a_fresh_open() {
        let (first, _first_device) = duplex(64);
        let (second, _second_device) = duplex(64);
        let opener = ScriptedOpener::with([Ok(first), Ok(second)]);
        let mut session = TransportSession::new(opener, config());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            session.request_response(&[0xAA]),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(session.state(), PortState::Faulted);

        session.ensure_open().expect("reopen");
        assert_eq!(session.state(), PortState::Open);
        assert_eq!(session.opener().opened, 2);
    }
}
