use std::time::Duration;

/// Failures of the serial link itself.
///
/// Every variant is reported only after the session has reset the port, so the
/// next fetch always starts from a freshly opened handle.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Cannot open serial port: {0}")]
    OpenFailed(#[source] std::io::Error),
    #[error("Serial port write error: {0}")]
    WriteFailed(#[source] std::io::Error),
    #[error("Serial port read error: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("No complete response within {0:?}")]
    Timeout(Duration),
    #[error("Serial port closed while waiting for a response")]
    Disconnected,
    #[error("Response exceeds {len} bytes without a frame boundary")]
    Overrun { len: usize },
}

/// The response passed its checksum but does not have the expected layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid BMS data received, expected register 0x{expected:02x} at offset 0x{offset:02x}, got 0x{got:02x}")]
    UnexpectedRegister { expected: u8, offset: usize, got: u8 },
    #[error("Invalid BMS data received, need {needed} bytes but only {len} available")]
    Truncated { needed: usize, len: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Checksum failed - calculated={computed:08X} received={}", hex_or_none(.received))]
    ChecksumMismatch {
        computed: u32,
        received: Option<u32>,
    },
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

fn hex_or_none(value: &Option<u32>) -> String {
    match value {
        Some(value) => format!("{value:08X}"),
        None => "<none>".to_string(),
    }
}

impl Error {
    /// Short label used to tell cabling problems apart from protocol drift.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::ChecksumMismatch { .. } => "checksum",
            Error::Decode(_) => "decode",
        }
    }
}
