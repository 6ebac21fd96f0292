use std::fmt;
use std::ops::Deref;

/// Who sent a frame.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum FrameSource {
    Host = 0x03,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    ReadAll = 0x06,
}

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum TransportType {
    Read = 0x00,
}

pub const START_BYTES: [u8; 2] = [0x4E, 0x57];
pub const END_BYTE: u8 = 0x68;
pub const CHECKSUM_LENGTH: usize = 4;

const TERMINAL_NUMBER: [u8; 4] = [0x00; 4];
const RECORD_NUMBER: [u8; 4] = [0x00; 4];
// 0x00 is the only register defined for the read-all command
const READ_ALL_REGISTER: u8 = 0x00;

const PAYLOAD_LENGTH: usize = 17;
pub const REQUEST_LENGTH: usize = PAYLOAD_LENGTH + CHECKSUM_LENGTH;

/// Sums every byte of `bytes`; the protocol's "CRC" is this sum as a 32-bit big-endian value.
pub fn compute_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, b| sum.wrapping_add(u32::from(*b)))
}

/// Outcome of comparing a frame's trailing checksum against the sum of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumResult {
    pub computed: u32,
    /// `None` when the buffer is too short to carry a checksum at all.
    pub received: Option<u32>,
}

impl ChecksumResult {
    pub fn is_valid(&self) -> bool {
        self.received == Some(self.computed)
    }
}

pub fn check_checksum(buffer: &[u8]) -> ChecksumResult {
    if buffer.len() < CHECKSUM_LENGTH {
        return ChecksumResult {
            computed: compute_checksum(buffer),
            received: None,
        };
    }
    let (payload, trailer) = buffer.split_at(buffer.len() - CHECKSUM_LENGTH);
    let computed = compute_checksum(payload);
    let received = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    log::trace!("got sum of payload: {computed:08X}, bms provided checksum: {received:08X}");
    ChecksumResult {
        computed,
        received: Some(received),
    }
}

pub fn validate_checksum(buffer: &[u8]) -> bool {
    check_checksum(buffer).is_valid()
}

/// The fixed "read all" request. Its content never changes, so it is built once and reused.
#[derive(Clone, PartialEq, Eq)]
pub struct RequestFrame([u8; REQUEST_LENGTH]);

impl RequestFrame {
    pub fn read_all() -> Self {
        let mut tx_buffer = [0u8; REQUEST_LENGTH];
        // The length field counts everything after the start bytes, checksum included
        let length = (REQUEST_LENGTH - START_BYTES.len()) as u16;

        tx_buffer[0..2].copy_from_slice(&START_BYTES);
        tx_buffer[2..4].copy_from_slice(&length.to_be_bytes());
        tx_buffer[4..8].copy_from_slice(&TERMINAL_NUMBER);
        tx_buffer[8] = Command::ReadAll as u8;
        tx_buffer[9] = FrameSource::Host as u8;
        tx_buffer[10] = TransportType::Read as u8;
        tx_buffer[11] = READ_ALL_REGISTER;
        tx_buffer[12..16].copy_from_slice(&RECORD_NUMBER);
        tx_buffer[16] = END_BYTE;

        let checksum = compute_checksum(&tx_buffer[..PAYLOAD_LENGTH]);
        tx_buffer[PAYLOAD_LENGTH..].copy_from_slice(&checksum.to_be_bytes());
        debug_assert!(validate_checksum(&tx_buffer));
        Self(tx_buffer)
    }
}

impl Default for RequestFrame {
    fn default() -> Self {
        Self::read_all()
    }
}

impl Deref for RequestFrame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for RequestFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}
