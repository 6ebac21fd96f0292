use crate::fields::{self, FetStatus, FieldId, ProtectionStatus, Temperatures, FIELD_TABLE};
use crate::protocol::check_checksum;
use crate::{DecodeError, Error};
use std::ops::{Deref, Range};

#[cfg(feature = "serde")]
use serde::Serialize;

pub const CELL_BLOCK_REGISTER: u8 = 0x79;
const CELL_REGISTER_OFFSET: usize = 11;
const CELL_LENGTH_OFFSET: usize = 12;
const CELL_DATA_OFFSET: usize = 13;
// index byte followed by the big-endian millivolts
const CELL_ENTRY_LENGTH: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellVoltage {
    pub millivolts: u16,
    pub volts: f64,
}

/// Per-cell voltages in cell order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellData(Vec<CellVoltage>);

impl CellData {
    /// Leftover bytes that do not form a complete 3-byte entry are ignored.
    pub fn decode(cell_block: &[u8]) -> Self {
        let cells = cell_block
            .chunks_exact(CELL_ENTRY_LENGTH)
            .enumerate()
            .map(|(n_cell, entry)| {
                let millivolts = u16::from_be_bytes([entry[1], entry[2]]);
                let volts = f64::from(millivolts) / 1000.0;
                log::trace!("cell #{n_cell} mV={millivolts}");
                CellVoltage { millivolts, volts }
            })
            .collect();
        Self(cells)
    }
}

impl Deref for CellData {
    type Target = [CellVoltage];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Flat `cell<i>mV` / `cell<i>V` keys, the layout consumers of the cell topic expect
#[cfg(feature = "serde")]
impl Serialize for CellData {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.0.len() * 2))?;
        for (index, cell) in self.0.iter().enumerate() {
            map.serialize_entry(&format!("cell{index}mV"), &cell.millivolts)?;
            map.serialize_entry(&format!("cell{index}V"), &cell.volts)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PackData {
    pub pack_voltage: f64,
    pub pack_current: f64, // positive=charging, negative=discharging
    pub rated_capacity: u32,
    pub cycle_capacity: u32,
    /// Not reported by the BMS: `floor(rated_capacity * state_of_charge / 100)`.
    pub balance_capacity: u32,
    pub cell_count: u16,
    pub protection: ProtectionStatus,
    pub cycle_count: u16,
    pub temperature_sensor_count: u8,
    pub temperatures: Temperatures,
    pub firmware_version: String,
    pub state_of_charge: u8,
    pub fet_status: FetStatus,
    pub balancer_switch: bool,
    pub on_time_minutes: u32,
    pub user_data: String,
}

impl PackData {
    /// Stores the value bytes of one table field. Each field has exactly one encoding,
    /// the same one its table entry names.
    fn assign(&mut self, id: FieldId, raw: &[u8]) -> Result<(), DecodeError> {
        // Widths are fixed by the field table, so the narrowing casts cannot truncate
        match id {
            FieldId::PackVoltage => self.pack_voltage = fields::decode_unsigned_fixed_point(raw)?,
            FieldId::PackCurrent => self.pack_current = fields::decode_signed_fixed_point(raw)?,
            FieldId::RatedCapacity => self.rated_capacity = fields::decode_unsigned(raw)?,
            FieldId::CycleCapacity => self.cycle_capacity = fields::decode_unsigned(raw)?,
            FieldId::CellCount => self.cell_count = fields::decode_unsigned(raw)? as u16,
            FieldId::Protection => self.protection = fields::decode_protection(raw)?,
            FieldId::CycleCount => self.cycle_count = fields::decode_unsigned(raw)? as u16,
            FieldId::TemperatureSensorCount => {
                self.temperature_sensor_count = fields::decode_unsigned(raw)? as u8
            }
            FieldId::Temperatures => self.temperatures = fields::decode_temperatures(raw)?,
            FieldId::FirmwareVersion => self.firmware_version = fields::decode_ascii(raw),
            FieldId::StateOfCharge => self.state_of_charge = fields::decode_unsigned(raw)? as u8,
            FieldId::FetStatus => self.fet_status = fields::decode_fet_status(raw)?,
            FieldId::BalancerSwitch => self.balancer_switch = fields::decode_unsigned(raw)? != 0,
            FieldId::OnTimeMinutes => self.on_time_minutes = fields::decode_unsigned(raw)?,
            FieldId::UserData => self.user_data = fields::decode_ascii(raw),
        }
        Ok(())
    }
}

/// One decoded poll: the pack level values and the per-cell voltages.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TelemetryRecord {
    pub pack: PackData,
    pub cells: CellData,
}

pub fn balance_capacity(rated_capacity: u32, state_of_charge: u8) -> u32 {
    let capacity = u64::from(rated_capacity) * u64::from(state_of_charge) / 100;
    u32::try_from(capacity).unwrap_or(u32::MAX)
}

fn byte_at(buffer: &[u8], offset: usize) -> Result<u8, DecodeError> {
    buffer
        .get(offset)
        .copied()
        .ok_or(DecodeError::Truncated {
            needed: offset + 1,
            len: buffer.len(),
        })
}

fn slice(buffer: &[u8], range: Range<usize>) -> Result<&[u8], DecodeError> {
    let needed = range.end;
    buffer.get(range).ok_or(DecodeError::Truncated {
        needed,
        len: buffer.len(),
    })
}

fn expect_register(buffer: &[u8], offset: usize, expected: u8) -> Result<(), DecodeError> {
    let got = byte_at(buffer, offset)?;
    if got != expected {
        log::warn!(
            "Invalid BMS data received, expected register 0x{expected:02x} at offset 0x{offset:02x}, got 0x{got:02x}"
        );
        return Err(DecodeError::UnexpectedRegister {
            expected,
            offset,
            got,
        });
    }
    Ok(())
}

/// Decodes a response whose checksum has already been validated.
///
/// Each field's register tag is verified before its value is read and the first
/// mismatch aborts the parse, so a record is either complete or not returned at all.
pub fn parse(buffer: &[u8]) -> Result<TelemetryRecord, DecodeError> {
    expect_register(buffer, CELL_REGISTER_OFFSET, CELL_BLOCK_REGISTER)?;
    let cell_block_length = usize::from(byte_at(buffer, CELL_LENGTH_OFFSET)?);
    let cell_block_end = CELL_DATA_OFFSET + cell_block_length;
    let cells = CellData::decode(slice(buffer, CELL_DATA_OFFSET..cell_block_end)?);

    let rest_of_data = &buffer[cell_block_end..];
    let mut pack = PackData::default();
    for field in &FIELD_TABLE {
        expect_register(rest_of_data, field.offset, field.register)?;
        let raw = slice(rest_of_data, field.value_range())?;
        pack.assign(field.id, raw)?;
    }
    pack.balance_capacity = balance_capacity(pack.rated_capacity, pack.state_of_charge);

    Ok(TelemetryRecord { pack, cells })
}

/// Validates the checksum of a complete response and decodes it.
pub fn decode_response(buffer: &[u8]) -> Result<TelemetryRecord, Error> {
    let checksum = check_checksum(buffer);
    if !checksum.is_valid() {
        log::warn!("Received invalid data from BMS -- checksum failed: {checksum:?}");
        return Err(Error::ChecksumMismatch {
            computed: checksum.computed,
            received: checksum.received,
        });
    }
    log::trace!("Data from BMS passed checksum");
    Ok(parse(buffer)?)
}
