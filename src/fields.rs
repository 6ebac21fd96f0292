//! Descriptor table for every field of the read-all response that follows the
//! cell voltage block, and the decoders turning the raw bytes into values.
//!
//! Offsets are relative to the first byte after the cell block; the register
//! tag sits at `offset` and the value occupies the `length` bytes after it.

use crate::DecodeError;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Wire encoding of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Big-endian unsigned integer, 1, 2 or 4 bytes wide.
    UnsignedInt,
    /// Big-endian `u16` with two implied decimals.
    UnsignedFixedPoint100,
    /// Big-endian `u16` with an offset-encoded sign and two implied decimals.
    SignedFixedPoint100,
    Ascii,
    TemperatureBlock,
    ProtectionBitfield,
    FetStatusBitfield,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldId {
    PackVoltage,
    PackCurrent,
    RatedCapacity,
    CycleCapacity,
    CellCount,
    Protection,
    CycleCount,
    TemperatureSensorCount,
    Temperatures,
    FirmwareVersion,
    StateOfCharge,
    FetStatus,
    BalancerSwitch,
    OnTimeMinutes,
    UserData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub id: FieldId,
    pub name: &'static str,
    pub offset: usize,
    pub register: u8,
    pub length: usize,
    pub value_type: ValueType,
}

impl FieldDescriptor {
    const fn new(
        id: FieldId,
        name: &'static str,
        offset: usize,
        register: u8,
        length: usize,
        value_type: ValueType,
    ) -> Self {
        Self {
            id,
            name,
            offset,
            register,
            length,
            value_type,
        }
    }

    /// Range of the value bytes, just after the register tag.
    pub fn value_range(&self) -> std::ops::Range<usize> {
        self.offset + 1..self.offset + 1 + self.length
    }
}

/// Scan order is table order; the first mismatching register is the one reported.
#[rustfmt::skip]
pub const FIELD_TABLE: [FieldDescriptor; 15] = [
    FieldDescriptor::new(FieldId::PackVoltage, "packV", 0x09, 0x83, 2, ValueType::UnsignedFixedPoint100),
    FieldDescriptor::new(FieldId::PackCurrent, "packA", 0x0C, 0x84, 2, ValueType::SignedFixedPoint100),
    // The pack does not report a balance capacity, it is derived from this and the SOC
    FieldDescriptor::new(FieldId::RatedCapacity, "packRateCap", 0xBD, 0xB9, 4, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::CycleCapacity, "packCycleCap", 0x16, 0x89, 4, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::CellCount, "packNumberOfCells", 0x1B, 0x8A, 2, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::Protection, "protectionStatus", 0x1E, 0x8B, 2, ValueType::ProtectionBitfield),
    FieldDescriptor::new(FieldId::CycleCount, "packNumberCycles", 0x13, 0x87, 2, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::TemperatureSensorCount, "tempSensorCount", 0x11, 0x86, 1, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::Temperatures, "tempSensorValues", 0x00, 0x80, 8, ValueType::TemperatureBlock),
    FieldDescriptor::new(FieldId::FirmwareVersion, "bmsSWVersion", 0xAB, 0xB7, 15, ValueType::Ascii),
    FieldDescriptor::new(FieldId::StateOfCharge, "packSOC", 0x0F, 0x85, 1, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::FetStatus, "FETStatus", 0x21, 0x8C, 2, ValueType::FetStatusBitfield),
    FieldDescriptor::new(FieldId::BalancerSwitch, "balancerSwitch", 0x51, 0x9D, 1, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::OnTimeMinutes, "bmsOnMinutes", 0xA6, 0xB6, 4, ValueType::UnsignedInt),
    FieldDescriptor::new(FieldId::UserData, "userData", 0xC2, 0xBA, 26, ValueType::Ascii),
];

pub fn descriptor(id: FieldId) -> Option<&'static FieldDescriptor> {
    FIELD_TABLE.iter().find(|d| d.id == id)
}

/// Raw NTC readings. The byte between two readings is the next sensor's register tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Temperatures {
    pub ntc0: u16,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub ntc1: Option<u16>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub ntc2: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ProtectionStatus {
    pub low_capacity: bool,
    pub bms_overtemp: bool,
    pub pack_overvolt: bool,
    pub pack_undervolt: bool,
    pub pack_overtemp: bool,
    pub charge_overcurrent: bool,
    pub discharge_overcurrent: bool,
    pub cell_current_difference: bool,
    pub pack_overtemp2: bool,
    pub pack_undertemp: bool,
    pub single_cell_overvolt: bool,
    pub single_cell_undervolt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct FetStatus {
    pub charging: bool,
    pub discharging: bool,
    pub balancing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unsigned(u32),
    Decimal(f64),
    Text(String),
    Temperatures(Temperatures),
    Protection(ProtectionStatus),
    Fet(FetStatus),
}

macro_rules! read_bit {
    ($word:expr,$position:expr) => {
        ($word >> $position) & 1 != 0
    };
}

fn be_u16(raw: &[u8]) -> Result<u16, DecodeError> {
    match raw {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::Truncated {
            needed: 2,
            len: raw.len(),
        }),
    }
}

pub(crate) fn decode_unsigned(raw: &[u8]) -> Result<u32, DecodeError> {
    match raw {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo]).into()),
        [first, ..] => Ok((*first).into()),
        [] => Err(DecodeError::Truncated { needed: 1, len: 0 }),
    }
}

pub(crate) fn decode_unsigned_fixed_point(raw: &[u8]) -> Result<f64, DecodeError> {
    Ok(f64::from(be_u16(raw)?) / 100.0)
}

pub(crate) fn decode_signed_fixed_point(raw: &[u8]) -> Result<f64, DecodeError> {
    let raw = be_u16(raw)?;
    // JK adds 32768 to positive values. Everything at or below that boundary is read
    // as a negative magnitude, 32768 itself included.
    let value = if raw > 32768 {
        f64::from(raw - 32768) / 100.0
    } else if raw == 0 {
        0.0
    } else {
        f64::from(raw) / -100.0
    };
    Ok(value)
}

pub(crate) fn decode_ascii(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

pub(crate) fn decode_temperatures(raw: &[u8]) -> Result<Temperatures, DecodeError> {
    let sensor = |range: std::ops::Range<usize>| raw.get(range).map(be_u16).transpose();
    Ok(Temperatures {
        ntc0: be_u16(raw)?,
        ntc1: sensor(3..5)?,
        ntc2: sensor(6..8)?,
    })
}

pub(crate) fn decode_protection(raw: &[u8]) -> Result<ProtectionStatus, DecodeError> {
    let word = be_u16(raw)?;
    Ok(ProtectionStatus {
        low_capacity: read_bit!(word, 0),
        bms_overtemp: read_bit!(word, 1),
        pack_overvolt: read_bit!(word, 2),
        pack_undervolt: read_bit!(word, 3),
        pack_overtemp: read_bit!(word, 4),
        charge_overcurrent: read_bit!(word, 5),
        discharge_overcurrent: read_bit!(word, 6),
        cell_current_difference: read_bit!(word, 7),
        pack_overtemp2: read_bit!(word, 8),
        pack_undertemp: read_bit!(word, 9),
        single_cell_overvolt: read_bit!(word, 10),
        single_cell_undervolt: read_bit!(word, 11),
    })
}

pub(crate) fn decode_fet_status(raw: &[u8]) -> Result<FetStatus, DecodeError> {
    let word = be_u16(raw)?;
    Ok(FetStatus {
        charging: read_bit!(word, 0),
        discharging: read_bit!(word, 1),
        balancing: read_bit!(word, 2),
    })
}

/// Converts the value bytes of a field. Pure and non-blocking; the only failure is
/// a slice shorter than the encoding requires.
pub fn decode(value_type: ValueType, raw: &[u8]) -> Result<Value, DecodeError> {
    let value = match value_type {
        ValueType::UnsignedInt => Value::Unsigned(decode_unsigned(raw)?),
        ValueType::UnsignedFixedPoint100 => Value::Decimal(decode_unsigned_fixed_point(raw)?),
        ValueType::SignedFixedPoint100 => Value::Decimal(decode_signed_fixed_point(raw)?),
        ValueType::Ascii => Value::Text(decode_ascii(raw)),
        ValueType::TemperatureBlock => Value::Temperatures(decode_temperatures(raw)?),
        ValueType::ProtectionBitfield => Value::Protection(decode_protection(raw)?),
        ValueType::FetStatusBitfield => Value::Fet(decode_fet_status(raw)?),
    };
    Ok(value)
}
