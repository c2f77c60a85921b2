//! Device attribute catalog.
//!
//! Attributes are identified by a one-byte id and carried inside
//! `GetAttributeResponse`, `SetAttribute` and `AttributeChanged` payloads as
//! `id | len | value bytes` (big-endian values).

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};

/// Attribute identifiers understood by the device firmware.
pub mod id {
    /// Device serial number (u64).
    pub const SERIAL_NO: u8 = 0x01;
    /// Firmware version, three bytes major/minor/patch.
    pub const FIRMWARE_VERSION: u8 = 0x02;
    /// Bluetooth MAC address, six bytes.
    pub const BLUETOOTH_MAC: u8 = 0x03;
    /// Model name, UTF-8.
    pub const MODEL: u8 = 0x04;
    /// Vendor name, UTF-8.
    pub const VENDOR: u8 = 0x05;
    /// Device clock, milliseconds since the Unix epoch (u64).
    pub const CURRENT_TIME: u8 = 0x71;
    /// Battery charge percentage (u8).
    pub const BATTERY_LEVEL: u8 = 0xA1;
    /// Heart rate in beats per minute (u16).
    pub const HEART_RATE: u8 = 0xA2;
    /// Whether the charger is attached (bool).
    pub const CHARGE_STATE: u8 = 0xA3;
    /// Skin temperature, signed raw value in 1/256 °C steps (i16).
    pub const TEMPERATURE: u8 = 0xA4;
}

/// A typed device attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    /// Device serial number.
    SerialNo(u64),
    /// Firmware version as (major, minor, patch).
    FirmwareVersion(u8, u8, u8),
    /// Bluetooth MAC address.
    BluetoothMac([u8; 6]),
    /// Model name.
    Model(String),
    /// Vendor name.
    Vendor(String),
    /// Device clock, milliseconds since the Unix epoch.
    CurrentTime(u64),
    /// Battery charge percentage.
    BatteryLevel(u8),
    /// Heart rate in beats per minute.
    HeartRate(u16),
    /// Whether the charger is attached.
    ChargeState(bool),
    /// Skin temperature, raw value in 1/256 °C steps.
    Temperature(i16),
}

impl Attribute {
    /// The wire id of this attribute.
    pub fn id(&self) -> u8 {
        match self {
            Attribute::SerialNo(_) => id::SERIAL_NO,
            Attribute::FirmwareVersion(..) => id::FIRMWARE_VERSION,
            Attribute::BluetoothMac(_) => id::BLUETOOTH_MAC,
            Attribute::Model(_) => id::MODEL,
            Attribute::Vendor(_) => id::VENDOR,
            Attribute::CurrentTime(_) => id::CURRENT_TIME,
            Attribute::BatteryLevel(_) => id::BATTERY_LEVEL,
            Attribute::HeartRate(_) => id::HEART_RATE,
            Attribute::ChargeState(_) => id::CHARGE_STATE,
            Attribute::Temperature(_) => id::TEMPERATURE,
        }
    }

    /// Append the `id | len | value` encoding of this attribute to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.id());
        match self {
            Attribute::SerialNo(value) => {
                out.push(8);
                let mut bytes = [0u8; 8];
                BigEndian::write_u64(&mut bytes, *value);
                out.extend_from_slice(&bytes);
            }
            Attribute::FirmwareVersion(major, minor, patch) => {
                out.push(3);
                out.extend_from_slice(&[*major, *minor, *patch]);
            }
            Attribute::BluetoothMac(mac) => {
                out.push(6);
                out.extend_from_slice(mac);
            }
            Attribute::Model(name) | Attribute::Vendor(name) => {
                out.push(name.len() as u8);
                out.extend_from_slice(name.as_bytes());
            }
            Attribute::CurrentTime(millis) => {
                out.push(8);
                let mut bytes = [0u8; 8];
                BigEndian::write_u64(&mut bytes, *millis);
                out.extend_from_slice(&bytes);
            }
            Attribute::BatteryLevel(percent) => {
                out.push(1);
                out.push(*percent);
            }
            Attribute::HeartRate(bpm) => {
                out.push(2);
                let mut bytes = [0u8; 2];
                BigEndian::write_u16(&mut bytes, *bpm);
                out.extend_from_slice(&bytes);
            }
            Attribute::ChargeState(attached) => {
                out.push(1);
                out.push(u8::from(*attached));
            }
            Attribute::Temperature(raw) => {
                out.push(2);
                let mut bytes = [0u8; 2];
                BigEndian::write_i16(&mut bytes, *raw);
                out.extend_from_slice(&bytes);
            }
        }
    }

    /// Decode one `id | len | value` attribute from the front of `buf`.
    ///
    /// Returns the attribute and the number of bytes consumed, or `None` if
    /// the buffer is truncated or the value does not match the id's shape.
    pub fn decode(buf: &[u8]) -> Option<(Attribute, usize)> {
        let (&attr_id, rest) = buf.split_first()?;
        let (&len, value) = rest.split_first()?;
        let len = len as usize;
        if value.len() < len {
            return None;
        }
        let value = &value[..len];
        let attribute = match attr_id {
            id::SERIAL_NO if len == 8 => Attribute::SerialNo(BigEndian::read_u64(value)),
            id::FIRMWARE_VERSION if len == 3 => {
                Attribute::FirmwareVersion(value[0], value[1], value[2])
            }
            id::BLUETOOTH_MAC if len == 6 => {
                let mut mac = [0u8; 6];
                mac.copy_from_slice(value);
                Attribute::BluetoothMac(mac)
            }
            id::MODEL => Attribute::Model(String::from_utf8(value.to_vec()).ok()?),
            id::VENDOR => Attribute::Vendor(String::from_utf8(value.to_vec()).ok()?),
            id::CURRENT_TIME if len == 8 => Attribute::CurrentTime(BigEndian::read_u64(value)),
            id::BATTERY_LEVEL if len == 1 => Attribute::BatteryLevel(value[0]),
            id::HEART_RATE if len == 2 => Attribute::HeartRate(BigEndian::read_u16(value)),
            id::CHARGE_STATE if len == 1 => Attribute::ChargeState(value[0] != 0),
            id::TEMPERATURE if len == 2 => Attribute::Temperature(BigEndian::read_i16(value)),
            _ => return None,
        };
        Some((attribute, 2 + len))
    }

    /// The device clock as a UTC timestamp, for `CurrentTime` values.
    pub fn as_utc_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Attribute::CurrentTime(millis) => DateTime::from_timestamp_millis(*millis as i64),
            _ => None,
        }
    }

    /// The temperature in degrees Celsius, for `Temperature` values.
    pub fn as_celsius(&self) -> Option<f32> {
        match self {
            Attribute::Temperature(raw) => Some(*raw as f32 / 256.0),
            _ => None,
        }
    }
}
