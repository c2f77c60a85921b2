//! Typed attribute facade over the communicator.
//!
//! Mirrors the device's get/set attribute surface with plain Rust types so
//! callers don't have to touch the message catalog for common operations.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::codec::attributes::{id, Attribute};
use crate::codec::{FileEntry, Message};
use crate::protocol::{Communicator, ProtocolError};

/// Convenience facade for common request/response exchanges.
pub struct SendHelper<'a> {
    comm: &'a Communicator,
    timeout: Duration,
}

impl<'a> SendHelper<'a> {
    /// Wrap `comm`, using `timeout` for every exchange.
    pub fn new(comm: &'a Communicator, timeout: Duration) -> Self {
        Self { comm, timeout }
    }

    fn get_attribute(&self, attribute_id: u8) -> Result<Attribute, ProtocolError> {
        match self
            .comm
            .send_and_wait(&Message::GetAttribute { attribute_id }, self.timeout)?
        {
            Message::GetAttributeResponse { attribute } if attribute.id() == attribute_id => {
                Ok(attribute)
            }
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    fn set_attribute(&self, attribute: Attribute) -> Result<bool, ProtocolError> {
        match self
            .comm
            .send_and_wait(&Message::SetAttribute { attribute }, self.timeout)?
        {
            Message::SetAttributeResponse { accepted } => Ok(accepted),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Heartbeat roundtrip, to verify the device is answering.
    pub fn ping(&self) -> Result<(), ProtocolError> {
        match self.comm.send_and_wait(&Message::Heartbeat, self.timeout)? {
            Message::HeartbeatResponse => Ok(()),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Device serial number.
    pub fn get_serial_no(&self) -> Result<u64, ProtocolError> {
        match self.get_attribute(id::SERIAL_NO)? {
            Attribute::SerialNo(value) => Ok(value),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Firmware version formatted as `major.minor.patch`.
    pub fn get_firmware_version(&self) -> Result<String, ProtocolError> {
        match self.get_attribute(id::FIRMWARE_VERSION)? {
            Attribute::FirmwareVersion(major, minor, patch) => {
                Ok(format!("{major}.{minor}.{patch}"))
            }
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Bluetooth MAC address formatted as `aa:bb:cc:dd:ee:ff`.
    pub fn get_bluetooth_mac(&self) -> Result<String, ProtocolError> {
        match self.get_attribute(id::BLUETOOTH_MAC)? {
            Attribute::BluetoothMac(mac) => Ok(mac
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(":")),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Model name.
    pub fn get_model(&self) -> Result<String, ProtocolError> {
        match self.get_attribute(id::MODEL)? {
            Attribute::Model(name) => Ok(name),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Vendor name.
    pub fn get_vendor(&self) -> Result<String, ProtocolError> {
        match self.get_attribute(id::VENDOR)? {
            Attribute::Vendor(name) => Ok(name),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Battery charge percentage.
    pub fn get_battery_level(&self) -> Result<u8, ProtocolError> {
        match self.get_attribute(id::BATTERY_LEVEL)? {
            Attribute::BatteryLevel(percent) => Ok(percent),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Current heart rate in beats per minute.
    pub fn get_heart_rate(&self) -> Result<u16, ProtocolError> {
        match self.get_attribute(id::HEART_RATE)? {
            Attribute::HeartRate(bpm) => Ok(bpm),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Whether the charger is attached.
    pub fn get_charge_state(&self) -> Result<bool, ProtocolError> {
        match self.get_attribute(id::CHARGE_STATE)? {
            Attribute::ChargeState(attached) => Ok(attached),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }

    /// Skin temperature in degrees Celsius.
    pub fn get_temperature(&self) -> Result<f32, ProtocolError> {
        self.get_attribute(id::TEMPERATURE)?
            .as_celsius()
            .ok_or(ProtocolError::InvalidResponse)
    }

    /// The device clock as a UTC timestamp.
    pub fn get_current_time(&self) -> Result<DateTime<Utc>, ProtocolError> {
        self.get_attribute(id::CURRENT_TIME)?
            .as_utc_time()
            .ok_or(ProtocolError::InvalidResponse)
    }

    /// Set the device clock to the host's current time. Returns whether the
    /// device accepted the write.
    pub fn set_current_time_now(&self) -> Result<bool, ProtocolError> {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        self.set_attribute(Attribute::CurrentTime(millis))
    }

    /// List the files stored on the device.
    pub fn list_files(&self) -> Result<Vec<FileEntry>, ProtocolError> {
        match self.comm.send_and_wait(&Message::ListFiles, self.timeout)? {
            Message::ListFilesResponse { entries } => Ok(entries),
            _ => Err(ProtocolError::InvalidResponse),
        }
    }
}
