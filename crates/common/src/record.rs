//! Device record and filter types
//!
//! A [`DeviceRecord`] is built once by a platform watcher and never mutated
//! afterwards. Registries hand out clones, so a record seen by a consumer is
//! always a complete, detached value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform-stable identity of a connected device instance
///
/// Stable for the lifetime of one connection. A replugged device may come
/// back under a different key.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKey(String);

impl DeviceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for DeviceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Descriptive snapshot of one USB device
///
/// Serializes with camelCase field names. Every field is always present;
/// unknown strings are empty. The registry key is not serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    #[serde(skip)]
    key: DeviceKey,
    location_id: u32,
    vendor_id: u16,
    product_id: u16,
    device_name: String,
    manufacturer: String,
    serial_number: String,
    device_address: u32,
}

impl DeviceRecord {
    /// Start building a record; identity and ids are fixed here
    pub fn builder(
        key: impl Into<DeviceKey>,
        vendor_id: u16,
        product_id: u16,
    ) -> DeviceRecordBuilder {
        DeviceRecordBuilder {
            record: DeviceRecord {
                key: key.into(),
                location_id: 0,
                vendor_id,
                product_id,
                device_name: String::new(),
                manufacturer: String::new(),
                serial_number: String::new(),
                device_address: 0,
            },
        }
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn location_id(&self) -> u32 {
        self.location_id
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn device_address(&self) -> u32 {
        self.device_address
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        match (self.manufacturer.is_empty(), self.device_name.is_empty()) {
            (true, true) => {}
            (false, true) => write!(f, " {}", self.manufacturer)?,
            (true, false) => write!(f, " {}", self.device_name)?,
            (false, false) => write!(f, " {} {}", self.manufacturer, self.device_name)?,
        }
        write!(
            f,
            " (location {:#010x}, address {})",
            self.location_id, self.device_address
        )
    }
}

/// Builder for [`DeviceRecord`]
#[derive(Debug, Clone)]
pub struct DeviceRecordBuilder {
    record: DeviceRecord,
}

impl DeviceRecordBuilder {
    pub fn location_id(mut self, location_id: u32) -> Self {
        self.record.location_id = location_id;
        self
    }

    pub fn device_address(mut self, device_address: u32) -> Self {
        self.record.device_address = device_address;
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.record.device_name = name.into();
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.record.manufacturer = manufacturer.into();
        self
    }

    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.record.serial_number = serial_number.into();
        self
    }

    pub fn build(self) -> DeviceRecord {
        self.record
    }
}

/// Vendor/product match used by find and by watcher filters
///
/// `None` fields match any value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFilter {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl DeviceFilter {
    /// Filter matching every device
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(vendor_id: Option<u16>, product_id: Option<u16>) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    pub fn vendor(vendor_id: u16) -> Self {
        Self::new(Some(vendor_id), None)
    }

    pub fn is_any(&self) -> bool {
        self.vendor_id.is_none() && self.product_id.is_none()
    }

    pub fn matches_ids(&self, vendor_id: u16, product_id: u16) -> bool {
        self.vendor_id.is_none_or(|v| v == vendor_id)
            && self.product_id.is_none_or(|p| p == product_id)
    }

    pub fn matches(&self, record: &DeviceRecord) -> bool {
        self.matches_ids(record.vendor_id, record.product_id)
    }

    /// Parse a `VID:PID` pattern such as `0x1234:0x5678`, `0x1234:*` or `*:*`
    ///
    /// A lone `*` matches every device.
    pub fn parse(pattern: &str) -> crate::Result<Self> {
        if pattern.trim() == "*" {
            return Ok(Self::any());
        }
        let parts: Vec<&str> = pattern.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(crate::Error::Config(format!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:*')",
                pattern
            )));
        }

        Ok(Self {
            vendor_id: parse_id_pattern(parts[0], "VID")?,
            product_id: parse_id_pattern(parts[1], "PID")?,
        })
    }
}

impl FromStr for DeviceFilter {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.vendor_id {
            Some(v) => write!(f, "{:#06x}", v)?,
            None => f.write_str("*")?,
        }
        f.write_str(":")?;
        match self.product_id {
            Some(p) => write!(f, "{:#06x}", p),
            None => f.write_str("*"),
        }
    }
}

fn parse_id_pattern(part: &str, name: &str) -> crate::Result<Option<u16>> {
    let part = part.trim();
    if part == "*" {
        return Ok(None);
    }
    parse_hex_id(part)
        .map(Some)
        .map_err(|reason| crate::Error::Config(format!("Invalid {} '{}': {}", name, part, reason)))
}

/// Parse a 16-bit hex id, with or without a `0x` prefix
pub fn parse_hex_id(id: &str) -> Result<u16, String> {
    let hex = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .unwrap_or(id);

    if hex.is_empty() || hex.len() > 4 {
        return Err("hex part must be 1-4 digits".to_string());
    }

    u16::from_str_radix(hex, 16).map_err(|_| "not a valid hex number".to_string())
}
