//! Human and JSON rendering of devices and hot-plug events

use common::DeviceRecord;
use detection::NotificationKind;
use serde::Serialize;

#[derive(Serialize)]
struct DeviceLine<'a> {
    key: &'a str,
    #[serde(flatten)]
    device: &'a DeviceRecord,
}

#[derive(Serialize)]
struct EventLine<'a> {
    event: &'static str,
    key: &'a str,
    #[serde(flatten)]
    device: &'a DeviceRecord,
}

pub fn event_name(kind: NotificationKind) -> &'static str {
    match kind {
        NotificationKind::Added => "add",
        NotificationKind::Removed => "remove",
    }
}

/// Multi-line listing entry for one device
pub fn device_block(device: &DeviceRecord) -> String {
    let mut block = format!(
        "  [{}] {:04x}:{:04x} - {} {}\n      Location 0x{:08x} Address {:03}",
        device.key(),
        device.vendor_id(),
        device.product_id(),
        or_unknown(device.manufacturer(), "Unknown Manufacturer"),
        or_unknown(device.device_name(), "Unknown Product"),
        device.location_id(),
        device.device_address()
    );
    if !device.serial_number().is_empty() {
        block.push_str(&format!("\n      Serial: {}", device.serial_number()));
    }
    block
}

/// One-line hot-plug event
pub fn event_line(kind: NotificationKind, device: &DeviceRecord) -> String {
    format!(
        "{:<6} [{}] {:04x}:{:04x} {} {}",
        event_name(kind),
        device.key(),
        device.vendor_id(),
        device.product_id(),
        or_unknown(device.manufacturer(), "Unknown Manufacturer"),
        or_unknown(device.device_name(), "Unknown Product")
    )
}

pub fn device_json(device: &DeviceRecord) -> serde_json::Result<String> {
    serde_json::to_string(&DeviceLine {
        key: device.key().as_str(),
        device,
    })
}

pub fn devices_json(devices: &[DeviceRecord]) -> serde_json::Result<String> {
    let lines: Vec<DeviceLine<'_>> = devices
        .iter()
        .map(|device| DeviceLine {
            key: device.key().as_str(),
            device,
        })
        .collect();
    serde_json::to_string_pretty(&lines)
}

pub fn event_json(kind: NotificationKind, device: &DeviceRecord) -> serde_json::Result<String> {
    serde_json::to_string(&EventLine {
        event: event_name(kind),
        key: device.key().as_str(),
        device,
    })
}

fn or_unknown<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() { fallback } else { value }
}
