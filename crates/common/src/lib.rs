//! Common utilities for usb-detection
//!
//! This crate provides the types shared between the detection core and the
//! command line tool: device records and filters, error handling, logging
//! setup and test helpers.

pub mod error;
pub mod logging;
pub mod record;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use record::{DeviceFilter, DeviceKey, DeviceRecord, DeviceRecordBuilder, parse_hex_id};
