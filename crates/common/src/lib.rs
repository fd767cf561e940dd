//! Common utilities for fleet-netd
//!
//! This crate provides functionality shared between the daemon and the
//! privileged helper: USB device types and the fleet predicate, error
//! handling, logging setup, and test helpers.

pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{DeviceEvent, DeviceFilter, LanDevice, UsbDeviceInfo};
