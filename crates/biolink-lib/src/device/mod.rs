//! Contract every acquisition device binding satisfies.
//!
//! A device is opened by address, started with a sample rate and channel
//! mask, then `run` blocks and hands each frame to the callback until the
//! callback asks to stop.

mod synthetic;

pub use synthetic::SyntheticDevice;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Address that selects the built-in synthetic waveform device.
pub const SYNTHETIC_ADDRESS: &str = "synthetic";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot open device '{address}': {reason}")]
    Open { address: String, reason: String },
    #[error("cannot start acquisition: {0}")]
    Start(String),
    #[error("acquisition failed: {0}")]
    Acquisition(String),
    #[error("battery query failed: {0}")]
    Battery(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatteryLevel {
    Percent(f32),
    Charging,
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatteryLevel::Percent(p) => write!(f, "{:.0} %", p),
            BatteryLevel::Charging => write!(f, "charging"),
        }
    }
}

/// Callback receiving `(frame_index, values)`; returning `true` ends `run`.
pub type SampleCallback<'a> = dyn FnMut(u64, &[u16]) -> bool + 'a;

/// Aborts a running acquisition and frees the device, from any thread.
pub type ReleaseHandle = Arc<dyn Fn() + Send + Sync>;

pub trait AcquisitionDevice: Send {
    fn address(&self) -> &str;

    /// Human readable description of the opened device.
    fn properties(&self) -> String;

    fn start(&mut self, sample_rate: u32, channel_mask: u8, bit_width: u8)
        -> Result<(), DeviceError>;

    /// Blocks, delivering frames until the callback returns `true` or the
    /// device fails.
    fn run(&mut self, on_sample: &mut SampleCallback<'_>) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self);

    /// Handle that makes a blocked `run` return and releases the device
    /// without the acquisition thread's help. Used when a run is forced to
    /// end; the device is not usable afterwards.
    fn release_handle(&self) -> ReleaseHandle;

    fn battery(&self) -> Result<BatteryLevel, DeviceError>;
}

/// Open the device behind `address`.
///
/// Only the synthetic device ships in-tree; hardware bindings implement
/// [`AcquisitionDevice`] out of tree.
pub fn open(address: &str) -> Result<Box<dyn AcquisitionDevice>, DeviceError> {
    if address.eq_ignore_ascii_case(SYNTHETIC_ADDRESS) {
        return Ok(Box::new(SyntheticDevice::new()));
    }
    Err(DeviceError::Open {
        address: address.to_string(),
        reason: "no driver binding available for this address".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_synthetic_by_reserved_address() {
        let device = open("SYNTHETIC").unwrap();
        assert_eq!(device.address(), SYNTHETIC_ADDRESS);
    }

    #[test]
    fn unknown_address_fails_before_acquisition() {
        let err = open("00:07:80:79:6F:E0").err().unwrap();
        assert!(matches!(err, DeviceError::Open { .. }));
    }

    #[test]
    fn battery_formats_like_the_device_panel() {
        assert_eq!(BatteryLevel::Percent(84.6).to_string(), "85 %");
        assert_eq!(BatteryLevel::Charging.to_string(), "charging");
    }
}
