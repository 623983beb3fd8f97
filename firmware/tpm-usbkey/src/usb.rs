//! USB identity provider.
//!
//! The bus itself is external; [`describe`] applies the descriptor policy:
//! one retry on an all-ones VID/PID, and a `"NoSerial"` fallback when the
//! serial string is missing, unreadable, empty, or too long.

use core::time::Duration;

use log::{debug, warn};

use crate::error::Result;
use crate::identity::{DeviceIdentity, NO_SERIAL};
use crate::nv::SERIAL_RECORD_SIZE;
use crate::platform::Platform;

/// US English string descriptor language
pub const LANG_ID_EN_US: u16 = 0x0409;

/// VID/PID reported by a device that has not answered yet
pub const INVALID_ID: u16 = 0xFFFF;

/// Opaque handle to an enumerated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbHandle(pub usize);

/// Fields of the standard device descriptor this crate uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// String index of the serial number, 0 if none
    pub serial_index: u8,
}

/// USB host controller access
pub trait UsbBus {
    fn enumerate(&mut self) -> Result<Vec<UsbHandle>>;

    fn device_descriptor(&mut self, handle: UsbHandle) -> Result<DeviceDescriptor>;

    fn string_descriptor(&mut self, handle: UsbHandle, index: u8, lang_id: u16) -> Result<String>;
}

impl<B: UsbBus + ?Sized> UsbBus for &mut B {
    fn enumerate(&mut self) -> Result<Vec<UsbHandle>> {
        (**self).enumerate()
    }

    fn device_descriptor(&mut self, handle: UsbHandle) -> Result<DeviceDescriptor> {
        (**self).device_descriptor(handle)
    }

    fn string_descriptor(&mut self, handle: UsbHandle, index: u8, lang_id: u16) -> Result<String> {
        (**self).string_descriptor(handle, index, lang_id)
    }
}

/// Fetch the identity tuple of one device
pub fn describe<B: UsbBus, P: Platform>(
    bus: &mut B,
    platform: &mut P,
    handle: UsbHandle,
    retry_delay: Duration,
) -> Result<DeviceIdentity> {
    let mut descriptor = bus.device_descriptor(handle)?;

    if descriptor.vendor_id == INVALID_ID || descriptor.product_id == INVALID_ID {
        debug!("device {:?} reported invalid VID/PID, retrying", handle);
        platform.stall(retry_delay);
        match bus.device_descriptor(handle) {
            Ok(retried) => descriptor = retried,
            Err(e) => warn!("descriptor retry for {:?} failed: {}", handle, e),
        }
    }

    let serial = read_serial(bus, handle, descriptor.serial_index);
    Ok(DeviceIdentity::new(descriptor.vendor_id, descriptor.product_id, &serial))
}

fn read_serial<B: UsbBus>(bus: &mut B, handle: UsbHandle, index: u8) -> String {
    if index == 0 {
        return NO_SERIAL.to_string();
    }
    match bus.string_descriptor(handle, index, LANG_ID_EN_US) {
        Ok(s) if !s.is_empty() && s.chars().count() < SERIAL_RECORD_SIZE => s,
        Ok(s) => {
            debug!("device {:?} serial of {} chars rejected", handle, s.chars().count());
            NO_SERIAL.to_string()
        }
        Err(e) => {
            warn!("serial string for {:?} unavailable: {}", handle, e);
            NO_SERIAL.to_string()
        }
    }
}
