//! Process-wide exclusivity for the microphone and the speaker.

use crate::error::{ReflectaError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

static MICROPHONE: AtomicBool = AtomicBool::new(false);
static SPEAKER: AtomicBool = AtomicBool::new(false);

/// The exclusive audio devices a pipeline can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Microphone,
    Speaker,
}

impl Device {
    fn flag(self) -> &'static AtomicBool {
        match self {
            Device::Microphone => &MICROPHONE,
            Device::Speaker => &SPEAKER,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Device::Microphone => "microphone",
            Device::Speaker => "speaker",
        }
    }
}

/// Held while a pipeline owns a device; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    device: Device,
}

impl DeviceLease {
    /// Claim `device` for this process.
    ///
    /// # Errors
    /// Returns `ReflectaError::AudioDeviceBusy` if another pipeline holds it.
    pub fn acquire(device: Device) -> Result<Self> {
        device
            .flag()
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ReflectaError::AudioDeviceBusy {
                device: device.label().to_string(),
            })?;
        Ok(Self { device })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Whether any pipeline currently holds `device`.
    pub fn is_held(device: Device) -> bool {
        device.flag().load(Ordering::Acquire)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.device.flag().store(false, Ordering::Release);
    }
}
