//! Execution targets: a (device, queue) pair every operator call resolves
//! against before deciding between its accelerated path and its
//! decomposition.

use std::fmt;

use parking_lot::RwLock;

use crate::device::Device;

/// A (device, queue) execution target.
///
/// Ordering within one stream is FIFO; that is the only ordering guarantee
/// graph construction relies on. Streams are cheap copyable values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub device: Device,
    pub index: usize,
}

impl Stream {
    /// The default queue on the given device.
    pub fn new(device: Device) -> Self {
        Self { device, index: 0 }
    }

    /// A specific queue on the given device.
    pub fn with_index(device: Device, index: usize) -> Self {
        Self { device, index }
    }
}

impl From<Device> for Stream {
    fn from(device: Device) -> Self {
        Stream::new(device)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream({}, {})", self.device, self.index)
    }
}

static DEFAULT_DEVICE: RwLock<Device> = RwLock::new(Device::Cpu);

/// The process-wide default stream (default queue on the default device).
pub fn default_stream() -> Stream {
    Stream::new(*DEFAULT_DEVICE.read())
}

/// Change the process-wide default device.
///
/// Returns the previous default.
pub fn set_default_device(device: Device) -> Device {
    std::mem::replace(&mut *DEFAULT_DEVICE.write(), device)
}

/// Resolve an optional trailing stream argument to a concrete stream.
pub fn to_stream(s: Option<Stream>) -> Stream {
    s.unwrap_or_else(default_stream)
}
