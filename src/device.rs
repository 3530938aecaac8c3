//! The boundary between the protocol core and whatever actually moves
//! frames onto a bus. Real drivers, bit-timing and hardware are out of
//! scope here; [`NetDevice`] is the seam a driver crate would implement.

use crate::error::CoreError;
use crate::frame::CanFrame;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Stands in for the kernel's `ifindex`. `0` is reserved to mean "no
/// specific device" (the "all devices" pseudo-scope), matching the
/// convention of ifindex 0 never naming a real interface.
pub type DeviceId = u32;

/// Lifecycle transitions the core needs to react to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Register,
    Unregister,
    Up,
    Down,
}

/// A transmit/administrative-state seam a backing CAN interface implements.
///
/// Receiving is not part of this trait: a device pushes inbound frames into
/// the core by calling [`crate::registry::CanCore::deliver`] itself (from
/// whatever interrupt handler, poll loop or channel reader it uses), the
/// same way a kernel driver calls `netif_rx`.
pub trait NetDevice: Send + Sync {
    fn index(&self) -> DeviceId;
    fn name(&self) -> &str;
    fn is_up(&self) -> bool;

    /// Whether the device itself echoes transmitted frames back to local
    /// listeners (some CAN controllers do this in hardware). When false,
    /// the core performs software loopback instead.
    fn is_self_loopback(&self) -> bool {
        false
    }

    fn transmit(&self, frame: &CanFrame) -> Result<(), CoreError>;
}

/// An in-memory [`NetDevice`] used by tests and examples in place of a real
/// interface (vcan's role in the original kernel subsystem).
pub struct VirtualDevice {
    index: DeviceId,
    name: String,
    up: AtomicBool,
    self_loopback: bool,
    sent: Mutex<Vec<CanFrame>>,
    queue_capacity: usize,
}

impl VirtualDevice {
    pub fn new(index: DeviceId, name: impl Into<String>) -> Self {
        VirtualDevice {
            index,
            name: name.into(),
            up: AtomicBool::new(true),
            self_loopback: false,
            sent: Mutex::new(Vec::new()),
            queue_capacity: usize::MAX,
        }
    }

    pub fn with_self_loopback(mut self, value: bool) -> Self {
        self.self_loopback = value;
        self
    }

    /// Caps how many frames `transmit` will accept before returning
    /// `QueueFull`, for exercising that error path in tests.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().unwrap().clone()
    }
}

impl NetDevice for VirtualDevice {
    fn index(&self) -> DeviceId {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn is_self_loopback(&self) -> bool {
        self.self_loopback
    }

    fn transmit(&self, frame: &CanFrame) -> Result<(), CoreError> {
        let mut sent = self.sent.lock().unwrap();
        if sent.len() >= self.queue_capacity {
            return Err(CoreError::QueueFull);
        }
        sent.push(*frame);
        Ok(())
    }
}
