//! RAW protocol: one subscription per user filter, a receive queue, and a
//! transmit pass-through, mirroring `raw_bind`/`raw_setsockopt(CAN_RAW_FILTER)`/
//! `raw_rcv`/`raw_sendmsg` from the kernel's CAN_RAW implementation as a
//! socket-shaped struct with `bind`/`send`/`recv` methods.

use crate::device::DeviceId;
use crate::error::CoreError;
use crate::frame::CanFrame;
use crate::registry::{CanCore, Handler, SocketId, SubscriptionId};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::debug;
use std::sync::{Arc, Mutex};

/// A single `(can_id, mask)` acceptance filter, as configured through
/// `CAN_RAW_FILTER`-style socket options.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFilter {
    pub can_id: u32,
    pub mask: u32,
}

impl CanFilter {
    pub fn new(can_id: u32, mask: u32) -> Self {
        CanFilter { can_id, mask }
    }
}

/// A frame that arrived on a `RawSocket`'s receive queue, tagged with the
/// device it actually arrived on (mirrors a `sockaddr_can`'s `can_ifindex`).
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    pub frame: CanFrame,
    pub device: DeviceId,
}

struct QueueHandler {
    sender: Sender<ReceivedFrame>,
}

impl Handler for QueueHandler {
    fn handle(&self, device: DeviceId, frame: &CanFrame, _origin: Option<SocketId>) {
        let _ = self.sender.send(ReceivedFrame {
            frame: *frame,
            device,
        });
    }
}

/// A thin per-socket layer over [`CanCore`]: bind to a device, install a
/// vector of filters (defaulting to a single wildcard when none are given),
/// and read matched frames off a queue. Changing filters atomically replaces
/// the old subscription set with the new one.
pub struct RawSocket {
    core: Arc<CanCore>,
    socket_id: SocketId,
    device: Mutex<Option<DeviceId>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    sender: Sender<ReceivedFrame>,
    receiver: Receiver<ReceivedFrame>,
}

impl RawSocket {
    pub fn new(core: Arc<CanCore>) -> Self {
        let (sender, receiver) = channel::unbounded();
        RawSocket {
            socket_id: core.allocate_socket_id(),
            core,
            device: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            sender,
            receiver,
        }
    }

    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    /// Binds to `device` and installs `filters` (or a single `(0,0)`
    /// wildcard if `filters` is empty), one subscription per filter.
    pub fn bind(&self, device: DeviceId, filters: &[CanFilter]) -> Result<(), CoreError> {
        let mut bound = self.device.lock().unwrap();
        if bound.is_some() {
            return Err(CoreError::AlreadyBound);
        }
        *bound = Some(device);
        drop(bound);

        self.install_filters(device, filters)?;
        debug!("raw socket bound to device {}", device);
        Ok(())
    }

    /// Atomically replaces the installed filter set with `filters`.
    pub fn set_filters(&self, filters: &[CanFilter]) -> Result<(), CoreError> {
        let device = self.device.lock().unwrap().ok_or(CoreError::NotBound)?;

        let old = {
            let mut subs = self.subscriptions.lock().unwrap();
            std::mem::take(&mut *subs)
        };
        for id in old {
            let _ = self.core.unregister(device, id);
        }

        self.install_filters(device, filters)
    }

    fn install_filters(&self, device: DeviceId, filters: &[CanFilter]) -> Result<(), CoreError> {
        let effective: Vec<CanFilter> = if filters.is_empty() {
            vec![CanFilter::new(0, 0)]
        } else {
            filters.to_vec()
        };

        let handler: Arc<dyn Handler> = Arc::new(QueueHandler {
            sender: self.sender.clone(),
        });

        let mut new_ids = Vec::with_capacity(effective.len());
        for filter in &effective {
            let id = self
                .core
                .register(device, filter.can_id, filter.mask, handler.clone())?;
            new_ids.push(id);
        }

        *self.subscriptions.lock().unwrap() = new_ids;
        Ok(())
    }

    /// Sends `frame` out the bound device, requesting loopback so local
    /// listeners (including this socket's own filters, unless it
    /// special-cases its own `socket_id`) observe it.
    pub fn send(&self, frame: &CanFrame) -> Result<(), CoreError> {
        let device = self.device.lock().unwrap().ok_or(CoreError::NotBound)?;
        self.core.send(device, frame, true, Some(self.socket_id))
    }

    /// Blocks until a frame is available.
    pub fn recv(&self) -> Result<ReceivedFrame, CoreError> {
        self.receiver.recv().map_err(|_| CoreError::NotBound)
    }

    /// Returns immediately with whatever is queued, if anything.
    pub fn try_recv(&self) -> Result<Option<ReceivedFrame>, CoreError> {
        match self.receiver.try_recv() {
            Ok(f) => Ok(Some(f)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CoreError::NotBound),
        }
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        if let Some(device) = *self.device.lock().unwrap() {
            let subs = self.subscriptions.lock().unwrap();
            for id in subs.iter() {
                let _ = self.core.unregister(device, *id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VirtualDevice;

    fn core_with_device(index: DeviceId) -> Arc<CanCore> {
        let core = CanCore::new();
        core.register_device(Arc::new(VirtualDevice::new(index, "vcan0")));
        core
    }

    #[test]
    fn raw_echo_scenario() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core);
        socket
            .bind(1, &[CanFilter::new(0x123, 0x7FF)])
            .unwrap();

        let frame = CanFrame::new(0x123, &[0xAB, 0xCD], false, false).unwrap();
        socket.send(&frame).unwrap();

        let received = socket.recv().unwrap();
        assert_eq!(received.frame, frame);
        assert_eq!(received.device, 1);
    }

    #[test]
    fn unmatched_frame_does_not_queue() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core.clone());
        socket
            .bind(1, &[CanFilter::new(0x123, 0x7FF)])
            .unwrap();

        let other = CanFrame::new(0x456, &[], false, false).unwrap();
        core.send(1, &other, true, None).unwrap();

        assert!(socket.try_recv().unwrap().is_none());
    }

    #[test]
    fn empty_filter_list_installs_wildcard() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core.clone());
        socket.bind(1, &[]).unwrap();

        let frame = CanFrame::new(0x7AB, &[], false, false).unwrap();
        core.send(1, &frame, true, None).unwrap();

        assert!(socket.try_recv().unwrap().is_some());
    }

    #[test]
    fn set_filters_replaces_old_set_atomically() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core.clone());
        socket
            .bind(1, &[CanFilter::new(0x100, 0x7FF)])
            .unwrap();

        socket
            .set_filters(&[CanFilter::new(0x200, 0x7FF)])
            .unwrap();

        let old = CanFrame::new(0x100, &[], false, false).unwrap();
        let new = CanFrame::new(0x200, &[], false, false).unwrap();
        core.send(1, &old, true, None).unwrap();
        core.send(1, &new, true, None).unwrap();

        let received = socket.try_recv().unwrap().expect("new filter matched");
        assert_eq!(received.frame, new);
        assert!(socket.try_recv().unwrap().is_none());
    }

    #[test]
    fn double_bind_is_already_bound() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core);
        socket.bind(1, &[]).unwrap();
        assert!(matches!(socket.bind(1, &[]), Err(CoreError::AlreadyBound)));
    }

    #[test]
    fn send_before_bind_is_not_bound() {
        let core = core_with_device(1);
        let socket = RawSocket::new(core);
        let frame = CanFrame::new(0x1, &[], false, false).unwrap();
        assert!(matches!(socket.send(&frame), Err(CoreError::NotBound)));
    }

    #[test]
    fn drop_unregisters_subscriptions() {
        let core = core_with_device(1);
        {
            let socket = RawSocket::new(core.clone());
            socket
                .bind(1, &[CanFilter::new(0x123, 0x7FF)])
                .unwrap();
        }
        assert_eq!(core.entries_for(1), 0);
    }
}
