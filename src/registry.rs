//! The AF_CAN demultiplexer: per-device subscription buckets, the device
//! table, the notifier list, and the transmit helper that ties them
//! together.
//!
//! Grounded in `original_source/trunk/kernel/2.4/can/af_can.c`: `can_rx_register`/
//! `can_rx_unregister` build and tear down `dev_rcv_lists`, `can_rcv` walks
//! the six buckets in `find_rcv_list`'s order, and `can_send` performs
//! loopback before checking `IFF_UP`.

use crate::device::{DeviceEvent, DeviceId, NetDevice};
use crate::error::CoreError;
use crate::frame::CanFrame;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::constants::{EFF_FLAG, EFF_MASK, ERR_FLAG, INV_FILTER, SFF_MASK, SFF_TABLE_SIZE};

/// `DeviceId` reserved to mean "every device", mirroring ifindex 0.
pub const ANY_DEVICE: DeviceId = 0;

/// Opaque identity returned by [`CanCore::register`] and consumed by
/// [`CanCore::unregister`]. Equality for unregister is by cookie identity,
/// not by re-matching the original tuple.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Opaque identity for a device notifier registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

/// Identifies the socket that originated a transmitted frame, carried
/// alongside loopback deliveries so a socket can recognize and suppress its
/// own echo without punning a cookie into the frame payload.
pub type SocketId = u64;

fn next_id(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

/// A callback registered against `(device, can_id, mask)`. Receives the
/// device the frame actually arrived on (which may differ from the
/// subscription's own device when it was filed under the "all devices"
/// index), a frame cloned for this call alone, and the origin socket of a
/// loopback delivery (`None` for frames arriving from a device rather than
/// from a local send).
pub trait Handler: Send + Sync {
    fn handle(&self, device: DeviceId, frame: &CanFrame, origin: Option<SocketId>);
}

impl<F> Handler for F
where
    F: Fn(DeviceId, &CanFrame, Option<SocketId>) + Send + Sync,
{
    fn handle(&self, device: DeviceId, frame: &CanFrame, origin: Option<SocketId>) {
        (self)(device, frame, origin)
    }
}

struct Subscription {
    id: SubscriptionId,
    can_id: u32,
    mask: u32,
    handler: Arc<dyn Handler>,
}

/// One device's (or the pseudo-device's) six dispatch buckets, mirroring the
/// kernel's `dev_rcv_lists` layout exactly: an exact-match table for
/// standard ids, single buckets for extended/error/wildcard/inverted
/// matches, and a catch-all for everything else.
#[derive(Default)]
struct RxLists {
    rx_err: Vec<Subscription>,
    rx_all: Vec<Subscription>,
    rx_inv: Vec<Subscription>,
    rx_eff: Vec<Subscription>,
    rx_sff: Vec<Vec<Subscription>>,
    rx_fil: Vec<Subscription>,
    entries: usize,
}

impl RxLists {
    fn new() -> Self {
        let mut sff = Vec::with_capacity(SFF_TABLE_SIZE);
        sff.resize_with(SFF_TABLE_SIZE, Vec::new);
        RxLists {
            rx_sff: sff,
            ..Default::default()
        }
    }
}

/// Which bucket a normalized `(can_id, mask)` pair belongs in, matching
/// `af_can.c:find_rcv_list`'s classification order.
enum Bucket {
    Err,
    All,
    Inv,
    Eff,
    Sff(usize),
    Fil,
}

/// Normalizes `(can_id, mask)` in place and returns the bucket the pair
/// belongs in. ERR subscriptions skip `can_id` normalization
/// entirely, matching the kernel's early return for `mask & CAN_ERR_FLAG`.
fn classify(can_id: &mut u32, mask: &mut u32) -> Bucket {
    if *mask & ERR_FLAG != 0 {
        *mask &= EFF_MASK;
        return Bucket::Err;
    }

    let inverted = *can_id & INV_FILTER != 0;
    *can_id &= *mask;

    if *mask == 0 {
        return Bucket::All;
    }
    if inverted {
        return Bucket::Inv;
    }
    if *mask == (EFF_MASK | EFF_FLAG) {
        return Bucket::Eff;
    }
    if *mask == SFF_MASK {
        return Bucket::Sff((*can_id & SFF_MASK) as usize);
    }
    Bucket::Fil
}

struct Notifier {
    id: NotifierId,
    device: DeviceId,
    callback: Arc<dyn Fn(DeviceId, DeviceEvent) + Send + Sync>,
}

struct DeviceEntry {
    device: Arc<dyn NetDevice>,
    lists: RxLists,
}

/// The process-wide (but explicitly constructed) registry: the substitute
/// for the kernel module's global `dev_rcv_lists` table, device list and
/// notifier chain. Share via `Arc<CanCore>` between however many `RawSocket`
/// / `BcmSocket` handles a program opens; dropping the last `Arc` is the
/// Rust-native "module exit".
pub struct CanCore {
    devices: RwLock<HashMap<DeviceId, DeviceEntry>>,
    any: RwLock<RxLists>,
    notifiers: RwLock<Vec<Notifier>>,
    next_subscription: AtomicU64,
    next_notifier: AtomicU64,
    next_socket: AtomicU64,
}

impl CanCore {
    pub fn new() -> Arc<Self> {
        Arc::new(CanCore {
            devices: RwLock::new(HashMap::new()),
            any: RwLock::new(RxLists::new()),
            notifiers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            next_notifier: AtomicU64::new(1),
            next_socket: AtomicU64::new(1),
        })
    }

    /// Allocates a fresh [`SocketId`] for a `RawSocket`/`BcmSocket` to
    /// identify itself with on loopback deliveries.
    pub fn allocate_socket_id(&self) -> SocketId {
        next_id(&self.next_socket)
    }

    // ---- device lifecycle ----------------------------------------------

    pub fn register_device(&self, device: Arc<dyn NetDevice>) {
        let index = device.index();
        let mut devices = self.devices.write().unwrap();
        devices.insert(
            index,
            DeviceEntry {
                device,
                lists: RxLists::new(),
            },
        );
        drop(devices);
        debug!("device {} registered", index);
        self.notify(index, DeviceEvent::Register);
    }

    /// Unlinks a device and frees every subscription still present. No
    /// handler is invoked for the orphaned subscriptions: consumers are
    /// expected to unregister on their own teardown, but the registry never
    /// leaks regardless.
    pub fn unregister_device(&self, index: DeviceId) {
        let removed = self.devices.write().unwrap().remove(&index);
        if removed.is_some() {
            debug!("device {} unregistered", index);
            self.notify(index, DeviceEvent::Unregister);
        }
    }

    /// Total subscription count on `device`'s index, exposed for tests in
    /// sibling modules that can't reach into `RxLists` directly.
    #[cfg(test)]
    pub(crate) fn entries_for(&self, device: DeviceId) -> usize {
        self.devices
            .read()
            .unwrap()
            .get(&device)
            .map(|e| e.lists.entries)
            .unwrap_or(0)
    }

    pub fn device(&self, index: DeviceId) -> Option<Arc<dyn NetDevice>> {
        self.devices
            .read()
            .unwrap()
            .get(&index)
            .map(|e| e.device.clone())
    }

    /// Call after a driver flips its own up/down state, so notifiers fire.
    pub fn notify_device_state(&self, index: DeviceId, up: bool) {
        self.notify(index, if up { DeviceEvent::Up } else { DeviceEvent::Down });
    }

    fn notify(&self, index: DeviceId, event: DeviceEvent) {
        for n in self.notifiers.read().unwrap().iter() {
            if n.device == index || n.device == ANY_DEVICE {
                (n.callback)(index, event);
            }
        }
    }

    pub fn register_notifier(
        &self,
        device: DeviceId,
        callback: impl Fn(DeviceId, DeviceEvent) + Send + Sync + 'static,
    ) -> NotifierId {
        let id = NotifierId(next_id(&self.next_notifier));
        self.notifiers.write().unwrap().push(Notifier {
            id,
            device,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unregister_notifier(&self, id: NotifierId) {
        self.notifiers.write().unwrap().retain(|n| n.id != id);
    }

    // ---- subscriptions ---------------------------------------------------

    /// Registers `handler` against `(device, can_id, mask)`, normalizing the
    /// pair and filing it into the appropriate bucket. `device ==
    /// [`ANY_DEVICE`]` subscribes on the "all devices" pseudo-index.
    pub fn register(
        &self,
        device: DeviceId,
        can_id: u32,
        mask: u32,
        handler: Arc<dyn Handler>,
    ) -> Result<SubscriptionId, CoreError> {
        let id = SubscriptionId(next_id(&self.next_subscription));
        let mut can_id = can_id;
        let mut mask = mask;
        let bucket = classify(&mut can_id, &mut mask);
        let subscription = Subscription {
            id,
            can_id,
            mask,
            handler,
        };

        if device == ANY_DEVICE {
            let mut lists = self.any.write().unwrap();
            file_into(&mut lists, bucket, subscription);
        } else {
            let mut devices = self.devices.write().unwrap();
            let entry = devices.get_mut(&device).ok_or(CoreError::NoDevice)?;
            file_into(&mut entry.lists, bucket, subscription);
        }
        trace!(
            "registered subscription {:?} on device {} (id={:#x}, mask={:#x})",
            id,
            device,
            can_id,
            mask
        );
        Ok(id)
    }

    /// Removes the subscription identified by `id` from `device`'s index (or
    /// the "all devices" index). Looking in the wrong index, or an `id` that
    /// no longer exists, is [`CoreError::NotFound`].
    pub fn unregister(&self, device: DeviceId, id: SubscriptionId) -> Result<(), CoreError> {
        let removed = if device == ANY_DEVICE {
            remove_from(&mut self.any.write().unwrap(), id)
        } else {
            let mut devices = self.devices.write().unwrap();
            match devices.get_mut(&device) {
                Some(entry) => remove_from(&mut entry.lists, id),
                None => false,
            }
        };
        if removed {
            trace!("unregistered subscription {:?} on device {}", id, device);
            Ok(())
        } else {
            Err(CoreError::NotFound)
        }
    }

    /// Dispatches `frame`, arrived on `device`, to every matching
    /// subscription on the "all devices" index and then on `device`'s own
    /// index. Returns the number of handlers invoked. `origin` identifies a
    /// loopback delivery's originating socket, `None` for frames genuinely
    /// received from the wire.
    pub fn deliver(&self, device: DeviceId, frame: &CanFrame, origin: Option<SocketId>) -> usize {
        let mut count = 0;
        count += dispatch(&self.any.read().unwrap(), device, frame, origin);
        if device != ANY_DEVICE {
            let devices = self.devices.read().unwrap();
            if let Some(entry) = devices.get(&device) {
                count += dispatch(&entry.lists, device, frame, origin);
            }
        }
        count
    }

    /// Transmits `frame` out `device`. When `loopback` is requested and the
    /// device doesn't self-loop in hardware, a cloned copy is delivered to
    /// local listeners first (even if the device turns out to be down) tagged
    /// with `origin`, matching `can_send`'s actual ordering: loopback
    /// precedes the `IFF_UP` check rather than following it.
    pub fn send(
        &self,
        device: DeviceId,
        frame: &CanFrame,
        loopback: bool,
        origin: Option<SocketId>,
    ) -> Result<(), CoreError> {
        let dev = self.device(device).ok_or(CoreError::NoDevice)?;

        if loopback && !dev.is_self_loopback() {
            self.deliver(device, frame, origin);
        }

        if !dev.is_up() {
            warn!("transmit to down device {}", device);
            return Err(CoreError::DeviceDown);
        }

        dev.transmit(frame)
    }
}

fn file_into(lists: &mut RxLists, bucket: Bucket, subscription: Subscription) {
    lists.entries += 1;
    match bucket {
        Bucket::Err => lists.rx_err.push(subscription),
        Bucket::All => lists.rx_all.push(subscription),
        Bucket::Inv => lists.rx_inv.push(subscription),
        Bucket::Eff => lists.rx_eff.push(subscription),
        Bucket::Sff(slot) => lists.rx_sff[slot].push(subscription),
        Bucket::Fil => lists.rx_fil.push(subscription),
    }
}

fn remove_from(lists: &mut RxLists, id: SubscriptionId) -> bool {
    fn remove(v: &mut Vec<Subscription>, id: SubscriptionId) -> bool {
        if let Some(pos) = v.iter().position(|s| s.id == id) {
            v.remove(pos);
            true
        } else {
            false
        }
    }

    let found = remove(&mut lists.rx_err, id)
        || remove(&mut lists.rx_all, id)
        || remove(&mut lists.rx_inv, id)
        || remove(&mut lists.rx_eff, id)
        || remove(&mut lists.rx_fil, id)
        || lists.rx_sff.iter_mut().any(|slot| remove(slot, id));

    if found {
        lists.entries -= 1;
    }
    found
}

/// Walks the six buckets in `find_rcv_list`'s order and invokes every
/// matching handler with its own cloned frame.
fn dispatch(lists: &RxLists, device: DeviceId, frame: &CanFrame, origin: Option<SocketId>) -> usize {
    let mut count = 0;

    if frame.is_error() {
        for s in &lists.rx_err {
            if frame.raw_id() & s.mask != 0 {
                s.handler.handle(device, frame, origin);
                count += 1;
            }
        }
        return count;
    }

    for s in &lists.rx_all {
        s.handler.handle(device, frame, origin);
        count += 1;
    }

    for s in &lists.rx_fil {
        if (frame.raw_id() & s.mask) == s.can_id {
            s.handler.handle(device, frame, origin);
            count += 1;
        }
    }

    for s in &lists.rx_inv {
        if (frame.raw_id() & s.mask) != s.can_id {
            s.handler.handle(device, frame, origin);
            count += 1;
        }
    }

    if frame.is_extended() {
        for s in &lists.rx_eff {
            if frame.raw_id() == s.can_id {
                s.handler.handle(device, frame, origin);
                count += 1;
            }
        }
    } else {
        let slot = (frame.raw_id() & SFF_MASK) as usize;
        for s in &lists.rx_sff[slot] {
            s.handler.handle(device, frame, origin);
            count += 1;
        }
    }

    count
}
