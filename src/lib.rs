//! An in-process CAN protocol family core.
//!
//! This crate is the demultiplexer a kernel's AF_CAN module provides,
//! rebuilt as a library a process embeds directly: a process-wide (but
//! explicitly constructed) registry of `(device, can_id, mask) → handler`
//! subscriptions, a thin RAW protocol layer built on top of it, and a
//! Broadcast Manager engine driving periodic transmission and
//! change-detecting, throttled, timeout-supervised reception.
//!
//! # An introduction to CAN
//!
//! The CAN bus was originally designed to allow microcontrollers inside a
//! vehicle to communicate over a single shared bus. Messages called
//! *frames* are multicast to all devices on the bus.
//!
//! Every frame consists of an ID and a payload of up to 8 bytes. If two
//! devices attempt to send a frame at the same time, the device with the
//! higher ID will notice the conflict, stop sending and reattempt to send
//! its frame in the next time slot. This means the lower the ID, the higher
//! the priority.
//!
//! # Where the hardware goes
//!
//! Real interfaces (SJA1000, MSCAN, Kvaser, vcan) are out of scope here;
//! [`device::NetDevice`] is the seam a driver crate implements. Tests and
//! examples use [`device::VirtualDevice`] in their place.
//!
//! # Layout
//!
//! - [`registry`] — the AF_CAN-style subscription registry and transmit
//!   helper ([`registry::CanCore`]).
//! - [`raw`] — a thin per-socket layer over the registry
//!   ([`raw::RawSocket`]).
//! - [`bcm`] — the Broadcast Manager engine ([`bcm::BcmSocket`]).
//! - [`frame`] — the shared [`frame::CanFrame`] type.
//! - [`error_frame`] — decoding of ERR-flagged frames into concrete
//!   conditions.
//! - [`device`] — the driver-facing seam.
//! - [`error`] — the [`error::CoreError`] taxonomy shared by every layer.

pub mod bcm;
pub mod constants;
pub mod device;
pub mod error;
pub mod error_frame;
pub mod frame;
pub mod logging;
pub mod raw;
pub mod registry;
mod timer;

pub use bcm::{BcmMessage, BcmSocket};
pub use device::{DeviceEvent, DeviceId, NetDevice, VirtualDevice};
pub use error::CoreError;
pub use frame::CanFrame;
pub use raw::{CanFilter, RawSocket, ReceivedFrame};
pub use registry::{CanCore, Handler, NotifierId, SubscriptionId};
