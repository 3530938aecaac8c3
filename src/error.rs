//! The error taxonomy shared by the registry, RAW and BCM layers.

use thiserror::Error;

/// Conditions a caller can get back from a user-initiated operation.
///
/// Failures on async paths (timer expiry, inbound-frame processing) never
/// surface as a `CoreError` — there is no caller on the stack to hand it to
/// — they are logged and counted instead.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("subscription or operation not found")]
    NotFound,

    #[error("socket is not bound to a device")]
    NotBound,

    #[error("no such device")]
    NoDevice,

    #[error("allocation failed")]
    OutOfMemory,

    #[error("requested {requested} frame slots but only {allocated} were reserved at setup")]
    TooLarge { requested: usize, allocated: usize },

    #[error("device is administratively down")]
    DeviceDown,

    #[error("device transmit queue is full")]
    QueueFull,

    #[error("socket is already bound")]
    AlreadyBound,
}
