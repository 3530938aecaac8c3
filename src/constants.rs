//! Wire-stable numeric constants for CAN identifiers and BCM messages.
//!
//! Values match the Linux SocketCAN ABI so that frames and BCM records
//! produced here line up byte-for-byte with anything that speaks the same
//! protocol.

/// Frame uses a 29-bit extended identifier instead of an 11-bit one.
pub const EFF_FLAG: u32 = 0x8000_0000;
/// Frame is a remote transmission request.
pub const RTR_FLAG: u32 = 0x4000_0000;
/// Frame carries error information rather than payload data.
pub const ERR_FLAG: u32 = 0x2000_0000;

/// Reused as a filter-only bit: set in a *subscription's* `can_id`, it
/// inverts the match to not-equal. Numerically aliases `ERR_FLAG` rather
/// than `RTR_FLAG`: `ERR_FLAG` is only ever read out of `mask`, never out of
/// `can_id`, so sharing its value with a `can_id` bit is safe, whereas
/// `RTR_FLAG` lives in `can_id` itself and a BCM RX_RTR_FRAME registration
/// needs to set it there without being reclassified as inverted.
pub const INV_FILTER: u32 = ERR_FLAG;

/// Mask of the 11 significant bits of a standard identifier.
pub const SFF_MASK: u32 = 0x0000_07ff;
/// Mask of the 29 significant bits of an extended identifier.
pub const EFF_MASK: u32 = 0x1fff_ffff;
/// Mask of the 29 significant bits of an error class/info word.
pub const ERR_MASK: u32 = 0x1fff_ffff;

/// Number of distinct standard (11-bit) identifiers, and thus the size of
/// the direct-indexed `rx_sff` bucket table.
pub const SFF_TABLE_SIZE: usize = (SFF_MASK as usize) + 1;

/// Mask for the "real" DLC bits once private cache-state bits are stripped.
pub const DLC_MASK: u8 = 0x0f;

/// Bits the Broadcast Manager keeps verbatim when it derives a subscription
/// filter from a `bcm_op`'s `can_id`. Mirrors the kernel's literal
/// `BCM_RX_REGMASK = CAN_EFF_MASK | CAN_EFF_FLAG | CAN_RTR_FLAG`: every BCM
/// RX registration filters on the full id (standard or extended) and on the
/// RTR bit, landing in the registry's generic filter bucket rather than the
/// direct-indexed SFF/EFF buckets a mask-only-EFF_MASK subscription would.
pub const BCM_RX_REGMASK: u32 = EFF_MASK | EFF_FLAG | RTR_FLAG;

pub mod bcm_opcode {
    pub const TX_SETUP: u32 = 1;
    pub const TX_DELETE: u32 = 2;
    pub const TX_READ: u32 = 3;
    pub const TX_SEND: u32 = 4;
    pub const TX_STATUS: u32 = 5;
    pub const TX_EXPIRED: u32 = 6;
    pub const RX_SETUP: u32 = 7;
    pub const RX_DELETE: u32 = 8;
    pub const RX_READ: u32 = 9;
    pub const RX_STATUS: u32 = 10;
    pub const RX_CHANGED: u32 = 11;
    pub const RX_TIMEOUT: u32 = 12;
}

pub mod bcm_flag {
    pub const SETTIMER: u32 = 0x0001;
    pub const STARTTIMER: u32 = 0x0002;
    pub const TX_COUNTEVT: u32 = 0x0004;
    pub const TX_ANNOUNCE: u32 = 0x0008;
    pub const TX_CP_CAN_ID: u32 = 0x0010;
    pub const RX_FILTER_ID: u32 = 0x0020;
    pub const RX_CHECK_DLC: u32 = 0x0040;
    pub const RX_NO_AUTOTIMER: u32 = 0x0080;
    pub const RX_ANNOUNCE_RESUME: u32 = 0x0100;
    pub const TX_RESET_MULTI_IDX: u32 = 0x0200;
    pub const RX_RTR_FRAME: u32 = 0x0400;
}
