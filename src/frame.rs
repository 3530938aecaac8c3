//! The CAN frame type shared by every protocol layer.

use crate::constants::{DLC_MASK, EFF_FLAG, EFF_MASK, ERR_FLAG, ERR_MASK, RTR_FLAG, SFF_MASK};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor};
use thiserror::Error;

/// A CAN frame could not be constructed from the given id/data.
#[derive(Debug, Copy, Clone, Error)]
pub enum FrameError {
    #[error("CAN ID too large for the requested frame format")]
    IdTooLarge,
    #[error("payload is larger than the CAN maximum of 8 bytes")]
    TooMuchData,
}

/// A single CAN frame: an identifier, flags folded into that identifier,
/// and up to 8 bytes of payload.
///
/// Mirrors `struct can_frame` from the Linux ABI closely enough that
/// [`CanFrame::to_wire`]/[`CanFrame::from_wire`] round-trip against it, but
/// is an owned, `Copy` Rust value rather than a `repr(C)` layout pinned to a
/// particular in-memory shape.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Builds a data frame. `id` may be a standard (<=`SFF_MASK`) or
    /// extended identifier; the extended flag is set automatically when
    /// `id` doesn't fit in 11 bits.
    pub fn new(id: u32, data: &[u8], rtr: bool, err: bool) -> Result<Self, FrameError> {
        if data.len() > 8 {
            return Err(FrameError::TooMuchData);
        }

        let mut full_id = id;
        if id > SFF_MASK {
            if id > EFF_MASK {
                return Err(FrameError::IdTooLarge);
            }
            full_id |= EFF_FLAG;
        }
        if rtr {
            full_id |= RTR_FLAG;
        }
        if err {
            full_id |= ERR_FLAG;
        }

        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);

        Ok(CanFrame {
            id: full_id,
            dlc: data.len() as u8,
            data: buf,
        })
    }

    /// The identifier plus flag bits exactly as they'd appear on the wire.
    pub fn raw_id(&self) -> u32 {
        self.id
    }

    /// The identifier with flag bits masked out.
    pub fn id(&self) -> u32 {
        if self.is_extended() {
            self.id & EFF_MASK
        } else {
            self.id & SFF_MASK
        }
    }

    /// The error class/info word, valid only when [`CanFrame::is_error`].
    pub fn err(&self) -> u32 {
        self.id & ERR_MASK
    }

    pub fn is_extended(&self) -> bool {
        self.id & EFF_FLAG != 0
    }

    pub fn is_rtr(&self) -> bool {
        self.id & RTR_FLAG != 0
    }

    pub fn is_error(&self) -> bool {
        self.id & ERR_FLAG != 0
    }

    pub fn dlc(&self) -> u8 {
        self.dlc & DLC_MASK
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc() as usize]
    }

    /// Overwrites the identifier field verbatim, flags included. Used by the
    /// Broadcast Manager's `TX_CP_CAN_ID`, which copies a `bcm_op`'s header
    /// `can_id` into every frame it carries exactly as given.
    pub(crate) fn set_raw_id(&mut self, raw_id: u32) {
        self.id = raw_id;
    }

    /// Clears the RTR bit, keeping every other flag and the identifier.
    pub(crate) fn clear_rtr(&mut self) {
        self.id &= !RTR_FLAG;
    }

    /// The 8 payload bytes read as a single big-endian integer, used by the
    /// Broadcast Manager's care-mask and multiplex comparisons. Unused
    /// trailing bytes (beyond `dlc()`) are zero and therefore never
    /// contribute a spurious difference.
    pub fn data64(&self) -> u64 {
        u64::from_be_bytes(self.data)
    }

    /// Serializes this frame the way it appears embedded in a BCM record:
    /// 4-byte id, 1-byte dlc, 3 bytes padding, 8 bytes of data.
    pub fn to_wire(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.id)?;
        out.write_u8(self.dlc())?;
        out.write_all(&[0u8; 3])?;
        out.write_all(&self.data)?;
        Ok(())
    }

    pub fn from_wire(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let id = cur.read_u32::<LittleEndian>()?;
        let dlc = cur.read_u8()? & DLC_MASK;
        let mut pad = [0u8; 3];
        cur.read_exact(&mut pad)?;
        let mut data = [0u8; 8];
        cur.read_exact(&mut data)?;
        Ok(CanFrame { id, dlc, data })
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}#{}", self.raw_id(), hex::encode_upper(self.data()))
    }
}

use std::io::Read;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_id_roundtrips() {
        let f = CanFrame::new(0x123, &[1, 2, 3], false, false).unwrap();
        assert_eq!(f.id(), 0x123);
        assert!(!f.is_extended());
        assert_eq!(f.data(), &[1, 2, 3]);
    }

    #[test]
    fn large_id_becomes_extended() {
        let f = CanFrame::new(0x1ABCDEF, &[], false, false).unwrap();
        assert!(f.is_extended());
        assert_eq!(f.id(), 0x1ABCDEF);
    }

    #[test]
    fn id_over_eff_mask_rejected() {
        assert!(matches!(
            CanFrame::new(EFF_MASK + 1, &[], false, false),
            Err(FrameError::IdTooLarge)
        ));
    }

    #[test]
    fn too_much_data_rejected() {
        assert!(matches!(
            CanFrame::new(1, &[0; 9], false, false),
            Err(FrameError::TooMuchData)
        ));
    }

    #[test]
    fn wire_roundtrip_preserves_id_and_data() {
        let f = CanFrame::new(0x7ff, &[9, 8, 7], false, false).unwrap();
        let mut buf = Vec::new();
        f.to_wire(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf[..]);
        let back = CanFrame::from_wire(&mut cur).unwrap();
        assert_eq!(f, back);
    }

    #[test]
    fn data64_zero_pads_short_frames() {
        let short = CanFrame::new(1, &[0xff], false, false).unwrap();
        assert_eq!(short.data64(), 0xff00_0000_0000_0000);
    }
}
