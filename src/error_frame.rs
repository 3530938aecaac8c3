//! Decoding of ERR-flagged frames into concrete bus conditions.
//!
//! information from https://raw.githubusercontent.com/torvalds/linux/master/
//!                  /include/uapi/linux/can/error.h

use crate::frame::CanFrame;
use std::convert::TryFrom;
use thiserror::Error;

#[derive(Copy, Clone, Debug, Error)]
pub enum ErrorFrameDecodeError {
    #[error("frame does not carry the ERR flag")]
    NotAnError,
    #[error("unknown error class {0:#010x}")]
    UnknownErrorType(u32),
    #[error("not enough payload bytes to decode byte {0}")]
    NotEnoughData(u8),
    #[error("unrecognized controller-problem byte")]
    InvalidControllerProblem,
    #[error("unrecognized protocol-violation type byte")]
    InvalidViolationType,
    #[error("unrecognized protocol-violation location byte")]
    InvalidLocation,
}

fn get_data(frame: &CanFrame, idx: u8) -> Result<u8, ErrorFrameDecodeError> {
    frame
        .data()
        .get(idx as usize)
        .copied()
        .ok_or(ErrorFrameDecodeError::NotEnoughData(idx))
}

#[derive(Copy, Clone, Debug)]
pub enum BusError {
    TransmitTimeout,
    /// Arbitration was lost; carries the bit position, or 0 if unspecified.
    LostArbitration(u8),
    ControllerProblem(ControllerProblem),
    ProtocolViolation { vtype: ViolationType, location: Location },
    TransceiverError,
    NoAck,
    BusOff,
    BusError,
    Restarted,
}

#[derive(Copy, Clone, Debug)]
pub enum ControllerProblem {
    Unspecified,
    ReceiveBufferOverflow,
    TransmitBufferOverflow,
    ReceiveErrorWarning,
    TransmitErrorWarning,
    ReceiveErrorPassive,
    TransmitErrorPassive,
    Active,
}

impl TryFrom<u8> for ControllerProblem {
    type Error = ErrorFrameDecodeError;
    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0x00 => ControllerProblem::Unspecified,
            0x01 => ControllerProblem::ReceiveBufferOverflow,
            0x02 => ControllerProblem::TransmitBufferOverflow,
            0x04 => ControllerProblem::ReceiveErrorWarning,
            0x08 => ControllerProblem::TransmitErrorWarning,
            0x10 => ControllerProblem::ReceiveErrorPassive,
            0x20 => ControllerProblem::TransmitErrorPassive,
            0x40 => ControllerProblem::Active,
            _ => return Err(ErrorFrameDecodeError::InvalidControllerProblem),
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub enum ViolationType {
    Unspecified,
    SingleBitError,
    FrameFormatError,
    BitStuffingError,
    UnableToSendDominantBit,
    UnableToSendRecessiveBit,
    BusOverload,
    Active,
    TransmissionError,
}

impl TryFrom<u8> for ViolationType {
    type Error = ErrorFrameDecodeError;
    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0x00 => ViolationType::Unspecified,
            0x01 => ViolationType::SingleBitError,
            0x02 => ViolationType::FrameFormatError,
            0x04 => ViolationType::BitStuffingError,
            0x08 => ViolationType::UnableToSendDominantBit,
            0x10 => ViolationType::UnableToSendRecessiveBit,
            0x20 => ViolationType::BusOverload,
            0x40 => ViolationType::Active,
            0x80 => ViolationType::TransmissionError,
            _ => return Err(ErrorFrameDecodeError::InvalidViolationType),
        })
    }
}

/// Where inside a received frame a protocol violation occurred.
#[derive(Copy, Clone, Debug)]
pub enum Location {
    Unspecified,
    StartOfFrame,
    Id2821,
    Id2018,
    SubstituteRtr,
    IdentifierExtension,
    Id1713,
    Id1205,
    Id0400,
    Rtr,
    Reserved1,
    Reserved0,
    DataLengthCode,
    DataSection,
    CrcSequence,
    CrcDelimiter,
    AckSlot,
    AckDelimiter,
    EndOfFrame,
    Intermission,
}

impl TryFrom<u8> for Location {
    type Error = ErrorFrameDecodeError;
    fn try_from(val: u8) -> Result<Self, Self::Error> {
        Ok(match val {
            0x00 => Location::Unspecified,
            0x03 => Location::StartOfFrame,
            0x02 => Location::Id2821,
            0x06 => Location::Id2018,
            0x04 => Location::SubstituteRtr,
            0x05 => Location::IdentifierExtension,
            0x07 => Location::Id1713,
            0x0F => Location::Id1205,
            0x0E => Location::Id0400,
            0x0C => Location::Rtr,
            0x0D => Location::Reserved1,
            0x09 => Location::Reserved0,
            0x0B => Location::DataLengthCode,
            0x0A => Location::DataSection,
            0x08 => Location::CrcSequence,
            0x18 => Location::CrcDelimiter,
            0x19 => Location::AckSlot,
            0x1B => Location::AckDelimiter,
            0x1A => Location::EndOfFrame,
            0x12 => Location::Intermission,
            _ => return Err(ErrorFrameDecodeError::InvalidLocation),
        })
    }
}

impl BusError {
    pub fn from_frame(frame: &CanFrame) -> Result<BusError, ErrorFrameDecodeError> {
        if !frame.is_error() {
            return Err(ErrorFrameDecodeError::NotAnError);
        }

        match frame.err() {
            0x0000_0001 => Ok(BusError::TransmitTimeout),
            0x0000_0002 => Ok(BusError::LostArbitration(get_data(frame, 0)?)),
            0x0000_0004 => Ok(BusError::ControllerProblem(ControllerProblem::try_from(
                get_data(frame, 1)?,
            )?)),
            0x0000_0008 => Ok(BusError::ProtocolViolation {
                vtype: ViolationType::try_from(get_data(frame, 2)?)?,
                location: Location::try_from(get_data(frame, 3)?)?,
            }),
            0x0000_0010 => Ok(BusError::TransceiverError),
            0x0000_0020 => Ok(BusError::NoAck),
            0x0000_0040 => Ok(BusError::BusOff),
            0x0000_0080 => Ok(BusError::BusError),
            0x0000_0100 => Ok(BusError::Restarted),
            other => Err(ErrorFrameDecodeError::UnknownErrorType(other)),
        }
    }
}
