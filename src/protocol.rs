use crate::{error::DecodeError, types::Session};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Session record size in bytes
pub const SESSION_RECORD_SIZE: usize = 12;

/// Control frame size in bytes
pub const CONTROL_FRAME_SIZE: usize = 1;

/// Time-sync payload size in bytes
pub const TIME_PAYLOAD_SIZE: usize = 4;

/// Control byte the tracker sends once every stored session has been delivered
pub const STREAM_COMPLETE: u8 = 0xFF;

/// Acknowledgement byte written after each received session record
pub const ACK: u8 = 0x01;

/// Out-of-band signal carried in a single-byte notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// No sessions left on the tracker
    StreamComplete,
    /// Reserved control value, ignored
    Unrecognized(u8),
}

/// Classified notification received on the session-data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Single-byte control frame
    Control(Control),
    /// Decoded session record
    Session(Session),
}

impl Frame {
    /// Classify and decode a notification payload
    ///
    /// Single-byte frames are always control frames; 12-byte frames are
    /// session records. Every other length is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidLength`] for unsupported lengths and
    /// [`DecodeError::InvalidInterval`] for records whose stop precedes start.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        match data.len() {
            CONTROL_FRAME_SIZE => decode_control(data).map(Self::Control),
            SESSION_RECORD_SIZE => decode_session(data).map(Self::Session),
            actual => Err(DecodeError::InvalidLength {
                expected: SESSION_RECORD_SIZE,
                actual,
            }),
        }
    }
}

/// Decode a 12-byte session record
///
/// Record layout (big-endian, fixed by the tracker firmware):
/// - Bytes 0-3: start (u32 epoch seconds)
/// - Bytes 4-7: stop (u32 epoch seconds)
/// - Bytes 8-11: steps (u32)
///
/// # Errors
///
/// Returns [`DecodeError::InvalidLength`] unless exactly 12 bytes are given,
/// and [`DecodeError::InvalidInterval`] if stop is before start.
pub fn decode_session(data: &[u8]) -> Result<Session, DecodeError> {
    if data.len() != SESSION_RECORD_SIZE {
        return Err(DecodeError::InvalidLength {
            expected: SESSION_RECORD_SIZE,
            actual: data.len(),
        });
    }

    let mut buf = data;
    let start = buf.get_u32();
    let stop = buf.get_u32();
    let steps = buf.get_u32();

    if stop < start {
        return Err(DecodeError::InvalidInterval { start, stop });
    }

    Ok(Session::new(start, stop, steps))
}

/// Encode a session record in the tracker's wire format
///
/// The phone never sends records; this exists for simulated trackers.
#[must_use]
pub fn encode_session(session: &Session) -> Bytes {
    let mut buf = BytesMut::with_capacity(SESSION_RECORD_SIZE);
    buf.put_u32(session.start);
    buf.put_u32(session.stop);
    buf.put_u32(session.steps);
    buf.freeze()
}

/// Decode a single-byte control frame
///
/// # Errors
///
/// Returns [`DecodeError::InvalidLength`] unless exactly one byte is given.
pub fn decode_control(data: &[u8]) -> Result<Control, DecodeError> {
    match data {
        [STREAM_COMPLETE] => Ok(Control::StreamComplete),
        [other] => Ok(Control::Unrecognized(*other)),
        _ => Err(DecodeError::InvalidLength {
            expected: CONTROL_FRAME_SIZE,
            actual: data.len(),
        }),
    }
}

/// Acknowledgement frame written after each session record
#[must_use]
pub fn encode_ack() -> Bytes {
    Bytes::from_static(&[ACK])
}

/// Encode the phone's epoch for the time-sync write
#[must_use]
pub fn encode_time(epoch_seconds: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(TIME_PAYLOAD_SIZE);
    buf.put_u32(epoch_seconds);
    buf.freeze()
}

/// Decode the tracker's epoch from the time-sync read
///
/// # Errors
///
/// Returns [`DecodeError::InvalidLength`] unless exactly 4 bytes are given.
pub fn decode_device_time(data: &[u8]) -> Result<u32, DecodeError> {
    if data.len() != TIME_PAYLOAD_SIZE {
        return Err(DecodeError::InvalidLength {
            expected: TIME_PAYLOAD_SIZE,
            actual: data.len(),
        });
    }

    let mut buf = data;
    Ok(buf.get_u32())
}
