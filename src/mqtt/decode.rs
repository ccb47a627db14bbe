//! Inbound response decoding
//!
//! The bridge only ever awaits CONNACK and PUBACK; every other packet
//! type is surfaced with its type nibble so the session can log what
//! the broker sent and keep waiting.

use super::{read_variable_int, DecodeError, MAX_REMAINING_LENGTH};

/// A decoded broker response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ConnAck { session_present: bool, return_code: u8 },
    PubAck { packet_id: u16 },
    /// Any other packet, identified by its type nibble
    Other(u8),
}

/// Decode one response from the buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete
/// packet, `Ok(Some((response, consumed)))` when it does.
pub fn decode_response(buf: &[u8]) -> Result<Option<(Response, usize)>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let packet_type = buf[0] >> 4;

    let (remaining_length, header_len) = match read_variable_int(&buf[1..]) {
        Ok((len, consumed)) => (len as usize, 1 + consumed),
        Err(DecodeError::InsufficientData) => return Ok(None),
        Err(e) => return Err(e),
    };

    if remaining_length > MAX_REMAINING_LENGTH {
        return Err(DecodeError::RemainingLengthTooLarge);
    }

    let total_len = header_len + remaining_length;
    if buf.len() < total_len {
        return Ok(None);
    }

    let body = &buf[header_len..total_len];

    let response = match packet_type {
        2 => {
            // CONNACK
            if body.len() != 2 {
                return Err(DecodeError::MalformedPacket("CONNACK length must be 2"));
            }
            Response::ConnAck {
                session_present: body[0] & 0x01 != 0,
                return_code: body[1],
            }
        }
        4 => {
            // PUBACK
            if body.len() < 2 {
                return Err(DecodeError::MalformedPacket("PUBACK missing packet id"));
            }
            Response::PubAck {
                packet_id: u16::from_be_bytes([body[0], body[1]]),
            }
        }
        other => Response::Other(other),
    };

    Ok(Some((response, total_len)))
}
