//! Client-side MQTT 3.1.1 wire subset
//!
//! Statecast only ever opens one outbound session and pushes a single
//! QoS 1 message through it, so this module carries exactly the packets
//! that flow needs: CONNECT / PUBLISH / DISCONNECT on the way out,
//! CONNACK / PUBACK on the way back. Anything else the broker sends is
//! surfaced by packet type for diagnostics.

mod decode;
mod encode;
mod error;


pub use decode::{decode_response, Response};
pub use encode::{encode_connect, encode_disconnect, encode_publish};
pub use error::{DecodeError, EncodeError};

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// CONNECT packet (client -> broker)
#[derive(Debug, Clone)]
pub struct Connect {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// PUBLISH packet, always QoS 1, never retained
#[derive(Debug, Clone)]
pub struct Publish {
    pub topic: String,
    pub packet_id: u16,
    pub payload: Bytes,
}

/// CONNACK return codes this client cares about (MQTT 3.1.1 §3.2.2.3)
pub const CONNACK_ACCEPTED: u8 = 0x00;
pub const CONNACK_BAD_CREDENTIALS: u8 = 0x04;
pub const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

/// Read a Variable Byte Integer from buffer.
/// Returns (value, bytes_consumed) or error.
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= buf.len() {
            return Err(DecodeError::InsufficientData);
        }
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let byte = buf[pos];
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            break;
        }

        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write a Variable Byte Integer to buffer.
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
    Ok(())
}

/// Number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    let len = s.len();
    if len > 65535 {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}
