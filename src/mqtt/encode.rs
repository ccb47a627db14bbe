//! Outbound packet encoding (MQTT 3.1.1)

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_string, write_variable_int, Connect, EncodeError, Publish};

/// Encode a CONNECT packet
pub fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Protocol name "MQTT" (6) + level (1) + connect flags (1) + keep alive (2)
    let mut remaining_length = 10;
    remaining_length += 2 + packet.client_id.len();
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    // Fixed header: CONNECT type + flags (0001 0000)
    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, "MQTT")?;
    buf.put_u8(0x04); // protocol level 4 = 3.1.1

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    buf.put_u8(connect_flags);

    buf.put_u16(packet.keep_alive);
    write_string(buf, &packet.client_id)?;

    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_string(buf, password)?;
    }

    Ok(())
}

/// Encode a QoS 1 PUBLISH packet (dup=0, retain=0)
pub fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    if packet.packet_id == 0 {
        return Err(EncodeError::InvalidPacketId);
    }

    // Topic + packet id + payload
    let remaining_length = 2 + packet.topic.len() + 2 + packet.payload.len();
    if remaining_length + 1 + variable_int_len(remaining_length as u32) > super::MAX_REMAINING_LENGTH
    {
        return Err(EncodeError::PacketTooLarge);
    }

    // Fixed header: PUBLISH type, QoS 1 (0011 0010)
    buf.put_u8(0x32);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, &packet.topic)?;
    buf.put_u16(packet.packet_id);
    buf.put_slice(&packet.payload);

    Ok(())
}

/// Encode a DISCONNECT packet
pub fn encode_disconnect(buf: &mut BytesMut) {
    buf.put_u8(0xE0);
    buf.put_u8(0x00);
}
