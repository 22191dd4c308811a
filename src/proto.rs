//! Overlay wire format.
//!
//! Every datagram on the overlay carries a fixed six-byte header (magic tag,
//! 16-bit message type, payload length) followed by the payload. Two message
//! types exist: an introduction carrying the sender's `"<ip>,<mac>"` identity
//! and a non-encrypted encapsulated Ethernet frame.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::frame::MacAddr;

/// Magic tag leading every overlay datagram.
pub const MAGIC: u16 = 0x4d54;

/// Serialized header size.
pub const HEADER_LEN: usize = 6;

/// Overlay message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Introduction: payload is the ASCII string `"<ip>,<mac>"`.
    Intro,
    /// Non-encrypted encapsulated Ethernet frame.
    Nenc,
}

impl MsgType {
    pub fn as_u16(self) -> u16 {
        match self {
            MsgType::Intro => 1,
            MsgType::Nenc => 2,
        }
    }

    pub fn from_u16(value: u16) -> Option<MsgType> {
        match value {
            1 => Some(MsgType::Intro),
            2 => Some(MsgType::Nenc),
            _ => None,
        }
    }
}

/// Fixed-size message header. The type field is dispatched on; unknown values
/// survive parsing and are dropped by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u16,
    pub msg_type: u16,
    pub length: u16,
}

/// One overlay message: header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayMessage {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl OverlayMessage {
    pub fn new(msg_type: MsgType, payload: Bytes) -> Self {
        OverlayMessage {
            header: MessageHeader {
                magic: MAGIC,
                msg_type: msg_type.as_u16(),
                length: payload.len() as u16,
            },
            payload,
        }
    }

    /// Constructor for an introduction message from its payload string.
    pub fn intro(payload: &str) -> Self {
        Self::new(MsgType::Intro, Bytes::copy_from_slice(payload.as_bytes()))
    }

    /// Constructor for an encapsulated-frame message.
    pub fn nenc(frame: &[u8]) -> Self {
        Self::new(MsgType::Nenc, Bytes::copy_from_slice(frame))
    }

    /// The parsed message type, if this implementation knows it.
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u16(self.header.msg_type)
    }

    /// Serialize into a single datagram.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16(self.header.magic);
        buf.put_u16(self.header.msg_type);
        buf.put_u16(self.header.length);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse one datagram. Trailing bytes beyond the declared length are
    /// ignored; a datagram shorter than its declared length is rejected.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Codec(format!(
                "datagram of {} bytes is shorter than the header",
                data.len()
            )));
        }
        let mut cursor = data;
        let magic = cursor.get_u16();
        if magic != MAGIC {
            return Err(Error::Codec(format!("bad magic {:#06x}", magic)));
        }
        let msg_type = cursor.get_u16();
        let length = cursor.get_u16() as usize;
        if cursor.remaining() < length {
            return Err(Error::Codec(format!(
                "payload truncated: header declares {} bytes, {} present",
                length,
                cursor.remaining()
            )));
        }
        Ok(OverlayMessage {
            header: MessageHeader {
                magic,
                msg_type,
                length: length as u16,
            },
            payload: Bytes::copy_from_slice(&cursor[..length]),
        })
    }
}

/// Format the introduction payload for the given identity.
pub fn format_intro(ip: Ipv4Addr, mac: MacAddr) -> String {
    format!("{},{}", ip, mac)
}

/// Parse an introduction payload back into its identity parts.
pub fn parse_intro(payload: &str) -> Result<(Ipv4Addr, MacAddr)> {
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() != 2 {
        return Err(Error::InvalidIntro(payload.to_string()));
    }
    let ip: Ipv4Addr = parts[0]
        .parse()
        .map_err(|_| Error::InvalidIntro(payload.to_string()))?;
    let mac: MacAddr = parts[1]
        .parse()
        .map_err(|_| Error::InvalidIntro(payload.to_string()))?;
    Ok((ip, mac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intro_payload_round_trips() {
        let ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let mac: MacAddr = "06:aa:aa:aa:aa:aa".parse().unwrap();
        let payload = format_intro(ip, mac);
        assert_eq!(payload, "10.0.0.1,06:aa:aa:aa:aa:aa");
        let (parsed_ip, parsed_mac) = parse_intro(&payload).unwrap();
        assert_eq!(parsed_ip, ip);
        assert_eq!(parsed_mac, mac);
    }

    #[test]
    fn intro_payload_rejects_garbage() {
        assert!(parse_intro("10.0.0.1").is_err());
        assert!(parse_intro("10.0.0.1,").is_err());
        assert!(parse_intro("not-an-ip,06:aa:aa:aa:aa:aa").is_err());
        assert!(parse_intro("10.0.0.1,xx:yy").is_err());
        assert!(parse_intro("10.0.0.1,06:aa:aa:aa:aa:aa,extra").is_err());
    }

    #[test]
    fn message_round_trips() {
        let msg = OverlayMessage::intro("10.0.0.1,06:aa:aa:aa:aa:aa");
        let parsed = OverlayMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.msg_type(), Some(MsgType::Intro));

        let frame = vec![0xab; 60];
        let msg = OverlayMessage::nenc(&frame);
        let parsed = OverlayMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.msg_type(), Some(MsgType::Nenc));
        assert_eq!(&parsed.payload[..], &frame[..]);
    }

    #[test]
    fn short_and_corrupt_datagrams_are_rejected() {
        assert!(OverlayMessage::from_bytes(&[]).is_err());
        assert!(OverlayMessage::from_bytes(&[0x4d, 0x54, 0x00]).is_err());

        // wrong magic
        let mut bytes = OverlayMessage::intro("x").to_bytes().to_vec();
        bytes[0] = 0;
        assert!(OverlayMessage::from_bytes(&bytes).is_err());

        // declared length longer than the datagram
        let mut bytes = OverlayMessage::intro("payload").to_bytes().to_vec();
        bytes[5] = 0xff;
        assert!(OverlayMessage::from_bytes(&bytes).is_err());
    }

    #[test]
    fn unknown_types_survive_parsing() {
        let mut msg = OverlayMessage::intro("x");
        msg.header.msg_type = 99;
        let parsed = OverlayMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.header.msg_type, 99);
        assert_eq!(parsed.msg_type(), None);
    }
}
