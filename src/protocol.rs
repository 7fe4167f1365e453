//! Data-plane wire protocol
//!
//! Frame layout:
//! `[op byte | key id (24 bit) | remote peer id (24 bit) | packet id (32 bit) | ciphertext | tag]`
//!
//! The 11-byte header doubles as the AEAD associated data, so a forged header
//! fails authentication together with the payload. Keepalive and explicit
//! exit notification are fixed 16-byte payloads carried inside the encrypted
//! channel and recognised after decryption.

use crate::error::{Error, Result};

/// Largest id representable in the 24-bit key id / peer id wire fields.
pub const MAX_ID24: u32 = (1 << 24) - 1;

/// Fixed keepalive payload, known to both endpoints.
pub const KEEPALIVE_MESSAGE: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Fixed explicit-exit-notify payload, distinct from the keepalive.
pub const EXIT_NOTIFY_MESSAGE: [u8; 16] = [
    0x28, 0x7f, 0x34, 0x6b, 0xd4, 0xef, 0x7a, 0x81, 0x2d, 0x56, 0xb8, 0xd3, 0xaf, 0xc5, 0x45,
    0x9c,
];

/// Data-plane opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Data = 6,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            6 => Ok(Opcode::Data),
            _ => Err(Error::InvalidArgument("unknown opcode")),
        }
    }
}

/// Parsed wire-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub opcode: Opcode,
    pub key_id: u32,
    pub remote_peer_id: u32,
    pub packet_id: u32,
}

impl PacketHeader {
    pub const SIZE: usize = 11;

    pub fn new(key_id: u32, remote_peer_id: u32, packet_id: u32) -> Result<Self> {
        if key_id > MAX_ID24 {
            return Err(Error::InvalidArgument("key id exceeds 24 bits"));
        }
        if remote_peer_id > MAX_ID24 {
            return Err(Error::InvalidArgument("peer id exceeds 24 bits"));
        }
        Ok(Self {
            opcode: Opcode::Data,
            key_id,
            remote_peer_id,
            packet_id,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.opcode as u8;
        bytes[1..4].copy_from_slice(&self.key_id.to_be_bytes()[1..]);
        bytes[4..7].copy_from_slice(&self.remote_peer_id.to_be_bytes()[1..]);
        bytes[7..11].copy_from_slice(&self.packet_id.to_be_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidArgument("frame shorter than header"));
        }
        let opcode = Opcode::try_from(bytes[0])?;
        let key_id = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
        let remote_peer_id = u32::from_be_bytes([0, bytes[4], bytes[5], bytes[6]]);
        let packet_id = u32::from_be_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
        Ok(Self {
            opcode,
            key_id,
            remote_peer_id,
            packet_id,
        })
    }
}

/// Extract the key id from an incoming frame without a full parse.
///
/// The receive path uses this to pick the decrypting key slot before the
/// frame is handed to the cipher.
pub fn peek_key_id(frame: &[u8]) -> Result<u32> {
    if frame.len() < PacketHeader::SIZE {
        return Err(Error::InvalidArgument("frame shorter than header"));
    }
    Ok(u32::from_be_bytes([0, frame[1], frame[2], frame[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_round_trip() {
        let hdr = PacketHeader::new(0x000001, 0x000002, 42).unwrap();
        let bytes = hdr.to_bytes();
        assert_eq!(bytes[0], 6);
        assert_eq!(PacketHeader::parse(&bytes).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_wide_ids() {
        assert_eq!(
            PacketHeader::new(1 << 24, 0, 0),
            Err(Error::InvalidArgument("key id exceeds 24 bits"))
        );
        assert_eq!(
            PacketHeader::new(0, 1 << 24, 0),
            Err(Error::InvalidArgument("peer id exceeds 24 bits"))
        );
    }

    #[test]
    fn parse_rejects_short_and_unknown() {
        assert!(PacketHeader::parse(&[6u8; 5]).is_err());
        let mut bytes = PacketHeader::new(1, 2, 3).unwrap().to_bytes();
        bytes[0] = 0xff;
        assert!(PacketHeader::parse(&bytes).is_err());
    }

    #[test]
    fn peek_matches_parse() {
        let hdr = PacketHeader::new(0xabcdef, 0x000007, 99).unwrap();
        let bytes = hdr.to_bytes();
        assert_eq!(peek_key_id(&bytes).unwrap(), 0xabcdef);
    }

    #[test]
    fn control_messages_are_distinct() {
        assert_ne!(KEEPALIVE_MESSAGE, EXIT_NOTIFY_MESSAGE);
    }

    proptest! {
        #[test]
        fn header_codec_is_lossless(key_id in 0u32..=MAX_ID24,
                                    peer_id in 0u32..=MAX_ID24,
                                    packet_id in any::<u32>()) {
            let hdr = PacketHeader::new(key_id, peer_id, packet_id).unwrap();
            let parsed = PacketHeader::parse(&hdr.to_bytes()).unwrap();
            prop_assert_eq!(parsed, hdr);
        }
    }
}
