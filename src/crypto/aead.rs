//! AEAD cipher family (AES-GCM)
//!
//! The nonce is deterministic: the 32-bit packet id carried on the wire,
//! followed by the direction's secret nonce tail. The 11-byte frame header
//! is the associated data, so ids cannot be swapped without failing the tag.

use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

use crate::crypto::slot::{KeyConfig, KeyDirection, SlotCipher};
use crate::error::{Error, Result};
use crate::protocol::PacketHeader;

/// AES-GCM nonce size in bytes.
const NONCE_SIZE: usize = 12;
/// Leading nonce bytes carried on the wire (the packet id).
const NONCE_WIRE_SIZE: usize = 4;
/// Secret trailing nonce bytes derived from key material.
const NONCE_TAIL_SIZE: usize = NONCE_SIZE - NONCE_WIRE_SIZE;
/// GCM authentication tag size in bytes.
const TAG_SIZE: usize = 16;

enum Gcm {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl Gcm {
    fn from_key(key: &[u8]) -> Result<Self> {
        match key.len() {
            16 => Ok(Gcm::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| {
                Error::InvalidArgument("bad AES-GCM key")
            })?)),
            32 => Ok(Gcm::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| {
                Error::InvalidArgument("bad AES-GCM key")
            })?)),
            _ => Err(Error::InvalidArgument("AES-GCM key must be 16 or 32 bytes")),
        }
    }

    fn encrypt(&self, nonce: &[u8; NONCE_SIZE], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Gcm::Aes128(c) => c.encrypt(nonce, payload),
            Gcm::Aes256(c) => c.encrypt(nonce, payload),
        }
        .map_err(|_| Error::BadAuth)
    }

    fn decrypt(&self, nonce: &[u8; NONCE_SIZE], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        match self {
            Gcm::Aes128(c) => c.decrypt(nonce, payload),
            Gcm::Aes256(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| Error::BadAuth)
    }
}

struct DirectionCtx {
    gcm: Gcm,
    nonce_tail: [u8; NONCE_TAIL_SIZE],
}

impl DirectionCtx {
    fn new(dir: &KeyDirection) -> Result<Self> {
        let tail_len = dir.nonce_tail.len();
        if !(NONCE_WIRE_SIZE..=NONCE_TAIL_SIZE).contains(&tail_len) {
            return Err(Error::InvalidArgument("nonce tail must be 4 to 8 bytes"));
        }
        let mut nonce_tail = [0u8; NONCE_TAIL_SIZE];
        nonce_tail[..tail_len].copy_from_slice(&dir.nonce_tail);
        Ok(Self {
            gcm: Gcm::from_key(&dir.key)?,
            nonce_tail,
        })
    }

    fn nonce(&self, packet_id: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_WIRE_SIZE].copy_from_slice(&packet_id.to_be_bytes());
        nonce[NONCE_WIRE_SIZE..].copy_from_slice(&self.nonce_tail);
        nonce
    }
}

/// AEAD contexts for one key slot: one per direction plus the encrypt-side
/// packet-id counter. The counter starts at zero and hands out ids from 1;
/// once the id space is spent the slot refuses to encrypt, forcing a rekey
/// before a nonce could repeat.
pub struct AeadCipher {
    encrypt: DirectionCtx,
    decrypt: DirectionCtx,
    packet_id: AtomicU32,
}

impl AeadCipher {
    pub fn new(kc: &KeyConfig) -> Result<Self> {
        Ok(Self {
            encrypt: DirectionCtx::new(&kc.encrypt)?,
            decrypt: DirectionCtx::new(&kc.decrypt)?,
            packet_id: AtomicU32::new(0),
        })
    }

    fn next_packet_id(&self) -> Result<u32> {
        self.packet_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map(|prev| prev + 1)
            .map_err(|_| Error::PacketIdExhausted)
    }
}

impl SlotCipher for AeadCipher {
    fn encap_overhead(&self) -> usize {
        NONCE_WIRE_SIZE + TAG_SIZE
    }

    fn encrypt(&self, key_id: u32, remote_peer_id: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        let packet_id = self.next_packet_id()?;
        let header = PacketHeader::new(key_id, remote_peer_id, packet_id)?;
        let header_bytes = header.to_bytes();
        let nonce = self.encrypt.nonce(packet_id);

        let ciphertext = self.encrypt.gcm.encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad: &header_bytes,
            },
        )?;

        let mut frame = Vec::with_capacity(PacketHeader::SIZE + ciphertext.len());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < PacketHeader::SIZE + TAG_SIZE {
            return Err(Error::InvalidArgument("frame shorter than header and tag"));
        }
        let header = PacketHeader::parse(frame)?;
        let nonce = self.decrypt.nonce(header.packet_id);

        self.decrypt.gcm.decrypt(
            &nonce,
            Payload {
                msg: &frame[PacketHeader::SIZE..],
                aad: &frame[..PacketHeader::SIZE],
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::slot::CipherAlg;
    use crate::crypto::test_support::{aead_key_config, paired_key_configs};

    fn cipher(key_id: u32) -> AeadCipher {
        AeadCipher::new(&aead_key_config(key_id)).unwrap()
    }

    #[test]
    fn overhead_is_packet_id_plus_tag() {
        assert_eq!(cipher(1).encap_overhead(), 20);
    }

    #[test]
    fn encrypt_decrypt_round_trip_between_paired_configs() {
        let (local, remote) = paired_key_configs(1);
        let tx = AeadCipher::new(&local).unwrap();
        let rx = AeadCipher::new(&remote).unwrap();

        let frame = tx.encrypt(1, 2, b"hello across the tunnel").unwrap();
        assert_eq!(rx.decrypt(&frame).unwrap(), b"hello across the tunnel");
    }

    #[test]
    fn packet_ids_are_monotonic_from_one() {
        let (local, remote) = paired_key_configs(1);
        let tx = AeadCipher::new(&local).unwrap();
        let _ = AeadCipher::new(&remote).unwrap();

        let first = tx.encrypt(1, 2, b"a").unwrap();
        let second = tx.encrypt(1, 2, b"b").unwrap();
        assert_eq!(PacketHeader::parse(&first).unwrap().packet_id, 1);
        assert_eq!(PacketHeader::parse(&second).unwrap().packet_id, 2);
    }

    #[test]
    fn exhausted_packet_ids_refuse_to_encrypt() {
        let c = cipher(1);
        c.packet_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(
            c.encrypt(1, 2, b"x").unwrap_err(),
            Error::PacketIdExhausted
        );
        // Still exhausted on retry; the counter must not wrap back around.
        assert_eq!(
            c.encrypt(1, 2, b"x").unwrap_err(),
            Error::PacketIdExhausted
        );
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let (local, remote) = paired_key_configs(1);
        let tx = AeadCipher::new(&local).unwrap();
        let rx = AeadCipher::new(&remote).unwrap();

        let mut frame = tx.encrypt(1, 2, b"payload").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(rx.decrypt(&frame).unwrap_err(), Error::BadAuth);
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let (local, remote) = paired_key_configs(1);
        let tx = AeadCipher::new(&local).unwrap();
        let rx = AeadCipher::new(&remote).unwrap();

        let mut frame = tx.encrypt(1, 2, b"payload").unwrap();
        // Flip a peer id bit; the header is authenticated as AAD.
        frame[6] ^= 0x01;
        assert_eq!(rx.decrypt(&frame).unwrap_err(), Error::BadAuth);
    }

    #[test]
    fn short_frames_are_malformed_not_bad_auth() {
        let c = cipher(1);
        assert!(matches!(
            c.decrypt(&[6u8; PacketHeader::SIZE + TAG_SIZE - 1]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn key_and_tail_lengths_are_validated() {
        let mut kc = aead_key_config(1);
        kc.encrypt.key = zeroize::Zeroizing::new(vec![0u8; 24]);
        assert!(matches!(
            AeadCipher::new(&kc),
            Err(Error::InvalidArgument(_))
        ));

        let mut kc = aead_key_config(1);
        kc.decrypt.nonce_tail = vec![0u8; 3];
        assert!(matches!(
            AeadCipher::new(&kc),
            Err(Error::InvalidArgument(_))
        ));

        let mut kc = aead_key_config(1);
        kc.cipher_alg = CipherAlg::AesGcm;
        kc.encrypt.nonce_tail = vec![0xaa; 8];
        assert!(AeadCipher::new(&kc).is_ok());
    }

    #[test]
    fn four_byte_tails_are_zero_padded() {
        // A 4-byte tail and the same tail explicitly padded to 8 bytes must
        // produce interoperable contexts.
        let (mut local, remote) = paired_key_configs(1);
        local.encrypt.nonce_tail = vec![0xaa; 4];
        let mut remote_padded = remote;
        remote_padded.decrypt.nonce_tail = vec![0xaa, 0xaa, 0xaa, 0xaa, 0, 0, 0, 0];

        let tx = AeadCipher::new(&local).unwrap();
        let rx = AeadCipher::new(&remote_padded).unwrap();
        let frame = tx.encrypt(1, 2, b"padded").unwrap();
        assert_eq!(rx.decrypt(&frame).unwrap(), b"padded");
    }
}
