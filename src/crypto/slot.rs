//! Key slots and the cipher-family dispatch
//!
//! A `KeySlot` binds one negotiated symmetric key pair to the ids that tag
//! it on the wire. Slots are immutable after construction and shared with
//! the data path through `Arc` handles; the cipher contexts zeroize their
//! key material when the last handle drops.

use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::aead::AeadCipher;
use crate::error::{Error, Result};
use crate::protocol::MAX_ID24;

/// Cipher algorithm requested by the control collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlg {
    AesGcm,
    /// Reserved. Selecting it fails with `Unsupported`.
    AesCbc,
}

/// Cipher family a key config resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoFamily {
    Undef,
    Aead,
    /// Reserved, not implemented.
    CbcHmac,
}

impl CryptoFamily {
    /// Pure mapping from algorithm to family.
    pub fn from_alg(alg: CipherAlg) -> Self {
        match alg {
            CipherAlg::AesGcm => CryptoFamily::Aead,
            CipherAlg::AesCbc => CryptoFamily::CbcHmac,
        }
    }
}

/// Raw key material for one direction of the channel.
pub struct KeyDirection {
    pub key: Zeroizing<Vec<u8>>,
    pub nonce_tail: Vec<u8>,
}

impl KeyDirection {
    pub fn new(key: Vec<u8>, nonce_tail: Vec<u8>) -> Self {
        Self {
            key: Zeroizing::new(key),
            nonce_tail,
        }
    }
}

impl fmt::Debug for KeyDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key bytes never reach logs.
        f.debug_struct("KeyDirection")
            .field("key_len", &self.key.len())
            .field("nonce_tail_len", &self.nonce_tail.len())
            .finish()
    }
}

/// Key descriptor delivered by the control collaborator.
#[derive(Debug)]
pub struct KeyConfig {
    pub cipher_alg: CipherAlg,
    pub key_id: u32,
    pub encrypt: KeyDirection,
    pub decrypt: KeyDirection,
}

/// Cipher-family operations bound to one key slot.
///
/// `encrypt` produces a complete wire frame from a plaintext packet and
/// `decrypt` recovers the plaintext from a frame. Context teardown is the
/// implementor's `Drop`.
pub trait SlotCipher: Send + Sync {
    /// Bytes the cipher adds to a plaintext packet (nonce prefix + tag).
    fn encap_overhead(&self) -> usize;

    fn encrypt(&self, key_id: u32, remote_peer_id: u32, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>>;
}

/// Immutable holder of one installed key pair.
pub struct KeySlot {
    key_id: u32,
    remote_peer_id: u32,
    family: CryptoFamily,
    cipher: Box<dyn SlotCipher>,
}

/// Counted reader handle to a key slot.
pub type KeySlotHandle = Arc<KeySlot>;

impl KeySlot {
    /// Build a slot from a key config, stamping the id the remote side will
    /// see on our outgoing frames. Fails on unsupported algorithms and on
    /// malformed key material, releasing nothing.
    pub fn new(kc: &KeyConfig, remote_peer_id: u32) -> Result<Self> {
        if kc.key_id > MAX_ID24 {
            return Err(Error::InvalidArgument("key id exceeds 24 bits"));
        }
        if remote_peer_id > MAX_ID24 {
            return Err(Error::InvalidArgument("peer id exceeds 24 bits"));
        }

        let family = CryptoFamily::from_alg(kc.cipher_alg);
        let cipher: Box<dyn SlotCipher> = match family {
            CryptoFamily::Aead => Box::new(AeadCipher::new(kc)?),
            CryptoFamily::CbcHmac | CryptoFamily::Undef => return Err(Error::Unsupported),
        };

        Ok(Self {
            key_id: kc.key_id,
            remote_peer_id,
            family,
            cipher,
        })
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn remote_peer_id(&self) -> u32 {
        self.remote_peer_id
    }

    pub fn family(&self) -> CryptoFamily {
        self.family
    }

    pub fn encap_overhead(&self) -> usize {
        self.cipher.encap_overhead()
    }

    /// Encrypt a plaintext packet into a wire frame tagged with this slot's
    /// key id and remote peer id.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher.encrypt(self.key_id, self.remote_peer_id, plaintext)
    }

    /// Decrypt a wire frame back into its plaintext payload.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>> {
        self.cipher.decrypt(frame)
    }
}

impl fmt::Debug for KeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlot")
            .field("key_id", &self.key_id)
            .field("remote_peer_id", &self.remote_peer_id)
            .field("family", &self.family)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_support::aead_key_config;

    #[test]
    fn family_mapping_is_pure() {
        assert_eq!(CryptoFamily::from_alg(CipherAlg::AesGcm), CryptoFamily::Aead);
        assert_eq!(CryptoFamily::from_alg(CipherAlg::AesCbc), CryptoFamily::CbcHmac);
    }

    #[test]
    fn slot_carries_ids() {
        let slot = KeySlot::new(&aead_key_config(0x000001), 0x000002).unwrap();
        assert_eq!(slot.key_id(), 0x000001);
        assert_eq!(slot.remote_peer_id(), 0x000002);
        assert_eq!(slot.family(), CryptoFamily::Aead);
    }

    #[test]
    fn reserved_family_is_unsupported() {
        let mut kc = aead_key_config(1);
        kc.cipher_alg = CipherAlg::AesCbc;
        assert_eq!(KeySlot::new(&kc, 2).unwrap_err(), Error::Unsupported);
    }

    #[test]
    fn wide_ids_are_rejected() {
        let mut kc = aead_key_config(1);
        kc.key_id = 1 << 24;
        assert!(matches!(
            KeySlot::new(&kc, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            KeySlot::new(&aead_key_config(1), 1 << 24),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let kc = aead_key_config(1);
        let rendered = format!("{:?}", kc);
        assert!(!rendered.contains("0x11"));
        assert!(rendered.contains("key_len"));
    }
}
