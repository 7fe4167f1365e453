//! Per-peer cryptographic state
//!
//! `CryptoState` owns the two key slots of a peer (primary and secondary)
//! plus the cipher-family binding. The control path installs, rotates and
//! deletes slots under a mutex; the data path looks slots up wait-free
//! through an epoch-pinned read section and walks away with a counted
//! handle. A slot unlinked from the state is destroyed only after the epoch
//! grace period, so a reader that copied the pointer out can never observe
//! freed memory.

pub mod aead;
pub mod slot;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::error::{Error, Result};

pub use slot::{CipherAlg, CryptoFamily, KeyConfig, KeyDirection, KeySlot, KeySlotHandle};

/// The two key slots of a crypto state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlotId {
    Primary,
    Secondary,
}

/// Key installation request from the control collaborator.
#[derive(Debug)]
pub struct KeyReset {
    pub slot: KeySlotId,
    pub crypto_family: CryptoFamily,
    pub remote_peer_id: u32,
    pub key: KeyConfig,
}

/// Per-peer container of at most two key slots and the bound cipher family.
pub struct CryptoState {
    primary: Atomic<KeySlotHandle>,
    secondary: Atomic<KeySlotHandle>,
    family: Mutex<Option<CryptoFamily>>,
    mutex: Mutex<()>,
}

impl CryptoState {
    pub fn new() -> Self {
        Self {
            primary: Atomic::null(),
            secondary: Atomic::null(),
            family: Mutex::new(None),
            mutex: Mutex::new(()),
        }
    }

    fn cell(&self, slot: KeySlotId) -> &Atomic<KeySlotHandle> {
        match slot {
            KeySlotId::Primary => &self.primary,
            KeySlotId::Secondary => &self.secondary,
        }
    }

    /// Bind the cipher family for the life of this state.
    ///
    /// Idempotent for the already-bound family; any attempt to rebind to a
    /// different one fails with `FamilyChanged`.
    pub fn select_family(&self, pkr: &KeyReset) -> Result<()> {
        let _guard = self.mutex.lock();

        let requested = match pkr.crypto_family {
            CryptoFamily::Aead => CryptoFamily::Aead,
            // CBC-HMAC is reserved; nothing dispatches to it yet.
            CryptoFamily::CbcHmac | CryptoFamily::Undef => return Err(Error::Unsupported),
        };

        let mut family = self.family.lock();
        match *family {
            Some(bound) if bound != requested => Err(Error::FamilyChanged),
            Some(_) => Ok(()),
            None => {
                *family = Some(requested);
                Ok(())
            }
        }
    }

    /// Install a new key into the requested slot, atomically replacing the
    /// old one. All-or-nothing: a build failure installs nothing, and
    /// readers observe either the old slot or the fully constructed new one,
    /// never an empty window in between.
    pub fn reset(&self, pkr: &KeyReset) -> Result<()> {
        let _guard = self.mutex.lock();

        let bound = self
            .family
            .lock()
            .ok_or(Error::InvalidArgument("no cipher family selected"))?;

        // The remote peer id is stamped before the slot becomes reachable,
        // so readers always see it together with the slot.
        let new = Arc::new(KeySlot::new(&pkr.key, pkr.remote_peer_id)?);
        if new.family() != bound {
            return Err(Error::FamilyChanged);
        }

        tracing::debug!(
            key_id = new.key_id(),
            remote_peer_id = new.remote_peer_id(),
            slot = ?pkr.slot,
            "new key installed"
        );

        let epoch_guard = epoch::pin();
        let old = self
            .cell(pkr.slot)
            .swap(Owned::new(new), Ordering::AcqRel, &epoch_guard);
        Self::retire(old, &epoch_guard);
        Ok(())
    }

    /// Clear one slot. A no-op when the slot is already empty.
    pub fn delete_slot(&self, slot: KeySlotId) {
        let _guard = self.mutex.lock();

        let epoch_guard = epoch::pin();
        let old = self
            .cell(slot)
            .swap(Shared::null(), Ordering::AcqRel, &epoch_guard);
        if old.is_null() {
            tracing::debug!(slot = ?slot, "key slot already released");
            return;
        }
        Self::retire(old, &epoch_guard);
    }

    /// Clear both slots and schedule their reclamation. Invoked from the
    /// peer release path once no reference to the peer remains.
    pub fn release(&self) {
        self.clear_slots();
    }

    /// Bytes of encapsulation overhead the primary slot's cipher adds.
    pub fn encap_overhead(&self) -> Result<usize> {
        let epoch_guard = epoch::pin();
        let shared = self.primary.load(Ordering::Acquire, &epoch_guard);
        // SAFETY: the pointer was published by `swap` and cannot be retired
        // before this epoch-pinned section ends.
        match unsafe { shared.as_ref() } {
            Some(slot) => Ok(slot.encap_overhead()),
            None => Err(Error::NoKey),
        }
    }

    /// Counted handle to the primary slot, used by the encrypt path.
    pub fn primary(&self) -> Result<KeySlotHandle> {
        let epoch_guard = epoch::pin();
        self.clone_slot(&self.primary, &epoch_guard)
            .ok_or(Error::NoKey)
    }

    /// Remote peer id stamped on outgoing frames by the primary slot.
    pub fn primary_remote_peer_id(&self) -> Result<u32> {
        Ok(self.primary()?.remote_peer_id())
    }

    /// Find the slot whose key id matches an incoming frame and return a
    /// counted handle to it. Wait-free; never blocks on the control mutex.
    pub fn lookup(&self, key_id: u32) -> Result<KeySlotHandle> {
        let epoch_guard = epoch::pin();
        for cell in [&self.primary, &self.secondary] {
            if let Some(slot) = self.clone_slot(cell, &epoch_guard) {
                if slot.key_id() == key_id {
                    return Ok(slot);
                }
            }
        }
        Err(Error::NoKey)
    }

    fn clone_slot(
        &self,
        cell: &Atomic<KeySlotHandle>,
        epoch_guard: &Guard,
    ) -> Option<KeySlotHandle> {
        let shared = cell.load(Ordering::Acquire, epoch_guard);
        // SAFETY: the pointer was published by `swap` and cannot be retired
        // before this epoch-pinned section ends; cloning the Arc inside the
        // section yields a handle that stays valid after unpinning.
        unsafe { shared.as_ref() }.map(Arc::clone)
    }

    fn clear_slots(&self) {
        let epoch_guard = epoch::pin();
        for cell in [&self.primary, &self.secondary] {
            let old = cell.swap(Shared::null(), Ordering::AcqRel, &epoch_guard);
            Self::retire(old, &epoch_guard);
        }
    }

    fn retire(old: Shared<'_, KeySlotHandle>, epoch_guard: &Guard) {
        if !old.is_null() {
            // SAFETY: `old` was unlinked by the swap above and can no longer
            // be reached by new readers; deferred destruction waits out the
            // readers that still hold the epoch.
            unsafe { epoch_guard.defer_destroy(old) };
        }
    }
}

impl Default for CryptoState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CryptoState {
    fn drop(&mut self) {
        self.clear_slots();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Key config matching the canonical install fixture: AES-256-GCM,
    /// encrypt key of 0x11 bytes with a 4-byte 0xAA tail, decrypt key of
    /// 0x22 bytes with a 4-byte 0xBB tail.
    pub(crate) fn aead_key_config(key_id: u32) -> KeyConfig {
        KeyConfig {
            cipher_alg: CipherAlg::AesGcm,
            key_id,
            encrypt: KeyDirection::new(vec![0x11; 32], vec![0xaa; 4]),
            decrypt: KeyDirection::new(vec![0x22; 32], vec![0xbb; 4]),
        }
    }

    /// Two configs wired so that `local` encrypts what `remote` decrypts
    /// and vice versa.
    pub(crate) fn paired_key_configs(key_id: u32) -> (KeyConfig, KeyConfig) {
        let local = aead_key_config(key_id);
        let remote = KeyConfig {
            cipher_alg: CipherAlg::AesGcm,
            key_id,
            encrypt: KeyDirection::new(vec![0x22; 32], vec![0xbb; 4]),
            decrypt: KeyDirection::new(vec![0x11; 32], vec![0xaa; 4]),
        };
        (local, remote)
    }

    pub(crate) fn key_reset(slot: KeySlotId, key_id: u32, remote_peer_id: u32) -> KeyReset {
        KeyReset {
            slot,
            crypto_family: CryptoFamily::Aead,
            remote_peer_id,
            key: aead_key_config(key_id),
        }
    }
}
