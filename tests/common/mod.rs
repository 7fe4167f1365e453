//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use tunnelcore::{CipherAlg, CryptoFamily, KeyConfig, KeyDirection, KeyReset, KeySlotId, Peer};

/// AES-256-GCM config: encrypt key of 0x11 bytes with a 4-byte 0xAA tail,
/// decrypt key of 0x22 bytes with a 4-byte 0xBB tail.
pub fn key_config(key_id: u32) -> KeyConfig {
    KeyConfig {
        cipher_alg: CipherAlg::AesGcm,
        key_id,
        encrypt: KeyDirection::new(vec![0x11; 32], vec![0xaa; 4]),
        decrypt: KeyDirection::new(vec![0x22; 32], vec![0xbb; 4]),
    }
}

/// The mirror-image config, so one endpoint decrypts what the other
/// encrypts.
pub fn mirrored_key_config(key_id: u32) -> KeyConfig {
    KeyConfig {
        cipher_alg: CipherAlg::AesGcm,
        key_id,
        encrypt: KeyDirection::new(vec![0x22; 32], vec![0xbb; 4]),
        decrypt: KeyDirection::new(vec![0x11; 32], vec![0xaa; 4]),
    }
}

pub fn key_reset(slot: KeySlotId, key_id: u32, remote_peer_id: u32) -> KeyReset {
    KeyReset {
        slot,
        crypto_family: CryptoFamily::Aead,
        remote_peer_id,
        key: key_config(key_id),
    }
}

pub fn mirrored_key_reset(slot: KeySlotId, key_id: u32, remote_peer_id: u32) -> KeyReset {
    KeyReset {
        slot,
        crypto_family: CryptoFamily::Aead,
        remote_peer_id,
        key: mirrored_key_config(key_id),
    }
}

static TRACING: Once = Once::new();

/// Route `RUST_LOG`-filtered traces to the test output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Wait until the peer's deferred release has run.
pub async fn wait_released(peer: &Arc<Peer>) {
    for _ in 0..500 {
        if peer.is_released() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("peer was not released within 5s");
}
