//! tunnelcore - data-channel acceleration core for UDP tunnel endpoints
//!
//! This library implements the per-peer cryptographic state machine of a
//! tunnel endpoint and the minimal peer lifecycle around it:
//! - two atomically swappable key slots per peer with deferred reclamation,
//!   so packet workers look keys up wait-free and never observe a torn or
//!   freed slot
//! - an explicit peer reference count covering the tunnel pointer, armed
//!   keepalive timers, in-flight worker invocations and data-path lookups
//! - bounded TX/RX packet rings with reject-on-full back-pressure
//! - keepalive transmit and expiry timers with exactly balanced refcount
//!   deltas
//!
//! Socket I/O, the key-negotiation control protocol and the tunnel network
//! device are external collaborators reached through channels and plain
//! types; the AEAD primitive is delegated to the `aes-gcm` crate.

pub mod config;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod tunnel;

// Re-export commonly used types
pub use config::Config;
pub use crypto::{
    CipherAlg, CryptoFamily, CryptoState, KeyConfig, KeyDirection, KeyReset, KeySlot,
    KeySlotHandle, KeySlotId,
};
pub use error::{Error, Result};
pub use peer::{bind::Bind, bind::SockaddrPair, Peer, PeerHandle, PeerStatus, QUEUE_LEN};
pub use peer::stats::StatsSnapshot;
pub use tunnel::{Tunnel, TunnelIo};
