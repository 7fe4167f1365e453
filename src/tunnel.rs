//! Tunnel device entry point
//!
//! The tunnel holds the atomic pointer to the currently active peer. The
//! data path loads the pointer inside a read-side critical section (the
//! swap guard) and upgrades to a counted handle; control operations swap
//! the pointer under the control mutex and let the old peer drain out
//! through its own refcount.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::peer::{Peer, PeerHandle, QUEUE_LEN};

/// Receiving ends of the tunnel's I/O channels.
///
/// `egress` carries encrypted wire frames for the UDP transport
/// collaborator; `ingress` carries decrypted payloads for the tunnel
/// network device collaborator.
pub struct TunnelIo {
    pub egress: mpsc::Receiver<Bytes>,
    pub ingress: mpsc::Receiver<Bytes>,
}

/// Module-level holder of the active peer.
pub struct Tunnel {
    peer: ArcSwapOption<Peer>,
    lock: Mutex<()>,
    egress_tx: mpsc::Sender<Bytes>,
    ingress_tx: mpsc::Sender<Bytes>,
    config: Config,
}

impl Tunnel {
    pub fn new(config: Config) -> (Arc<Tunnel>, TunnelIo) {
        let (egress_tx, egress_rx) = mpsc::channel(QUEUE_LEN);
        let (ingress_tx, ingress_rx) = mpsc::channel(QUEUE_LEN);
        let tunnel = Arc::new(Tunnel {
            peer: ArcSwapOption::empty(),
            lock: Mutex::new(()),
            egress_tx,
            ingress_tx,
            config,
        });
        (
            tunnel,
            TunnelIo {
                egress: egress_rx,
                ingress: ingress_rx,
            },
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn egress_sender(&self) -> mpsc::Sender<Bytes> {
        self.egress_tx.clone()
    }

    pub(crate) fn ingress_sender(&self) -> mpsc::Sender<Bytes> {
        self.ingress_tx.clone()
    }

    /// Fast-path entry: a counted handle to the active peer, or `None`
    /// when no peer is installed or the installed one is already dying.
    pub fn peer_get(&self) -> Option<PeerHandle> {
        let guard = self.peer.load();
        let peer = guard.as_ref()?;
        Peer::hold(peer)
    }

    /// Install a peer, consuming the reference it was constructed with.
    /// Any previously installed peer is deleted.
    pub fn install_peer(&self, peer: Arc<Peer>) {
        let _guard = self.lock.lock();
        let old = self.peer.swap(Some(peer));
        drop(_guard);
        if let Some(old) = old {
            Peer::delete(&old);
        }
    }

    /// Remove and delete the active peer, if any.
    pub fn delete_peer(&self) {
        let _guard = self.lock.lock();
        let old = self.peer.swap(None);
        drop(_guard);
        if let Some(old) = old {
            Peer::delete(&old);
        }
    }

    /// TX entry: queue a plaintext packet for encryption to the active
    /// peer.
    pub fn send(&self, packet: Bytes) -> Result<()> {
        let peer = self.peer_get().ok_or(Error::NotFound)?;
        peer.queue_tx(packet)
    }

    /// RX entry: queue an incoming wire frame for decryption by the active
    /// peer.
    pub fn recv(&self, frame: Bytes) -> Result<()> {
        let peer = self.peer_get().ok_or(Error::NotFound)?;
        peer.queue_rx(frame)
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.delete_peer();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("has_peer", &self.peer.load().is_some())
            .finish()
    }
}
