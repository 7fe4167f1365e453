//! Peer lifecycle and packet workers
//!
//! A `Peer` aggregates the crypto state, address binding, packet rings,
//! keepalive timers and stats of one tunnel counterpart. Its lifetime is
//! driven by an explicit reference count: the tunnel's pointer, every armed
//! timer, every in-flight worker invocation and every data-path lookup each
//! own one reference. `hold` refuses to resurrect a peer whose count already
//! reached zero, and the release routine runs exactly once, after the last
//! reference is gone.

pub mod bind;
pub mod ring;
pub mod stats;
pub(crate) mod timer;

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crypto::CryptoState;
use crate::error::{Error, Result};
use crate::protocol::{peek_key_id, EXIT_NOTIFY_MESSAGE, KEEPALIVE_MESSAGE};
use crate::tunnel::Tunnel;

use bind::{Bind, SockaddrPair};
use ring::PacketRing;
use stats::{PeerStats, StatsSnapshot};
use timer::{KeepaliveTimer, Rearm};

pub use ring::QUEUE_LEN;

/// Reserved; constructed `Active` and never transitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Xmit,
    Expire,
}

/// A tunnel endpoint's view of its counterpart.
pub struct Peer {
    crypto: CryptoState,
    bind: ArcSwapOption<Bind>,
    tx_ring: PacketRing,
    rx_ring: PacketRing,
    keepalive_xmit: KeepaliveTimer,
    keepalive_expire: KeepaliveTimer,
    stats: PeerStats,
    refcount: AtomicUsize,
    halt: AtomicBool,
    releasing: AtomicBool,
    released: AtomicBool,
    status: PeerStatus,
    /// Serialises long-running control operations.
    mutex: Mutex<()>,
    /// Guards timer arm/disarm together with the matching refcount delta.
    lock: Mutex<()>,
    /// Device reference; dropped by the release routine.
    tunnel: Mutex<Option<Arc<Tunnel>>>,
    egress: mpsc::Sender<Bytes>,
    ingress: mpsc::Sender<Bytes>,
    config: Config,
    runtime: tokio::runtime::Handle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Counted handle keeping a peer alive for its holder.
pub struct PeerHandle {
    peer: Arc<Peer>,
}

impl Deref for PeerHandle {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Clone for PeerHandle {
    fn clone(&self) -> Self {
        // A live handle keeps the count above zero, so this cannot fail.
        let held = self.peer.hold_raw();
        debug_assert!(held, "cloning a handle to a dead peer");
        Self {
            peer: Arc::clone(&self.peer),
        }
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        Peer::put(&self.peer);
    }
}

impl PeerHandle {
    /// The underlying shared pointer, for callers that need to pass the
    /// peer to `Arc`-taking APIs. The handle keeps owning its reference.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Peer {
    /// Construct a new peer attached to a tunnel device.
    ///
    /// The returned peer carries one reference owed to the caller,
    /// typically consumed by installing it into the tunnel. Workers and
    /// timer drivers are spawned immediately, so this must run inside a
    /// tokio runtime.
    pub fn new(tunnel: &Arc<Tunnel>) -> Result<Arc<Peer>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidArgument("peer construction requires a tokio runtime"))?;
        let (shutdown_tx, _) = watch::channel(false);
        let config = tunnel.config().clone();

        let peer = Arc::new(Peer {
            crypto: CryptoState::new(),
            bind: ArcSwapOption::empty(),
            tx_ring: PacketRing::new(),
            rx_ring: PacketRing::new(),
            keepalive_xmit: KeepaliveTimer::new("keepalive-xmit"),
            keepalive_expire: KeepaliveTimer::new("keepalive-expire"),
            stats: PeerStats::new(),
            refcount: AtomicUsize::new(1),
            halt: AtomicBool::new(false),
            releasing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            status: PeerStatus::Active,
            mutex: Mutex::new(()),
            lock: Mutex::new(()),
            tunnel: Mutex::new(Some(Arc::clone(tunnel))),
            egress: tunnel.egress_sender(),
            ingress: tunnel.ingress_sender(),
            config,
            runtime,
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        });

        peer.spawn_tasks();

        if !peer.config.keepalive_ping.is_zero() || !peer.config.keepalive_timeout.is_zero() {
            let (ping, timeout) = (peer.config.keepalive_ping, peer.config.keepalive_timeout);
            peer.set_keepalive(ping, timeout);
        }

        Ok(peer)
    }

    /// Construct a peer and bind it to a sockaddr pair in one step. A bind
    /// failure releases the partially constructed peer before surfacing the
    /// error.
    pub fn new_with_sockaddr(tunnel: &Arc<Tunnel>, sapair: &SockaddrPair) -> Result<Arc<Peer>> {
        let peer = Peer::new(tunnel)?;
        if let Err(err) = peer.reset_sockaddr(sapair) {
            Peer::delete(&peer);
            return Err(err);
        }
        Ok(peer)
    }

    /// Replace the peer's address binding (roaming).
    pub fn reset_sockaddr(&self, sapair: &SockaddrPair) -> Result<()> {
        let bind = Bind::from_sockaddr_pair(sapair)?;
        self.bind.store(Some(Arc::new(bind)));
        Ok(())
    }

    pub fn bind(&self) -> Option<Arc<Bind>> {
        self.bind.load_full()
    }

    pub fn crypto(&self) -> &CryptoState {
        &self.crypto
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    /// Current reference count, for diagnostics and leak checks.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Attempt to take a counted handle. Fails when the count already hit
    /// zero, which callers treat as "peer gone", not as an error.
    pub fn hold(peer: &Arc<Peer>) -> Option<PeerHandle> {
        if peer.hold_raw() {
            Some(PeerHandle {
                peer: Arc::clone(peer),
            })
        } else {
            None
        }
    }

    fn hold_raw(&self) -> bool {
        let mut count = self.refcount.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => count = observed,
            }
        }
    }

    pub(crate) fn put(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::Release);
        debug_assert!(prev != 0, "peer refcount underflow");
        if prev == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            let peer = Arc::clone(self);
            self.runtime.spawn(async move {
                peer.release().await;
            });
        }
    }

    /// Delete the peer, consuming the reference it was created with.
    /// Idempotent; actual destruction is deferred until every other
    /// reference is gone.
    pub fn delete(self: &Arc<Self>) {
        // The halt transition is serialised with timer arming so a
        // keepalive reconfiguration cannot arm a timer whose driver is
        // already gone.
        let already_halted = {
            let _guard = self.lock.lock();
            self.halt.swap(true, Ordering::AcqRel)
        };
        if already_halted {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.put();
    }

    /// Enqueue an outgoing plaintext packet on the TX ring.
    pub fn queue_tx(&self, packet: Bytes) -> Result<()> {
        if self.halted() {
            return Err(Error::NotFound);
        }
        self.tx_ring.push(packet)?;
        if !self.config.keepalive_ignore_tx {
            self.keepalive_xmit.event();
        }
        Ok(())
    }

    /// Enqueue an incoming wire frame on the RX ring.
    pub fn queue_rx(&self, frame: Bytes) -> Result<()> {
        if self.halted() {
            return Err(Error::NotFound);
        }
        self.rx_ring.push(frame)?;
        self.keepalive_expire.event();
        Ok(())
    }

    /// Queue a fixed control payload on the TX ring without resetting the
    /// xmit timer. Used by the keepalive handler.
    fn xmit_special(&self, message: &'static [u8]) -> Result<()> {
        if self.halted() {
            return Err(Error::NotFound);
        }
        self.tx_ring.push(Bytes::from_static(message))?;
        if message == KEEPALIVE_MESSAGE.as_slice() {
            self.stats.keepalive_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// One-shot synchronous explicit-exit-notify send.
    ///
    /// Runs under the control mutex and bypasses the TX ring, so it carries
    /// none of the fast path's preconditions and can be used while tearing
    /// the peer down.
    pub fn xmit_explicit_exit_notify(&self) -> Result<()> {
        let _guard = self.mutex.lock();
        if self.halted() {
            return Err(Error::NotFound);
        }
        let slot = self.crypto.primary()?;
        let frame = slot.encrypt(&EXIT_NOTIFY_MESSAGE)?;
        let frame_len = frame.len();
        self.egress
            .try_send(Bytes::from(frame))
            .map_err(|_| Error::QueueFull)?;
        self.stats.count_tx(frame_len);
        Ok(())
    }

    /// Update the keepalive periods and (re)schedule both timers. A zero
    /// period disarms the corresponding timer. The refcount deltas of the
    /// rescheduling are balanced exactly, so repeated calls with the same
    /// values are free.
    pub fn set_keepalive(self: &Arc<Self>, ping: Duration, timeout: Duration) {
        self.keepalive_xmit.set_period(ping);
        self.timer_schedule(TimerKind::Xmit, 0);

        self.keepalive_expire.set_period(timeout);
        self.timer_schedule(TimerKind::Expire, 0);
    }

    fn timer(&self, kind: TimerKind) -> &KeepaliveTimer {
        match kind {
            TimerKind::Xmit => &self.keepalive_xmit,
            TimerKind::Expire => &self.keepalive_expire,
        }
    }

    /// (Re)schedule a timer and settle the refcount delta in the same
    /// critical section. `rcdelta` is the reference the caller already
    /// owns (-1 from a fire handler that consumed the arming, 0 otherwise).
    fn timer_schedule(self: &Arc<Self>, kind: TimerKind, rcdelta: i32) {
        let timer = self.timer(kind);
        let guard = self.lock.lock();
        let delta = rcdelta
            + match timer.schedule() {
                Rearm::Armed => 1,
                Rearm::Disarmed => -1,
                Rearm::Unchanged => 0,
            };
        match delta {
            0 => drop(guard),
            1 => {
                // A halted peer's timer drivers are already winding down;
                // arming now would strand the reference.
                if self.halted() || !self.hold_raw() {
                    timer.disarm();
                }
                drop(guard);
            }
            -1 => {
                drop(guard);
                self.put();
            }
            _ => {
                drop(guard);
                debug_assert!(false, "unbalanced timer refcount delta: {delta}");
            }
        }
    }

    /// Disarm a timer, releasing the reference the arming took. Returns
    /// whether it was armed.
    fn timer_delete(self: &Arc<Self>, kind: TimerKind) -> bool {
        let timer = self.timer(kind);
        let was_armed = {
            let _guard = self.lock.lock();
            timer.disarm()
        };
        if was_armed {
            self.put();
        }
        was_armed
    }

    fn keepalive_xmit_fire(self: &Arc<Self>) {
        if self.halted() {
            self.put();
            return;
        }
        tracing::trace!("keepalive xmit");
        if let Err(err) = self.xmit_special(&KEEPALIVE_MESSAGE) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%err, "keepalive enqueue failed");
        }
        // Hand the reference the arming owned to the rescheduled timer.
        self.timer_schedule(TimerKind::Xmit, -1);
    }

    fn keepalive_expire_fire(self: &Arc<Self>) {
        tracing::debug!("keepalive expired");
        self.put();
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(
            self.runtime
                .spawn(encrypt_worker(Arc::clone(self), self.shutdown_tx.subscribe())),
        );
        tasks.push(
            self.runtime
                .spawn(decrypt_worker(Arc::clone(self), self.shutdown_tx.subscribe())),
        );
        tasks.push(self.runtime.spawn(timer_driver(
            Arc::clone(self),
            TimerKind::Xmit,
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(self.runtime.spawn(timer_driver(
            Arc::clone(self),
            TimerKind::Expire,
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Deferred release, run once the refcount reached zero.
    async fn release(self: Arc<Self>) {
        if self.releasing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.halt.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);

        self.bind.store(None);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        // Every armed timer owns a reference, so none can be armed once the
        // count is zero.
        for kind in [TimerKind::Xmit, TimerKind::Expire] {
            let timer = self.timer(kind);
            if timer.is_armed() {
                tracing::error!(timer = timer.name(), "timer still armed at peer release");
                debug_assert!(false, "timer armed at peer release");
            }
        }

        // The workers drained on shutdown; anything left is a worker bug.
        let leftover = self.tx_ring.drain().await + self.rx_ring.drain().await;
        if leftover != 0 {
            tracing::error!(leftover, "packet rings not empty at peer release");
            debug_assert!(false, "packet rings not empty at peer release");
        }

        *self.tunnel.lock() = None;
        self.crypto.release();
        self.released.store(true, Ordering::Release);
        tracing::debug!("peer released");
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("refcount", &self.refcount())
            .field("halt", &self.halted())
            .field("released", &self.is_released())
            .finish()
    }
}

async fn encrypt_worker(peer: Arc<Peer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = peer.tx_ring.pop() => {
                let Some(packet) = packet else { break };
                match Peer::hold(&peer) {
                    Some(_invocation) => encrypt_one(&peer, packet),
                    None => {
                        // Peer is gone; the popped packet still counts.
                        peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
    let dropped = peer.tx_ring.drain().await;
    if dropped > 0 {
        peer.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }
}

fn encrypt_one(peer: &Peer, packet: Bytes) {
    let slot = match peer.crypto.primary() {
        Ok(slot) => slot,
        Err(_) => {
            peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    match slot.encrypt(&packet) {
        Ok(frame) => {
            peer.stats.count_tx(frame.len());
            if peer.egress.try_send(Bytes::from(frame)).is_err() {
                peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            peer.stats.encrypt_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%err, "encrypt failed");
        }
    }
}

async fn decrypt_worker(peer: Arc<Peer>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = peer.rx_ring.pop() => {
                let Some(frame) = frame else { break };
                match Peer::hold(&peer) {
                    Some(_invocation) => decrypt_one(&peer, frame),
                    None => {
                        peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
    let dropped = peer.rx_ring.drain().await;
    if dropped > 0 {
        peer.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
    }
}

fn decrypt_one(peer: &Peer, frame: Bytes) {
    let key_id = match peek_key_id(&frame) {
        Ok(key_id) => key_id,
        Err(_) => {
            peer.stats.decrypt_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    let slot = match peer.crypto.lookup(key_id) {
        Ok(slot) => slot,
        Err(_) => {
            tracing::debug!(key_id, "no key slot for incoming frame");
            peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };
    match slot.decrypt(&frame) {
        Ok(plaintext) => {
            peer.stats.count_rx(frame.len());
            if plaintext == KEEPALIVE_MESSAGE {
                peer.stats.keepalive_recv.fetch_add(1, Ordering::Relaxed);
            } else if plaintext == EXIT_NOTIFY_MESSAGE {
                peer.stats.exit_notify_recv.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("peer sent explicit exit notify");
            } else if peer.ingress.try_send(Bytes::from(plaintext)).is_err() {
                peer.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Err(err) => {
            peer.stats.decrypt_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%err, "decrypt failed");
        }
    }
}

async fn timer_driver(peer: Arc<Peer>, kind: TimerKind, mut shutdown: watch::Receiver<bool>) {
    loop {
        let timer = peer.timer(kind);
        match timer.armed_deadline() {
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = timer.changed() => {}
                }
            }
            Some(deadline) => {
                let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = timer.changed() => {}
                    _ = sleep => {
                        if timer.try_fire() {
                            match kind {
                                TimerKind::Xmit => peer.keepalive_xmit_fire(),
                                TimerKind::Expire => peer.keepalive_expire_fire(),
                            }
                        }
                    }
                }
            }
        }
    }
    // A still-armed timer owns a peer reference; give it back on the way
    // out so shutdown cannot leak the peer.
    peer.timer_delete(kind);
}
