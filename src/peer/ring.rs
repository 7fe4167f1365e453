//! Bounded packet rings
//!
//! Each peer carries one TX and one RX ring. The producer is whoever
//! enqueued the packet (the tunnel entry points or a keepalive handler),
//! the consumer is the dedicated worker. A full ring rejects the enqueue,
//! so producers see back-pressure instead of unbounded growth.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};

/// Ring capacity in packets.
pub const QUEUE_LEN: usize = 1024;

const _: () = assert!(QUEUE_LEN.is_power_of_two());

/// Counters for ring monitoring and the release-time emptiness check.
#[derive(Debug, Default)]
pub struct RingStats {
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub rejected: AtomicU64,
    pub drained: AtomicU64,
}

/// Bounded single-producer/single-consumer packet queue.
pub struct PacketRing {
    tx: mpsc::Sender<Bytes>,
    rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    depth: AtomicUsize,
    stats: RingStats,
}

impl PacketRing {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_LEN);
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            depth: AtomicUsize::new(0),
            stats: RingStats::default(),
        }
    }

    /// Enqueue a packet, failing with `QueueFull` under back-pressure.
    pub fn push(&self, packet: Bytes) -> Result<()> {
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::NotFound),
        }
    }

    /// Dequeue the next packet. Returns `None` once the ring is closed and
    /// empty; the worker exits on that.
    pub async fn pop(&self) -> Option<Bytes> {
        let packet = self.rx.lock().await.recv().await?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.stats.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Discard everything currently buffered, returning how many packets
    /// were thrown away.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut drained = 0;
        while let Ok(_packet) = rx.try_recv() {
            drained += 1;
        }
        if drained > 0 {
            self.depth.fetch_sub(drained, Ordering::Relaxed);
            self.stats.drained.fetch_add(drained as u64, Ordering::Relaxed);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

impl Default for PacketRing {
    fn default() -> Self {
        Self::new()
    }
}
