//! Peer address binding
//!
//! A `Bind` is the immutable local/remote sockaddr pair a peer currently
//! transmits to. Roaming replaces the whole object atomically; packet
//! workers read whichever bind was current when they looked.

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Sockaddr pair supplied by the transport collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockaddrPair {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// Immutable remote-address tuple for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    local: SocketAddr,
    remote: SocketAddr,
}

impl Bind {
    /// Build a bind from a sockaddr pair. Mixed address families are
    /// rejected; the transport cannot source v4 from a v6 socket.
    pub fn from_sockaddr_pair(pair: &SockaddrPair) -> Result<Self> {
        if pair.local.is_ipv4() != pair.remote.is_ipv4() {
            return Err(Error::InvalidArgument("mixed address families in bind"));
        }
        Ok(Self {
            local: pair.local,
            remote: pair.remote,
        })
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}
