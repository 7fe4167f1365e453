//! Error types and handling for tunnelcore

use thiserror::Error;

/// Result type alias for tunnelcore operations
pub type Result<T> = std::result::Result<T, Error>;

/// tunnelcore error kinds.
///
/// Control-path operations return these to the caller and never leave state
/// half-mutated. Data-path failures are counted against the peer's stats and
/// the offending packet is dropped; they never escape a worker.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported cipher family")]
    Unsupported,

    #[error("cipher family already bound to a different family")]
    FamilyChanged,

    #[error("no key installed in the requested slot")]
    NoKey,

    #[error("peer not found")]
    NotFound,

    #[error("packet failed authentication")]
    BadAuth,

    #[error("queue is full")]
    QueueFull,

    #[error("packet id space exhausted")]
    PacketIdExhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_are_comparable() {
        assert_eq!(Error::NoKey, Error::NoKey);
        assert_ne!(Error::NoKey, Error::NotFound);
    }

    #[test]
    fn result_alias_works() {
        fn lookup_empty() -> Result<u32> {
            Err(Error::NoKey)
        }
        assert_eq!(lookup_empty(), Err(Error::NoKey));
    }
}
