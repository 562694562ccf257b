//! Tunnel token minting.

use std::sync::atomic::{AtomicU64, Ordering};

use culvert_proto::TunnelToken;

/// Mints tunnel tokens unique for the lifetime of the relay process.
///
/// Tokens start at 1 so 0 never names a live tunnel.
#[derive(Debug)]
pub struct TokenProducer {
    next: AtomicU64,
}

impl TokenProducer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> TunnelToken {
        TunnelToken::new(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TokenProducer {
    fn default() -> Self {
        Self::new()
    }
}
