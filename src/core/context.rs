//! Identifier allocation.
//!
//! Connection identifiers are handed out by a [`NetContext`]. Applications
//! that need isolated identifier spaces (tests, several independent pools in
//! one process) construct their own; everything else shares the lazily
//! initialised [`NetContext::global`] instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Process-wide state shared by servers and clients.
#[derive(Debug)]
pub struct NetContext {
    next_id: AtomicU64,
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NetContext {
    /// Create a context whose first identifier is `1`.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Create a context whose first identifier is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first),
        }
    }

    /// The shared process-wide context.
    pub fn global() -> Arc<NetContext> {
        static GLOBAL: OnceLock<Arc<NetContext>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(NetContext::new())))
    }

    /// Allocate the next connection identifier.
    ///
    /// Identifiers are unique within this context and strictly increasing.
    pub fn next_conn_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}
