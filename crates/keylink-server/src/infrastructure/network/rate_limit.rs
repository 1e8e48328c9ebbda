//! Per-address connection admission control.
//!
//! Every accepted connection is checked here before a handshake session is
//! even constructed.  The limiter keeps a history of attempt timestamps per
//! peer address and refuses an address once it has made
//! [`MAX_CONNECTIONS_PER_WINDOW`] attempts inside the sliding
//! [`CONNECTION_WINDOW_SECONDS`] window.
//!
//! One limiter instance serves the whole process.  It is constructed
//! explicitly at startup and injected as an `Arc` – deliberately not a
//! static – so its lifetime is the application's and tests can build their
//! own.  All sessions serialize on a single `Mutex`; the critical section
//! is just the prune/count/record sequence, which keeps contention
//! negligible even under a connection flood.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Sliding window in which attempts are counted.
pub const CONNECTION_WINDOW_SECONDS: f64 = 60.0;

/// Attempts allowed per address within the window.
pub const MAX_CONNECTIONS_PER_WINDOW: usize = 60;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// Tracks recent connection attempts per peer address.
///
/// History is memory-only: it resets with the process, and entries vanish
/// on their own once every timestamp has aged out of the window.
pub struct RateLimiter {
    started: Instant,
    history: Mutex<HashMap<String, Vec<f64>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Checks whether `address` may attempt a connection now and, if so,
    /// records the attempt.  Rejected attempts are not recorded.
    ///
    /// An address the transport could not determine (`None` or empty) is
    /// always admitted and never recorded: false positives would lock out
    /// every client behind such a transport, which is worse than letting
    /// the rare addressless transport go unlimited.
    pub fn check_and_record(&self, address: Option<&str>) -> Admission {
        let now = self.started.elapsed().as_secs_f64();
        self.check_and_record_at(address, now)
    }

    fn check_and_record_at(&self, address: Option<&str>, now: f64) -> Admission {
        let address = match address {
            Some(a) if !a.is_empty() => a,
            _ => return Admission::Admitted,
        };

        let mut history = match self.history.lock() {
            Ok(guard) => guard,
            // A poisoned lock only means another thread panicked mid-update;
            // the map itself is still structurally valid.
            Err(poisoned) => poisoned.into_inner(),
        };

        // Prune expired timestamps across all addresses, dropping entries
        // that end up empty.
        history.retain(|_, stamps| {
            stamps.retain(|t| now - *t < CONNECTION_WINDOW_SECONDS);
            !stamps.is_empty()
        });

        let recent = history.get(address).map_or(0, Vec::len);
        if recent >= MAX_CONNECTIONS_PER_WINDOW {
            return Admission::Rejected;
        }

        history.entry(address.to_string()).or_default().push(now);
        Admission::Admitted
    }

    /// Number of addresses currently holding in-window history.
    ///
    /// Diagnostics only; the value is stale the moment it is returned.
    pub fn tracked_addresses(&self) -> usize {
        match self.history.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
