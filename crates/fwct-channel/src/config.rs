use std::time::Duration;

use fwct_abi::layout::{DEFAULT_G2H_BYTES, DEFAULT_H2G_BYTES};

/// Where deferred event handlers run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeferredDispatch {
    /// A dedicated worker thread drains the incoming queue whenever the interrupt path schedules
    /// it.
    #[default]
    WorkerThread,
    /// Nothing runs automatically; the owner calls
    /// [`Channel::run_deferred_work`](crate::Channel::run_deferred_work).
    ///
    /// Useful for deterministic tests and for embedding into an existing event loop.
    Manual,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// H2G command array size in bytes (power of two).
    pub h2g_bytes: usize,
    /// G2H command array size in bytes (power of two).
    pub g2h_bytes: usize,
    /// Bytes of the G2H ring never handed out as reply credit, kept for unsolicited events.
    pub g2h_reserved_bytes: usize,
    /// How long a blocking sender polls before sleeping on the reply.
    pub response_spin: Duration,
    /// How long a blocking sender sleeps on the reply after the poll phase.
    pub response_timeout: Duration,
    /// Continuous lack of ring space after which the channel is declared deadlocked.
    pub stall_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Running as a managed guest whose firmware may be migrated. When set, a MIGRATED
    /// descriptor status is reported as [`CtError::ChannelMigrated`](crate::CtError) instead of
    /// corruption.
    pub managed_guest: bool,
    pub deferred_dispatch: DeferredDispatch,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            h2g_bytes: DEFAULT_H2G_BYTES,
            g2h_bytes: DEFAULT_G2H_BYTES,
            g2h_reserved_bytes: DEFAULT_G2H_BYTES / 4,
            response_spin: Duration::from_millis(10),
            response_timeout: Duration::from_secs(1),
            stall_timeout: Duration::from_millis(1500),
            backoff_min: Duration::from_micros(1),
            backoff_max: Duration::from_millis(1),
            managed_guest: false,
            deferred_dispatch: DeferredDispatch::WorkerThread,
        }
    }
}

impl ChannelConfig {
    /// Ring sizes with the default G2H reservation of a quarter of the G2H ring.
    pub fn with_sizes(h2g_bytes: usize, g2h_bytes: usize) -> Self {
        Self {
            h2g_bytes,
            g2h_bytes,
            g2h_reserved_bytes: g2h_bytes / 4,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reserve_a_quarter_of_g2h() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.h2g_bytes, 4096);
        assert_eq!(cfg.g2h_bytes, 16384);
        assert_eq!(cfg.g2h_reserved_bytes, 4096);
        assert!(cfg.response_spin < cfg.response_timeout);
        assert!(cfg.response_timeout < cfg.stall_timeout);

        let small = ChannelConfig::with_sizes(256, 2048);
        assert_eq!(small.g2h_reserved_bytes, 512);
        assert_eq!(small.deferred_dispatch, DeferredDispatch::WorkerThread);
    }
}
