use std::time::{Duration, Instant};

/// Tracks how long senders have continuously failed to find ring space.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct StallTimer {
    since: Option<Instant>,
}

impl StallTimer {
    /// Start timing unless a stall is already in progress.
    pub fn start(&mut self, now: Instant) {
        self.since.get_or_insert(now);
    }

    pub fn clear(&mut self) {
        self.since = None;
    }

    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.since.map(|since| now.saturating_duration_since(since))
    }

    /// Stall duration once it exceeds `threshold`.
    pub fn expired(&self, now: Instant, threshold: Duration) -> Option<Duration> {
        self.elapsed(now).filter(|elapsed| *elapsed > threshold)
    }
}
