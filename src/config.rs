use std::time::Duration;

/// Default bound on how long a backend may hold native notifications before emitting them.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(100);

/// Tunables shared by every backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Config {
    /// Upper bound on delivery delay.
    ///
    /// On macOS this is the `FSEvents` stream latency. On other platforms it is the window during
    /// which the second half of a rename is awaited before falling back to a rescan event.
    pub latency: Duration,
}

impl Config {
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            latency: DEFAULT_LATENCY,
        }
    }
}
