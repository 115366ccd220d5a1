//! Connection limits
//!
//! Caps the number of live connections per remote IP and per username.
//! A limit of zero means unlimited.

use dashmap::DashMap;

/// Too many live connections for the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitReached;

impl std::fmt::Display for LimitReached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("connection limit reached")
    }
}

impl std::error::Error for LimitReached {}

/// Live-connection counters keyed by IP or username
pub struct ConnectionLimits {
    max: usize,
    counts: DashMap<String, usize>,
}

impl ConnectionLimits {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            counts: DashMap::new(),
        }
    }

    /// Register a connection for the key; fails when the cap is reached
    pub fn connect(&self, key: &str) -> Result<(), LimitReached> {
        let mut count = self.counts.entry(key.to_string()).or_insert(0);
        if self.max > 0 && *count >= self.max {
            return Err(LimitReached);
        }
        *count += 1;
        Ok(())
    }

    /// Release a previously registered connection
    pub fn disconnect(&self, key: &str) {
        if let Some(mut count) = self.counts.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.counts.remove_if(key, |_, v| *v == 0);
            }
        }
    }
}
