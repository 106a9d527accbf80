//! Per-host brute-force gate.
//!
//! Hosts accumulate strikes on failed authentication; once over the
//! configured threshold they are short-circuit rejected before any work is
//! done, including the websocket upgrade itself. The counter is process-local
//! and reset by the `cleanupBruteforce` system task.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use bp_store::ConfigCache;

pub struct Bruteforce {
    config: Arc<ConfigCache>,
    strikes: RwLock<HashMap<String, u64>>,
    blocked_total: RwLock<u64>,
}

impl Bruteforce {
    pub fn new(config: Arc<ConfigCache>) -> Self {
        Self {
            config,
            strikes: RwLock::new(HashMap::new()),
            blocked_total: RwLock::new(0),
        }
    }

    fn enabled(&self) -> bool {
        self.config.get_bool("bruteforceProtection")
    }

    fn limit(&self) -> u64 {
        self.config.get_u64("bruteforceAttempts").max(1)
    }

    /// Whether the host is currently blocked. Counts blocked attempts for
    /// admin observability.
    pub fn check(&self, host: &str) -> bool {
        if !self.enabled() {
            return false;
        }
        let blocked = self
            .strikes
            .read()
            .get(host)
            .is_some_and(|count| *count >= self.limit());

        if blocked {
            *self.blocked_total.write() += 1;
            tracing::warn!(host, "request blocked by brute-force protection");
        }
        blocked
    }

    /// Register a failed authentication attempt from the host.
    pub fn strike(&self, host: &str) {
        if !self.enabled() {
            return;
        }
        let mut strikes = self.strikes.write();
        let count = strikes.entry(host.to_string()).or_insert(0);
        *count += 1;
        if *count == self.limit() {
            tracing::warn!(host, "host reached brute-force attempt limit");
        }
    }

    /// Drop all strikes. Runs on the `cleanupBruteforce` schedule.
    pub fn reset(&self) {
        let cleared = {
            let mut strikes = self.strikes.write();
            let n = strikes.len();
            strikes.clear();
            n
        };
        if cleared > 0 {
            tracing::info!(hosts = cleared, "brute-force counters reset");
        }
    }

    pub fn blocked_count(&self) -> u64 {
        *self.blocked_total.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(attempts: &str) -> Bruteforce {
        let config = Arc::new(ConfigCache::new());
        config.set_local("bruteforceProtection", "1");
        config.set_local("bruteforceAttempts", attempts);
        Bruteforce::new(config)
    }

    #[test]
    fn blocks_after_limit() {
        let gate = gate("3");
        assert!(!gate.check("10.0.0.9"));
        gate.strike("10.0.0.9");
        gate.strike("10.0.0.9");
        assert!(!gate.check("10.0.0.9"), "below limit");
        gate.strike("10.0.0.9");
        assert!(gate.check("10.0.0.9"), "at limit");
        assert_eq!(gate.blocked_count(), 1);
    }

    #[test]
    fn hosts_are_independent() {
        let gate = gate("1");
        gate.strike("10.0.0.1");
        assert!(gate.check("10.0.0.1"));
        assert!(!gate.check("10.0.0.2"));
    }

    #[test]
    fn reset_clears_strikes() {
        let gate = gate("1");
        gate.strike("10.0.0.1");
        assert!(gate.check("10.0.0.1"));
        gate.reset();
        assert!(!gate.check("10.0.0.1"));
    }

    #[test]
    fn disabled_gate_never_blocks() {
        let config = Arc::new(ConfigCache::new());
        config.set_local("bruteforceProtection", "0");
        config.set_local("bruteforceAttempts", "1");
        let gate = Bruteforce::new(config);
        gate.strike("10.0.0.1");
        gate.strike("10.0.0.1");
        assert!(!gate.check("10.0.0.1"));
    }
}
