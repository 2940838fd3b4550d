//! Engine configuration.
//!
//! Connection details are never part of this: the caller owns the connection.

use std::time::Duration;

/// Default number of rows transformed per backfill chunk.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Default name of the advisory run-lock.
pub const DEFAULT_LOCK_NAME: &str = "stratum_migrations";

/// Default time to wait for the run-lock, in seconds.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// Default interval between lock acquisition attempts, in milliseconds.
pub const DEFAULT_LOCK_POLL_MS: u64 = 100;

/// Default lifetime of a run-lock between renewals, in seconds.
pub const DEFAULT_LOCK_LEASE_SECS: u64 = 300;

/// Configuration for backfill execution.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Rows per chunk when a backfill does not set its own batch size.
    pub default_batch_size: usize,
    /// Pause between chunks, yielding to other writers.
    pub batch_delay: Duration,
}

impl BackfillConfig {
    /// Set the default batch size.
    pub fn with_default_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size.max(1);
        self
    }

    /// Set the pause between chunks.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            default_batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::ZERO,
        }
    }
}

/// Configuration for the advisory run-lock.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lock name; runs sharing a name exclude each other.
    pub name: String,
    /// How long to wait before giving up.
    pub timeout: Duration,
    /// How often to retry while waiting.
    pub poll_interval: Duration,
    /// How long a held lock stays valid without renewal. A lock whose
    /// holder stops renewing it (a crashed process) may be taken over
    /// once this has passed.
    pub lease: Duration,
}

impl LockConfig {
    /// Set the lock name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the acquisition timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the retry interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease renewed while the lock is held.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_LOCK_NAME.to_string(),
            timeout: Duration::from_secs(DEFAULT_LOCK_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_LOCK_POLL_MS),
            lease: Duration::from_secs(DEFAULT_LOCK_LEASE_SECS),
        }
    }
}

/// Migration runner configuration.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Backfill configuration.
    pub backfill: BackfillConfig,
    /// Run-lock configuration.
    pub lock: LockConfig,
    /// Whether grade D (destructive) migrations may be applied.
    pub allow_destructive: bool,
    /// Whether rollbacks may destroy data the down path cannot restore.
    pub accept_data_loss: bool,
    /// Report what would run without locking or mutating anything.
    pub dry_run: bool,
}

impl RunnerConfig {
    /// Set the backfill configuration.
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Set the lock configuration.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Permit destructive up steps.
    pub fn allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Permit lossy rollbacks.
    pub fn accept_data_loss(mut self, accept: bool) -> Self {
        self.accept_data_loss = accept;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.backfill.default_batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.backfill.batch_delay, Duration::ZERO);
        assert_eq!(config.lock.name, DEFAULT_LOCK_NAME);
        assert_eq!(config.lock.timeout, Duration::from_secs(30));
        assert_eq!(config.lock.lease, Duration::from_secs(300));
        assert!(!config.allow_destructive);
        assert!(!config.accept_data_loss);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_builders() {
        let config = RunnerConfig::default()
            .with_backfill(BackfillConfig::default().with_default_batch_size(0))
            .with_lock(LockConfig::default().with_timeout(Duration::from_millis(50)))
            .allow_destructive(true)
            .dry_run(true);

        assert_eq!(config.backfill.default_batch_size, 1);
        assert_eq!(config.lock.timeout, Duration::from_millis(50));
        assert!(config.allow_destructive);
        assert!(config.dry_run);
    }
}
