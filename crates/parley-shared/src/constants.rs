/// Maximum text message size in bytes (64 KiB)
pub const MAX_TEXT_SIZE: usize = 65_536;

/// Maximum image size accepted into the outbound queue (20 MiB)
pub const MAX_IMAGE_SIZE: usize = 20 * 1024 * 1024;

/// Concurrent send attempts across distinct queue entries
pub const DEFAULT_MAX_IN_FLIGHT: usize = 3;

/// Attempts before an entry is marked permanently failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// First retry delay in milliseconds
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on the exponential part of the retry delay (5 minutes)
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 300_000;

/// Upper bound of the random jitter added to each delay
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 500;

/// Per-attempt timeout for a remote call, in seconds
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 20;

/// Periodic drain wake-up, in seconds
pub const DEFAULT_WAKE_INTERVAL_SECS: u64 = 5;

/// Queued entries older than this are re-checked by crash recovery (24 h)
pub const DEFAULT_STALE_AFTER_SECS: u64 = 24 * 60 * 60;

/// Upper bound on the whole startup reconciliation pass, in seconds
pub const DEFAULT_RECOVERY_TIMEOUT_SECS: u64 = 30;

/// Existence-check attempts per entry before falling back to `queued`
pub const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;

/// Reachability probe period, in seconds
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 3;
