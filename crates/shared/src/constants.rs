/// Symmetric message key size: 256 bits.
pub const MESSAGE_KEY_SIZE: usize = 32;
/// Upper bound on the per-chat key history kept by a client.
pub const MAX_HISTORY_CAP: usize = 3;
/// Lower bound on the per-chat key history kept by a client.
pub const MIN_HISTORY_CAP: usize = 2;
/// Default interval after which an active key is considered stale: 24 hours.
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// Default window in which a peer counts as live for rotation gating: 5 minutes.
pub const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 5 * 60;
/// Default wait for an acknowledgment before falling back to the durable store.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 8_000;
/// Default age after which an unacknowledged pending record may be superseded.
pub const DEFAULT_PENDING_MAX_AGE_SECS: u64 = 15 * 60;
/// Default hard lifetime of a key record: 7 days.
pub const DEFAULT_KEY_LIFETIME_SECS: u64 = 7 * 24 * 60 * 60;
/// Maximum size of a single relay frame in bytes.
pub const MAX_RELAY_FRAME_BYTES: usize = 4 * 1024;
