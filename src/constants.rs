//! # magikcell Constants
//!
//! Defines the timeouts, limits, and well-known names used by the lifecycle
//! and attach layers. These constants are the **single source of truth** for
//! every bounded wait in the crate; [`crate::config::Config`] starts from them
//! and may override a subset.
//!
//! ## Cross-References
//!
//! - [`crate::exec`]: stop escalation, start reporting, handle cache bounds
//! - [`crate::attach`]: handshake timing, SSH principal, sub-channel requests

use std::time::Duration;

// =============================================================================
// Lifecycle Timeouts
// =============================================================================

/// Per-signal wait used by graceful shutdown when the caller gives none.
///
/// Each stop signal gets this long to bring the VM to powered-off before the
/// next signal in the escalation list is sent.
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(10);

/// How long start waits for the guest to report the primary session launch.
///
/// **Rationale**: guest boot plus process launch on a loaded host can take
/// minutes; beyond this the launch is considered failed.
pub const START_REPORT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Default bound for callers waiting on a container state change.
pub const CONTAINER_WAIT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

// =============================================================================
// Handle Cache
// =============================================================================

/// Maximum number of stashed (uncommitted) handles.
///
/// **Security**: handles are created by API callers; the cache must not grow
/// without bound when callers abandon them. Oldest handles are evicted first.
pub const MAX_PENDING_HANDLES: usize = 1000;

/// Lifetime of a stashed handle that is never retrieved again.
pub const HANDLE_TTL: Duration = Duration::from_secs(10 * 60);

// =============================================================================
// Guest Signaling
// =============================================================================

/// Program run inside the guest to deliver a signal to the primary process.
pub const GUEST_KILL_PROGRAM: &str = "kill";

/// Guest-published key carrying the launch status of a session.
///
/// The guest writes `"true"` on success or an error detail on failure.
#[must_use]
pub fn session_started_key(id: &str) -> String {
    format!("guestinfo.vice..sessions|{id}.started")
}

/// Fault message key reported when a power-off task is cancelled because the
/// guest shut itself down concurrently.
pub const VM_NOT_SUSPENDED_KEY: &str = "msg.suspend.powerOff.notsuspended";

// =============================================================================
// Attach Backchannel
// =============================================================================

/// Bound on a single handshake attempt with a freshly accepted connection.
///
/// **Rationale**: intentionally shorter than the guest's own retry cadence so
/// a missed window is cheaply retried instead of stalling the connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(50);

/// Maximum handshake attempts per accepted connection (≈30s at 50ms).
///
/// **Security**: a peer that never aligns cannot pin a connection task forever.
pub const HANDSHAKE_MAX_ATTEMPTS: u32 = 600;

/// Quiet period that ends the purge of stale inbound bytes.
pub const PURGE_QUIET_PERIOD: Duration = Duration::from_millis(10);

/// Upper bound on bytes discarded by a single purge.
pub const MAX_PURGE_BYTES: usize = 64 * 1024;

/// Principal the host authenticates as on the backchannel.
pub const BACKCHANNEL_USER: &str = "daemon";

/// Exec request that lists the attachable sub-channel ids.
pub const LIST_IDS_REQUEST: &str = "container-ids";

/// Exec request prefix that attaches to one sub-channel (`attach <id>`).
pub const ATTACH_REQUEST: &str = "attach";

/// Maximum sub-channel id length accepted from a guest.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Maximum number of sub-channels accepted from a single backchannel.
pub const MAX_SESSIONS_PER_BACKCHANNEL: usize = 256;

/// Buffered output chunks per attached session before backpressure.
pub const SESSION_BUFFER: usize = 64;

/// Default listen address for the attach connector.
pub const DEFAULT_ATTACH_ADDR: &str = "127.0.0.1:2377";

// =============================================================================
// Validation
// =============================================================================

/// Validates a sub-channel id received from a guest.
///
/// Returns a static reason on failure.
pub fn validate_session_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("session id cannot be empty");
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err("session id too long");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("session id contains invalid characters");
    }
    Ok(())
}
