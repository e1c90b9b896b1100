//! Compare-and-claim on change versions.
//!
//! The backend's conditional reconfigure only protects commits that write
//! configuration. Power-only commits never write, so two handles staged from
//! the same snapshot could both power the VM without ever seeing each other.
//! The gate closes that hole: before a commit touches the backend it claims
//! `(container id, base version)`, and a second commit from the same base
//! version is rejected.
//!
//! ```text
//!   claim(id, V1, serial) ──► in flight ──complete()──► completed(barrier)
//!                                │
//!                             dropped
//!                                ▼
//!                             released
//! ```
//!
//! A completed claim keeps rejecting handles staged *before* it completed
//! (their serial is below the barrier). Handles staged afterwards may claim
//! the same version again, which happens when a commit changed nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    InFlight,
    Completed { barrier: u64 },
}

#[derive(Debug, Clone)]
struct Claim {
    version: String,
    token: u64,
    state: ClaimState,
}

/// Per-container claims on base versions.
#[derive(Debug, Default)]
pub struct CommitGate {
    claims: Mutex<HashMap<String, Claim>>,
    serial: AtomicU64,
}

impl CommitGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next staging serial; handles record it when they are built.
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Claims `version` of container `id` for a handle staged at `serial`.
    ///
    /// Returns the conflict detail if another commit holds or consumed it.
    pub fn claim(&self, id: &str, version: &str, serial: u64) -> Result<ClaimGuard<'_>, String> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = claims.get(id) {
            if existing.version == version {
                match existing.state {
                    ClaimState::InFlight => {
                        return Err(format!("commit from version {version} already in progress"));
                    }
                    ClaimState::Completed { barrier } if serial < barrier => {
                        return Err(format!("version {version} was already committed"));
                    }
                    ClaimState::Completed { .. } => {}
                }
            }
        }

        let token = self.next_serial();
        claims.insert(
            id.to_string(),
            Claim {
                version: version.to_string(),
                token,
                state: ClaimState::InFlight,
            },
        );
        debug!(id = %id, version = %version, "claimed base version");

        Ok(ClaimGuard {
            gate: self,
            id: id.to_string(),
            token,
            completed: false,
        })
    }

    /// Drops whatever claim exists for `id`.
    pub fn release(&self, id: &str) {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn finish(&self, id: &str, token: u64, completed: bool) {
        let barrier = self.next_serial();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(claim) = claims.get_mut(id) else {
            return;
        };
        if claim.token != token {
            return;
        }
        if completed {
            claim.state = ClaimState::Completed { barrier };
        } else {
            claims.remove(id);
        }
    }
}

/// Held while a commit runs; releases the claim if dropped before
/// [`ClaimGuard::complete`].
#[derive(Debug)]
pub struct ClaimGuard<'a> {
    gate: &'a CommitGate,
    id: String,
    token: u64,
    completed: bool,
}

impl ClaimGuard<'_> {
    /// Marks the commit as applied.
    pub fn complete(mut self) {
        self.completed = true;
        self.gate.finish(&self.id, self.token, true);
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.gate.finish(&self.id, self.token, false);
        }
    }
}
