//! Task (session) staging on a handle.
//!
//! While the VM is powered off, task changes are persistent and land in
//! `sessions`; once it runs they only apply to the current boot and land in
//! `execs`. Every change marks the handle for reconfiguration.

use tracing::debug;

use super::handle::Handle;
use crate::backend::PowerState;
use crate::error::{Error, Result};
use crate::executor::SessionConfig;

fn is_ephemeral(handle: &Handle) -> bool {
    handle
        .base()
        .power_state()
        .is_some_and(|p| p != PowerState::PoweredOff)
}

/// Adds `session` to the handle's task set.
pub fn join(handle: &mut Handle, session: SessionConfig) -> Result<()> {
    if session.id.is_empty() {
        return Err(Error::InvalidInput("task id cannot be empty".into()));
    }
    let ephemeral = is_ephemeral(handle);
    let config = handle.exec_config_mut();
    let tasks = if ephemeral {
        &mut config.execs
    } else {
        &mut config.sessions
    };
    if tasks.contains_key(&session.id) {
        return Err(Error::InvalidInput(format!(
            "task {} already exists",
            session.id
        )));
    }
    debug!(id = %session.id, ephemeral, "joining task");
    tasks.insert(session.id.clone(), session);
    handle.reload();
    Ok(())
}

/// Enables launching of task `id`.
pub fn bind(handle: &mut Handle, id: &str) -> Result<()> {
    toggle_active(handle, id, true)
}

/// Disables launching of task `id`.
pub fn unbind(handle: &mut Handle, id: &str) -> Result<()> {
    toggle_active(handle, id, false)
}

fn toggle_active(handle: &mut Handle, id: &str, active: bool) -> Result<()> {
    let ephemeral = is_ephemeral(handle);
    let config = handle.exec_config_mut();
    let tasks = if ephemeral {
        debug!(id = %id, "task configuration applies to ephemeral set");
        &mut config.execs
    } else {
        &mut config.sessions
    };

    let task = tasks.get_mut(id).ok_or_else(|| {
        Error::NotFound(format!(
            "unknown {} task ID: {id}",
            if ephemeral { "ephemeral" } else { "persistent" }
        ))
    })?;
    task.active = active;
    handle.reload();
    Ok(())
}
