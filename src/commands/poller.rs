use anyhow::{Context, Result};
use tracing::{error, info, warn};

use super::parse_action;
use crate::{
    control::{SharedControl, Transition},
    relay::RelayState,
    store::MachineStore,
    supabase::models::PendingCommand,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// No pending command.
    Idle,
    Applied {
        target: RelayState,
        transition: Transition,
    },
    /// Known verb, but the relays could not be switched.
    Rejected,
    /// Unrecognized verb; consumed without action.
    Unknown,
}

/// Read the pending command once, act on it and consume it.
///
/// Consumption is best-effort and not transactional: a command written by
/// someone else between the read and the clear is lost, and a crash in that
/// window replays the command on restart.
pub async fn poll_once(
    control: &SharedControl,
    store: &dyn MachineStore,
    device_id: &str,
) -> Result<PollOutcome> {
    let pending = store
        .fetch_command(device_id)
        .await
        .context("failed to read pending command")?;

    let Some(PendingCommand {
        command: Some(raw),
        command_user_id,
    }) = pending
    else {
        return Ok(PollOutcome::Idle);
    };
    if raw.is_empty() {
        return Ok(PollOutcome::Idle);
    }

    let (outcome, echo) = match parse_action(&raw) {
        Some(target) => {
            let mut control = control.lock().await;
            let outcome = match control.apply(target, command_user_id.clone()).await {
                Ok(transition) => {
                    info!(
                        command = %raw,
                        operator = ?command_user_id,
                        ?transition,
                        "Command applied"
                    );
                    PollOutcome::Applied { target, transition }
                }
                Err(e) => {
                    error!(command = %raw, error = %e, "Command could not be applied");
                    PollOutcome::Rejected
                }
            };
            (outcome, Some(control.relay_state()))
        }
        None => {
            warn!(command = %raw, "Unknown command; discarding");
            (PollOutcome::Unknown, None)
        }
    };

    store
        .clear_command(device_id, echo)
        .await
        .context("failed to clear pending command")?;

    Ok(outcome)
}
