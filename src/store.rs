use anyhow::Result;
use async_trait::async_trait;

use crate::{
    relay::RelayState,
    supabase::models::{
        ActivationClose, DeviceRecord, DeviceSnapshot, NewActivation, PendingCommand, RowId,
    },
};

/// The backend operations the control loop depends on.
///
/// The production implementation is [`crate::supabase::SupabaseClient`].
#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Point read of the device row.
    async fn fetch_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Read the pending command fields of the device row.
    async fn fetch_command(&self, device_id: &str) -> Result<Option<PendingCommand>>;

    /// Null out `command` and `command_user_id`, optionally recording the
    /// relay state that resulted from the command.
    async fn clear_command(&self, device_id: &str, state: Option<RelayState>) -> Result<()>;

    /// Create-or-update the device row keyed by `snapshot.id`.
    async fn upsert_device(&self, snapshot: &DeviceSnapshot) -> Result<()>;

    /// Insert a history row. `Ok(None)` means the insert succeeded but the
    /// backend did not hand back the new id.
    async fn open_activation(&self, record: &NewActivation) -> Result<Option<RowId>>;

    /// Id of the newest history row for `machine_id`.
    async fn latest_activation(&self, machine_id: &str) -> Result<Option<RowId>>;

    async fn close_activation(&self, id: &RowId, update: &ActivationClose) -> Result<()>;
}
