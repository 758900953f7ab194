use tracing::{debug, info, warn};

use crate::{
    control::SharedControl,
    store::MachineStore,
    supabase::models::{DeviceSnapshot, DeviceStatus},
};

/// Upsert the heartbeat row. Best-effort: failures are logged and reported
/// as `false`, never propagated.
pub async fn report(control: &SharedControl, store: &dyn MachineStore) -> bool {
    // Build under the lock, send without it.
    let snapshot = control.lock().await.snapshot(DeviceStatus::Online);

    match store.upsert_device(&snapshot).await {
        Ok(()) => {
            debug!(
                device_id = %snapshot.id,
                state = %snapshot.state,
                temperature = ?snapshot.sensor.and_then(|s| s.temperature),
                "Heartbeat sent"
            );
            true
        }
        Err(e) => {
            warn!(device_id = %snapshot.id, error = %e, "Heartbeat failed");
            false
        }
    }
}

/// Final status write on shutdown.
pub async fn report_offline(store: &dyn MachineStore, device_id: &str) -> bool {
    match store.upsert_device(&DeviceSnapshot::offline(device_id)).await {
        Ok(()) => {
            info!(device_id, "Reported offline");
            true
        }
        Err(e) => {
            warn!(device_id, error = %e, "Failed to report offline");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        commands::poller::poll_once,
        control::service::testing::{Rig, DEVICE},
        relay::RelayState,
        sensors::stub::ScriptedSensor,
    };

    #[tokio::test]
    async fn idle_report_is_online_and_off() {
        let (control, store, _) = Rig::new(None).shared();

        assert!(report(&control, store.as_ref()).await);
        let snap = store.last_upsert().unwrap();
        assert_eq!(snap.id, DEVICE);
        assert_eq!(snap.state, RelayState::Off);
        assert_eq!(snap.status, DeviceStatus::Online);
        assert!(snap.sensor.is_none());
    }

    #[tokio::test]
    async fn report_after_on_command_shows_on() {
        let (control, store, _) = Rig::new(Some(ScriptedSensor::constant(22.5))).shared();
        store.set_command("on", Some("user-3"));
        poll_once(&control, store.as_ref(), DEVICE).await.unwrap();

        assert!(report(&control, store.as_ref()).await);
        let snap = store.last_upsert().unwrap();
        assert_eq!(snap.state, RelayState::On);
        assert_eq!(snap.sensor.unwrap().temperature, Some(22.5));
        assert_eq!(
            snap.session.unwrap().current_user_id.as_deref(),
            Some("user-3")
        );
    }

    #[tokio::test]
    async fn sensor_fault_reports_null_temperature() {
        let (control, store, _) = Rig::new(Some(ScriptedSensor::new([None]))).shared();

        assert!(report(&control, store.as_ref()).await);
        let snap = store.last_upsert().unwrap();
        assert_eq!(snap.sensor.unwrap().temperature, None);
    }

    #[tokio::test]
    async fn upsert_failure_is_swallowed() {
        let (control, store, _) = Rig::new(None).shared();
        store.fail_writes.store(true, Ordering::SeqCst);

        assert!(!report(&control, store.as_ref()).await);
        assert!(!report_offline(store.as_ref(), DEVICE).await);
        assert!(store.state().upserts.is_empty());
    }

    #[tokio::test]
    async fn offline_report_is_minimal() {
        let (_, store, _) = Rig::new(None).shared();

        assert!(report_offline(store.as_ref(), DEVICE).await);
        let snap = store.last_upsert().unwrap();
        assert_eq!(snap.status, DeviceStatus::Offline);
        assert_eq!(snap.state, RelayState::Off);
        assert!(snap.session.is_none());
        assert!(snap.usage_hours.is_none());
    }
}
