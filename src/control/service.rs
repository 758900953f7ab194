use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};
use tracing::{error, info, warn};

use super::session::{round_to, Session, SessionState};
use crate::{
    relay::{RelayBank, RelayState},
    sensors::{self, TemperatureSensor},
    store::MachineStore,
    supabase::models::{
        ActivationClose, ActivationStatus, DeviceSnapshot, DeviceStatus, NewActivation, RowId,
        SensorFields, SessionFields,
    },
};

/// Handle shared between the main loop and the message-bus task. Every relay
/// or session mutation happens while holding this lock.
pub type SharedControl = Arc<Mutex<ControlService>>;

/// What an `apply` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Stopped,
    Unchanged,
}

/// Relay state machine plus activation-history bookkeeping.
pub struct ControlService {
    device_id: String,
    power_kw: f64,
    relays: RelayBank,
    sensor: Option<Box<dyn TemperatureSensor>>,
    store: Arc<dyn MachineStore>,
    state: SessionState,
}

impl ControlService {
    pub fn new(
        device_id: String,
        power_kw: f64,
        relays: RelayBank,
        sensor: Option<Box<dyn TemperatureSensor>>,
        store: Arc<dyn MachineStore>,
    ) -> Self {
        Self {
            device_id,
            power_kw,
            relays,
            sensor,
            store,
            state: SessionState::default(),
        }
    }

    pub fn into_shared(self) -> SharedControl {
        Arc::new(Mutex::new(self))
    }

    pub fn relay_state(&self) -> RelayState {
        self.state.relay()
    }

    pub fn usage_hours(&self) -> f64 {
        self.state.usage_hours
    }

    pub fn seed_usage_hours(&mut self, hours: f64) {
        if hours.is_finite() && hours >= 0.0 {
            self.state.usage_hours = hours;
        }
    }

    /// Move the relays to `target`. Requests for the current state are no-ops.
    ///
    /// Fails only when the relays could not be energized; history write
    /// failures are logged and otherwise ignored.
    pub async fn apply(&mut self, target: RelayState, operator: Option<String>) -> Result<Transition> {
        match (self.relay_state(), target) {
            (RelayState::Off, RelayState::On) => self.start(operator).await,
            (RelayState::On, RelayState::Off) => self.stop().await,
            _ => Ok(Transition::Unchanged),
        }
    }

    async fn start(&mut self, operator: Option<String>) -> Result<Transition> {
        if let Err(e) = self.relays.drive(RelayState::On) {
            if let Err(e) = self.relays.drive(RelayState::Off) {
                error!(error = %e, "Failed to release relays after a failed start");
            }
            return Err(e).context("failed to energize relays");
        }

        let mut session = Session::new(None, operator);
        info!(
            device_id = %self.device_id,
            operator = ?session.operator,
            channels = self.relays.channels(),
            "Motors on"
        );

        let record = NewActivation {
            machine_id: self.device_id.clone(),
            user_id: session.operator.clone(),
            command: RelayState::On,
            started_at: session.started_at,
            status: ActivationStatus::InProgress,
        };
        session.activation_id = open_history(self.store.as_ref(), &record).await;

        self.state.session = Some(session);
        Ok(Transition::Started)
    }

    async fn stop(&mut self) -> Result<Transition> {
        // Leave the in-memory state off even if the write failed; the safety
        // refresh keeps retrying the outputs every tick.
        if let Err(e) = self.relays.drive(RelayState::Off) {
            error!(error = %e, "Failed to release relays; will retry on next tick");
        }

        let Some(session) = self.state.session.take() else {
            return Ok(Transition::Unchanged);
        };

        let now = Instant::now();
        let elapsed = session.elapsed(now);
        let duration_minutes = session.minutes(now);
        let energy_kwh = session.energy_kwh(now, self.power_kw);
        let average_temperature = session.temperatures.mean().map(|t| round_to(t, 1));
        self.state.usage_hours += elapsed.as_secs_f64() / 3600.0;

        info!(
            device_id = %self.device_id,
            duration_minutes,
            energy_kwh,
            samples = session.temperatures.len(),
            average_temperature = ?average_temperature,
            "Motors off"
        );

        match session.activation_id {
            Some(id) => {
                let update = ActivationClose {
                    ended_at: Utc::now(),
                    status: ActivationStatus::Completed,
                    duration_minutes,
                    energy_kwh,
                    average_temperature,
                };
                if let Err(e) = self.store.close_activation(&id, &update).await {
                    error!(activation_id = %id, error = %e, "Failed to close activation record");
                }
            }
            None => warn!("Session had no activation record; nothing to close"),
        }

        Ok(Transition::Stopped)
    }

    /// Re-drive outputs that drifted away from the in-memory state.
    pub fn enforce_hardware(&mut self) {
        let state = self.relay_state();
        match self.relays.enforce(state) {
            Ok(0) => {}
            Ok(n) => warn!(corrected = n, state = %state, "Relay outputs drifted; re-driven"),
            Err(e) => error!(error = %e, "Relay safety refresh failed"),
        }
    }

    /// Drive everything inactive without touching session state. Used at
    /// startup before any command is processed.
    pub fn release_outputs(&mut self) -> Result<()> {
        self.relays
            .drive(RelayState::Off)
            .context("failed to drive relays inactive")
    }

    /// Turn the motors off automatically `after` from now. Ignored when idle.
    pub fn arm_auto_off(&mut self, after: Duration) {
        if let Some(session) = self.state.session.as_mut() {
            session.auto_off_at = Some(Instant::now() + after);
            info!(after_secs = after.as_secs(), "Auto-off armed");
        }
    }

    /// Stop the session if its auto-off deadline has passed.
    pub async fn expire_auto_off(&mut self, now: Instant) -> Option<Transition> {
        let deadline = self.state.session.as_ref()?.auto_off_at?;
        if now < deadline {
            return None;
        }
        info!("Auto-off deadline reached");
        match self.apply(RelayState::Off, None).await {
            Ok(t) => Some(t),
            Err(e) => {
                error!(error = %e, "Auto-off failed");
                None
            }
        }
    }

    /// Take one temperature sample into the running session's buffer.
    pub fn record_sample(&mut self) {
        let Some(sensor) = self.sensor.as_deref_mut() else {
            return;
        };
        let Some(session) = self.state.session.as_mut() else {
            return;
        };
        if let Some(celsius) = sensors::sample(sensor) {
            session.temperatures.push(celsius);
        }
    }

    /// Heartbeat row for the current moment.
    pub fn snapshot(&mut self, status: DeviceStatus) -> DeviceSnapshot {
        let now = Instant::now();
        let state = self.relay_state();
        let sensor = self.sensor.as_deref_mut().map(|s| SensorFields {
            temperature: sensors::sample(s),
        });

        let session = match &self.state.session {
            Some(s) => SessionFields {
                session_duration: s.minutes(now),
                session_energy: s.energy_kwh(now, self.power_kw),
                current_user_id: s.operator.clone(),
            },
            None => SessionFields {
                session_duration: 0,
                session_energy: 0.0,
                current_user_id: None,
            },
        };

        let running_hours = self
            .state
            .session
            .as_ref()
            .map_or(0.0, |s| s.elapsed(now).as_secs_f64() / 3600.0);

        DeviceSnapshot {
            id: self.device_id.clone(),
            state,
            status,
            last_seen: Utc::now(),
            sensor,
            usage_hours: Some(round_to(self.state.usage_hours + running_hours, 2)),
            session: Some(session),
        }
    }

    /// Force the motors off, closing any open session.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.apply(RelayState::Off, None).await {
            error!(error = %e, "Failed to stop motors during shutdown");
        }
        if let Err(e) = self.release_outputs() {
            error!(error = %e, "Failed to release relays during shutdown");
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&Session> {
        self.state.session.as_ref()
    }
}

/// Insert the history row; fall back to looking up the newest row when the
/// insert did not return an id. Failures leave the session without a record.
async fn open_history(store: &dyn MachineStore, record: &NewActivation) -> Option<RowId> {
    match store.open_activation(record).await {
        Ok(Some(id)) => {
            info!(activation_id = %id, "Activation record opened");
            Some(id)
        }
        Ok(None) => match store.latest_activation(&record.machine_id).await {
            Ok(id) => {
                if id.is_none() {
                    warn!("Activation insert returned no id and none could be found");
                }
                id
            }
            Err(e) => {
                error!(error = %e, "Failed to look up activation record");
                None
            }
        },
        Err(e) => {
            error!(error = %e, "Failed to open activation record");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use embedded_hal::digital::{ErrorType, OutputPin, StatefulOutputPin};

    use super::*;
    use crate::{
        relay::{
            gpio::{GpioError, SimulatedPin},
            RelayPin,
        },
        sensors::stub::ScriptedSensor,
        store::memory::MemoryStore,
    };

    pub const DEVICE: &str = "12";
    pub const POWER_KW: f64 = 2.4;

    /// Output whose driver refuses to go high.
    pub struct JammedPin;

    impl ErrorType for JammedPin {
        type Error = GpioError;
    }

    impl OutputPin for JammedPin {
        fn set_low(&mut self) -> Result<(), GpioError> {
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), GpioError> {
            Err(GpioError::BadValue {
                line: 0,
                value: "jammed".into(),
            })
        }
    }

    impl StatefulOutputPin for JammedPin {
        fn is_set_high(&mut self) -> Result<bool, GpioError> {
            Ok(false)
        }

        fn is_set_low(&mut self) -> Result<bool, GpioError> {
            Ok(true)
        }
    }

    /// One working channel and one jammed one.
    pub fn jammed_rig() -> Rig {
        let good = SimulatedPin::new(false);
        let bank = RelayBank::new(
            vec![Box::new(good.clone()) as RelayPin, Box::new(JammedPin)],
            true,
        );
        Rig::with_bank(bank, Outputs(vec![good]), None)
    }

    /// Test-side handles to the relay outputs.
    #[derive(Clone)]
    pub struct Outputs(pub Vec<SimulatedPin>);

    impl Outputs {
        pub fn on(&self) -> bool {
            self.0.iter().all(SimulatedPin::is_high)
        }

        pub fn off(&self) -> bool {
            self.0.iter().all(|p| !p.is_high())
        }
    }

    pub struct Rig {
        pub control: ControlService,
        pub store: Arc<MemoryStore>,
        pub outputs: Outputs,
    }

    impl Rig {
        /// Two active-high channels, optional sensor.
        pub fn new(sensor: Option<ScriptedSensor>) -> Self {
            let pins: Vec<_> = (0..2).map(|_| SimulatedPin::new(false)).collect();
            let bank = RelayBank::new(
                pins.iter().cloned().map(|p| Box::new(p) as RelayPin).collect(),
                true,
            );
            Self::with_bank(bank, Outputs(pins), sensor)
        }

        pub fn with_bank(bank: RelayBank, outputs: Outputs, sensor: Option<ScriptedSensor>) -> Self {
            let store = Arc::new(MemoryStore::new());
            let control = ControlService::new(
                DEVICE.to_owned(),
                POWER_KW,
                bank,
                sensor.map(|s| Box::new(s) as Box<dyn TemperatureSensor>),
                store.clone(),
            );
            Self { control, store, outputs }
        }

        pub fn shared(self) -> (SharedControl, Arc<MemoryStore>, Outputs) {
            (self.control.into_shared(), self.store, self.outputs)
        }
    }
}
