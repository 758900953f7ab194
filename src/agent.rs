use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    commands::poller::{poll_once, PollOutcome},
    config::{CommandSource, Config},
    control::{SharedControl, Transition},
    scheduler::Periodic,
    store::MachineStore,
    telemetry,
};

/// Loop cadences.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub tick: Duration,
    pub command_poll: Duration,
    pub telemetry: Duration,
    pub sampling: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: config.tick_interval,
            command_poll: config.command_poll_interval,
            telemetry: config.telemetry_interval,
            sampling: config.temp_sample_interval,
        }
    }
}

/// The control loop: one tick runs the safety refresh and whichever of the
/// poll, report and sample sub-tasks are due, each to completion.
pub struct Agent {
    device_id: String,
    source: CommandSource,
    period: Duration,
    control: SharedControl,
    store: Arc<dyn MachineStore>,
    command_poll: Periodic,
    telemetry: Periodic,
    sampling: Periodic,
}

impl Agent {
    pub fn new(
        device_id: String,
        source: CommandSource,
        schedule: Schedule,
        control: SharedControl,
        store: Arc<dyn MachineStore>,
    ) -> Self {
        Self {
            device_id,
            source,
            period: schedule.tick,
            control,
            store,
            command_poll: Periodic::new(schedule.command_poll),
            telemetry: Periodic::new(schedule.telemetry),
            sampling: Periodic::new(schedule.sampling),
        }
    }

    /// Park the outputs and load the persisted usage counter.
    ///
    /// Only a failure to drive the relays is fatal; the counter starts from
    /// zero if the device row cannot be read.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        control.release_outputs()?;

        match self.store.fetch_device(&self.device_id).await {
            Ok(Some(record)) => {
                if let Some(hours) = record.usage_hours {
                    control.seed_usage_hours(hours);
                }
                info!(
                    device_id = %self.device_id,
                    usage_hours = control.usage_hours(),
                    "Device row loaded"
                );
            }
            Ok(None) => info!(device_id = %self.device_id, "No device row yet; it will be created"),
            Err(e) => warn!(error = %e, "Failed to load device row; usage hours start at zero"),
        }
        Ok(())
    }

    /// Tick until `shutdown` resolves.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            device_id = %self.device_id,
            source = ?self.source,
            tick_ms = self.period.as_millis() as u64,
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                now = ticker.tick() => self.tick(now).await,
            }
        }
    }

    pub async fn tick(&mut self, now: Instant) {
        {
            let mut control = self.control.lock().await;
            control.enforce_hardware();
            if let Some(Transition::Stopped) = control.expire_auto_off(now).await {
                // Publish the stop without waiting for the next heartbeat.
                self.telemetry.reset();
            }
        }

        if self.source == CommandSource::Poll && self.command_poll.due(now) {
            match poll_once(&self.control, self.store.as_ref(), &self.device_id).await {
                Ok(PollOutcome::Applied { target, transition }) if transition != Transition::Unchanged => {
                    debug!(state = %target, "Relay switched by command; reporting now");
                    self.telemetry.reset();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Command poll failed"),
            }
        }

        if self.telemetry.due(now) {
            telemetry::report(&self.control, self.store.as_ref()).await;
        }

        let mut control = self.control.lock().await;
        if control.relay_state().is_on() {
            if self.sampling.due(now) {
                control.record_sample();
            }
        } else {
            self.sampling.reset();
        }
    }

    /// Force the motors off and send a best-effort offline status.
    pub async fn shutdown(&self) {
        info!("Shutting down; switching motors off");
        self.control.lock().await.shutdown().await;
        telemetry::report_offline(self.store.as_ref(), &self.device_id).await;
    }
}
