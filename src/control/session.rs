use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::{reading_buffer::TemperatureBuffer, relay::RelayState, supabase::models::RowId};

/// Whole minutes in `elapsed`, truncated (90 s → 1).
pub fn whole_minutes(elapsed: Duration) -> i64 {
    (elapsed.as_secs() / 60) as i64
}

/// Energy used by `minutes` of run time at `power_kw`, rounded to 4 decimals.
pub fn energy_kwh(minutes: i64, power_kw: f64) -> f64 {
    round_to(minutes as f64 / 60.0 * power_kw, 4)
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// One continuous run of the motors.
#[derive(Debug)]
pub struct Session {
    /// History row id; `None` if the backend insert failed.
    pub activation_id: Option<RowId>,
    pub operator: Option<String>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub temperatures: TemperatureBuffer,
    /// Turn the motors off once this instant passes.
    pub auto_off_at: Option<Instant>,
}

impl Session {
    pub fn new(activation_id: Option<RowId>, operator: Option<String>) -> Self {
        Self {
            activation_id,
            operator,
            started: Instant::now(),
            started_at: Utc::now(),
            temperatures: TemperatureBuffer::new(),
            auto_off_at: None,
        }
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn minutes(&self, now: Instant) -> i64 {
        whole_minutes(self.elapsed(now))
    }

    pub fn energy_kwh(&self, now: Instant, power_kw: f64) -> f64 {
        energy_kwh(self.minutes(now), power_kw)
    }
}

/// All mutable process state of the agent.
///
/// The relay is on exactly when a session is open, so the relay state is
/// derived rather than stored.
#[derive(Debug, Default)]
pub struct SessionState {
    pub session: Option<Session>,
    /// Accumulated motor run time, seeded from the device row at startup.
    pub usage_hours: f64,
}

impl SessionState {
    pub fn relay(&self) -> RelayState {
        if self.session.is_some() {
            RelayState::On
        } else {
            RelayState::Off
        }
    }
}
