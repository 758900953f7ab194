use std::fmt;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::relay::RelayState;

// ---------------------------------------------------------------------------
// Error envelope
//
// PostgREST reports failures with a JSON body alongside a non-2xx status:
//
//   { "code": "PGRST116", "message": "...", "details": "...", "hint": null }
//
// Every field may be missing or null, and gateways in front of PostgREST
// sometimes answer with plain text instead.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct PostgrestError {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl PostgrestError {
    /// Build an error from a failed response. Falls back to the raw body when
    /// it is not a PostgREST envelope.
    pub fn from_response(status: StatusCode, body: &[u8]) -> anyhow::Error {
        match serde_json::from_slice::<PostgrestError>(body) {
            Ok(e) if e.code.is_some() || e.message.is_some() => e.into_error(status),
            _ => anyhow!(
                "backend returned {status}: {}",
                String::from_utf8_lossy(body).trim()
            ),
        }
    }

    pub fn into_error(self, status: StatusCode) -> anyhow::Error {
        let mut msg = format!(
            "backend returned {status}: code={}, message={}",
            self.code.as_deref().unwrap_or("-"),
            self.message.as_deref().unwrap_or("(no message)")
        );
        if let Some(details) = self.details {
            msg.push_str(&format!(", details={details}"));
        }
        if let Some(hint) = self.hint {
            msg.push_str(&format!(", hint={hint}"));
        }
        anyhow!(msg)
    }
}

// ---------------------------------------------------------------------------
// RowId
//
// Primary keys are `bigint` in some deployments and `uuid`/`text` in others.
// Bool is not a valid key, so integer is tried first and text second.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Integer(i64),
    Text(String),
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Integer(v) => write!(f, "{v}"),
            RowId::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IdRow {
    pub id: RowId,
}

// ---------------------------------------------------------------------------
// Device row: /rest/v1/machines
// ---------------------------------------------------------------------------

/// Heartbeat status of the device row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// The part of the device row the agent reads back at startup.
///
/// Rows are edited by hand and by the dashboard, so the column may be
/// missing or null.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub usage_hours: Option<f64>,
}

/// `select=command,command_user_id`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PendingCommand {
    pub command: Option<String>,
    pub command_user_id: Option<String>,
}

/// PATCH body that consumes a pending command.
///
/// `command` and `command_user_id` are always written as `null`; `state` is
/// only included when the command was applied.
#[derive(Debug, Serialize)]
pub struct ClearCommand {
    pub command: Option<String>,
    pub command_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RelayState>,
}

impl ClearCommand {
    pub fn new(state: Option<RelayState>) -> Self {
        Self {
            command: None,
            command_user_id: None,
            state,
        }
    }
}

/// Upsert body for the device row.
///
/// The optional groups are flattened so that a device without a sensor never
/// touches the `temperature` column, and the offline notice sent at shutdown
/// leaves the session columns alone.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub state: RelayState,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(flatten)]
    pub sensor: Option<SensorFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_hours: Option<f64>,
    #[serde(flatten)]
    pub session: Option<SessionFields>,
}

impl DeviceSnapshot {
    /// Minimal row written at shutdown.
    pub fn offline(device_id: &str) -> Self {
        Self {
            id: device_id.to_owned(),
            state: RelayState::Off,
            status: DeviceStatus::Offline,
            last_seen: Utc::now(),
            sensor: None,
            usage_hours: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorFields {
    /// `null` when the sensor is present but the reading was unusable.
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionFields {
    /// Whole minutes of the running session, 0 when idle.
    pub session_duration: i64,
    /// kWh consumed by the running session, 0 when idle.
    pub session_energy: f64,
    pub current_user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Activation history: /rest/v1/activation_history
// ---------------------------------------------------------------------------

/// History row status, in the column values the dashboard filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationStatus {
    #[serde(rename = "em_andamento")]
    InProgress,
    #[serde(rename = "concluído")]
    Completed,
}

/// Row inserted when the motors start.
#[derive(Debug, Clone, Serialize)]
pub struct NewActivation {
    pub machine_id: String,
    pub user_id: Option<String>,
    pub command: RelayState,
    pub started_at: DateTime<Utc>,
    pub status: ActivationStatus,
}

/// PATCH body that finalizes a history row when the motors stop.
#[derive(Debug, Clone, Serialize)]
pub struct ActivationClose {
    pub ended_at: DateTime<Utc>,
    pub status: ActivationStatus,
    pub duration_minutes: i64,
    #[serde(rename = "consumo_kwh")]
    pub energy_kwh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_temperature: Option<f64>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            id: "12".into(),
            state: RelayState::On,
            status: DeviceStatus::Online,
            last_seen: "2026-01-01T00:00:00Z".parse().unwrap(),
            sensor: None,
            usage_hours: None,
            session: None,
        }
    }

    #[test]
    fn snapshot_without_optional_groups_omits_columns() {
        let v = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(
            v,
            json!({
                "id": "12",
                "state": "on",
                "status": "online",
                "last_seen": "2026-01-01T00:00:00Z",
            })
        );
    }

    #[test]
    fn snapshot_with_failed_sensor_writes_null_temperature() {
        let mut s = snapshot();
        s.sensor = Some(SensorFields { temperature: None });
        let v = serde_json::to_value(s).unwrap();
        assert!(v.as_object().unwrap().contains_key("temperature"));
        assert!(v["temperature"].is_null());
    }

    #[test]
    fn snapshot_with_session_flattens_fields() {
        let mut s = snapshot();
        s.usage_hours = Some(3.5);
        s.session = Some(SessionFields {
            session_duration: 4,
            session_energy: 0.16,
            current_user_id: None,
        });
        let v = serde_json::to_value(s).unwrap();
        assert_eq!(v["session_duration"], 4);
        assert_eq!(v["session_energy"], 0.16);
        assert_eq!(v["usage_hours"], 3.5);
        assert!(v["current_user_id"].is_null());
    }

    #[test]
    fn offline_notice_is_minimal() {
        let v = serde_json::to_value(DeviceSnapshot::offline("pi-1")).unwrap();
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(v["status"], "offline");
        assert_eq!(v["state"], "off");
    }

    #[test]
    fn clear_command_nulls_fields_and_optionally_sets_state() {
        let v = serde_json::to_value(ClearCommand::new(None)).unwrap();
        assert_eq!(v, json!({ "command": null, "command_user_id": null }));

        let v = serde_json::to_value(ClearCommand::new(Some(RelayState::On))).unwrap();
        assert_eq!(v["state"], "on");
    }

    #[test]
    fn row_id_accepts_integer_and_text_keys() {
        let rows: Vec<IdRow> = serde_json::from_str(r#"[{"id": 42}, {"id": "a1b2"}]"#).unwrap();
        assert_eq!(rows[0].id, RowId::Integer(42));
        assert_eq!(rows[1].id, RowId::Text("a1b2".into()));
        assert_eq!(rows[0].id.to_string(), "42");
    }

    #[test]
    fn pending_command_tolerates_missing_columns() {
        let p: PendingCommand = serde_json::from_str(r#"{"command": "ON "}"#).unwrap();
        assert_eq!(p.command.as_deref(), Some("ON "));
        assert!(p.command_user_id.is_none());
    }

    #[test]
    fn activation_status_wire_names() {
        assert_eq!(
            serde_json::to_value(ActivationStatus::InProgress).unwrap(),
            "em_andamento"
        );
        assert_eq!(
            serde_json::to_value(ActivationStatus::Completed).unwrap(),
            "concluído"
        );
        let parsed: ActivationStatus = serde_json::from_str("\"concluído\"").unwrap();
        assert_eq!(parsed, ActivationStatus::Completed);
    }

    #[test]
    fn activation_close_uses_history_columns() {
        let close = ActivationClose {
            ended_at: "2024-05-01T10:01:30Z".parse().unwrap(),
            status: ActivationStatus::Completed,
            duration_minutes: 1,
            energy_kwh: 0.04,
            average_temperature: None,
        };
        let v = serde_json::to_value(&close).unwrap();
        assert_eq!(v["consumo_kwh"], 0.04);
        assert_eq!(v["duration_minutes"], 1);
        assert_eq!(v["status"], "concluído");
        assert!(v.get("energy_kwh").is_none());
        assert!(v.get("average_temperature").is_none());
    }

    #[test]
    fn postgrest_error_envelope_is_reported() {
        let body = br#"{"code":"42501","message":"permission denied","details":null,"hint":"check RLS"}"#;
        let err = PostgrestError::from_response(StatusCode::FORBIDDEN, body);
        let msg = err.to_string();
        assert!(msg.contains("403"));
        assert!(msg.contains("42501"));
        assert!(msg.contains("permission denied"));
        assert!(msg.contains("check RLS"));
    }

    #[test]
    fn non_json_error_body_falls_back_to_text() {
        let err = PostgrestError::from_response(StatusCode::BAD_GATEWAY, b"upstream down\n");
        assert!(err.to_string().contains("upstream down"));
    }
}
