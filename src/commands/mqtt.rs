use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::parse_action;
use crate::{
    config::MqttConfig,
    control::{SharedControl, Transition},
    relay::RelayState,
    store::MachineStore,
    telemetry,
};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Payload published on the device's command topic.
///
/// The dashboard's edge function sends `{"acao": "LIGAR", "duracao_s": 300}`;
/// the English keys are accepted as well.
#[derive(Debug, Deserialize)]
pub struct BusCommand {
    #[serde(alias = "acao")]
    pub action: String,
    /// Seconds after which an activation switches itself off.
    #[serde(default, alias = "duracao_s")]
    pub duration: Option<u64>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl BusCommand {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).context("malformed command payload")
    }
}

/// Apply one bus message and report the resulting state right away.
pub async fn handle_message(
    control: &SharedControl,
    store: &dyn MachineStore,
    payload: &[u8],
) -> Result<Transition> {
    let cmd = BusCommand::decode(payload)?;
    let target = parse_action(&cmd.action)
        .ok_or_else(|| anyhow!("unknown action {:?}", cmd.action))?;

    let transition = {
        let mut control = control.lock().await;
        let transition = control.apply(target, cmd.user_id.clone()).await?;
        if target == RelayState::On {
            if let Some(secs) = cmd.duration.filter(|&s| s > 0) {
                control.arm_auto_off(Duration::from_secs(secs));
            }
        }
        transition
    };
    info!(
        action = %cmd.action,
        duration = ?cmd.duration,
        operator = ?cmd.user_id,
        ?transition,
        "Bus command applied"
    );

    telemetry::report(control, store).await;
    Ok(transition)
}

fn options(config: &MqttConfig, device_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(format!("vacuum-agent-{device_id}"), &config.host, config.port);
    options.set_keep_alive(KEEP_ALIVE);
    if let Some(user) = &config.username {
        options.set_credentials(user, config.password.as_deref().unwrap_or_default());
    }
    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

/// Running subscription to the command topic.
pub struct CommandBus {
    client: AsyncClient,
    task: JoinHandle<()>,
}

impl CommandBus {
    /// Connect and start handling messages on a background task.
    ///
    /// The subscription is re-issued on every `ConnAck`, so it survives
    /// broker restarts. Connection errors are logged and retried after a
    /// short pause.
    pub fn spawn(
        config: &MqttConfig,
        device_id: &str,
        control: SharedControl,
        store: Arc<dyn MachineStore>,
    ) -> Self {
        let (client, mut eventloop) = AsyncClient::new(options(config, device_id), 10);
        let topic = config.command_topic.clone();
        let subscriber = client.clone();

        info!(host = %config.host, port = config.port, topic = %topic, "Message bus starting");

        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if p.topic != topic {
                            warn!(topic = %p.topic, "Message on unexpected topic; ignoring");
                            continue;
                        }
                        if let Err(e) = handle_message(&control, store.as_ref(), &p.payload).await {
                            warn!(error = %e, "Bus command rejected");
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Message bus connected");
                        if let Err(e) = subscriber.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                            error!(topic = %topic, error = %e, "Subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("Message bus disconnected"),
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Message bus connection error");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self { client, task }
    }

    pub async fn stop(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Message bus disconnect failed");
        }
        self.task.abort();
    }
}
