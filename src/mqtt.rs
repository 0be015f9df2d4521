use crate::prelude::*;
use crate::command::InvalidInput;
use crate::coordinator::BridgeStats;
use crate::unit::port::RunFlag;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PUBLISH_ATTEMPTS: u32 = 3;

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePayload {
    pub addr: String,
    pub state: Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(deserialize_with = "de_status")]
    pub status: String,
}

// accept both "5" and 5
fn de_status<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected status {}", other))),
    }
}

impl Message {
    pub fn json<T: Serialize>(topic: &str, payload: &T) -> Result<Message> {
        Ok(Message {
            topic: topic.to_owned(),
            retain: false,
            payload: serde_json::to_string(payload)?,
        })
    }

    /// `info/state` event for one channel.
    pub fn for_state(addr: &ChannelAddress, state: ChannelState) -> Result<Message> {
        Self::json(
            "info/state",
            &StatePayload {
                addr: addr.to_string(),
                state: Status {
                    status: state.status(),
                },
            },
        )
    }

    pub fn for_insulation(addr: &ChannelAddress, value: &str) -> Message {
        Message {
            topic: "response/insulation".to_owned(),
            retain: false,
            payload: format!("{} {}", addr, value),
        }
    }

    pub fn for_error(text: &str) -> Message {
        Message {
            topic: "info/error".to_owned(),
            retain: false,
            payload: text.to_owned(),
        }
    }

    /// Rejected request, kept apart from failures of accepted commands.
    pub fn for_invalid_input(text: &str) -> Message {
        Message {
            topic: "info/invalid_input".to_owned(),
            retain: false,
            payload: text.to_owned(),
        }
    }

    pub fn for_failure(err: &anyhow::Error) -> Message {
        if InvalidInput::is(err) {
            Self::for_invalid_input(&err.to_string())
        } else {
            Self::for_error(&err.to_string())
        }
    }

    pub fn to_command(&self) -> Result<Command> {
        match self.topic.as_str() {
            "cmd/state" => {
                let payload: StatePayload = serde_json::from_str(&self.payload).map_err(|err| {
                    InvalidInput::wrap(anyhow!("bad state command {:?}: {}", self.payload, err))
                })?;

                Ok(Command::SetChannelState {
                    addr: payload.addr,
                    status: payload.state.status,
                })
            }
            "request/insulation" => Ok(Command::MeasureInsulation {
                addr: self.payload.trim().to_owned(),
            }),
            _ => Err(InvalidInput::wrap(anyhow!("unhandled: {:?}", self))),
        }
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    running: RunFlag,
    shared_stats: Arc<Mutex<BridgeStats>>,
}

impl Mqtt {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        running: RunFlag,
        shared_stats: Arc<Mutex<BridgeStats>>,
    ) -> Self {
        Self {
            config,
            channels,
            running,
            shared_stats,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = &self.config;

        if !c.mqtt().enabled() {
            info!("mqtt disabled, discarding outbound messages");
            return self.discard().await;
        }

        let mut options = MqttOptions::new("axiom-bridge", c.mqtt().host(), c.mqtt().port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.mqtt().username(), c.mqtt().password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.mqtt().host(), c.mqtt().port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    // stand-in for the client loops, so the task only ends on shutdown
    async fn discard(&self) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();

        while self.running.is_running() {
            match receiver.recv().await {
                Ok(ChannelData::Shutdown) => break,
                Ok(ChannelData::Message(message)) => trace!("discarding {}", message.topic),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => bail!("to_mqtt closed: {}", err),
            }
        }

        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        let namespace = self.config.mqtt().namespace().to_owned();

        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        for topic in ["cmd/state", "request/insulation"] {
            client
                .subscribe(format!("{}/{}", namespace, topic), QoS::AtMostOnce)
                .await?;
        }

        Ok(())
    }

    // mqtt -> coordinator
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        while self.running.is_running() {
            if let Ok(event) = tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.handle_message(publish)?;
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("mqtt connected");
                    }
                    Err(e) => {
                        if self.running.is_running() {
                            error!("{}", e);
                            info!("reconnecting in 5s");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                    _ => {} // keepalives etc
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        let namespace = self.config.mqtt().namespace().to_owned();

        // remove the namespace, including the first /
        let topic = match publish
            .topic
            .strip_prefix(namespace.as_str())
            .and_then(|t| t.strip_prefix('/'))
        {
            Some(topic) => topic.to_owned(),
            None => {
                warn!("ignoring message outside namespace: {}", publish.topic);
                return Ok(());
            }
        };

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            let message = match receiver.recv().await {
                Ok(Message(message)) => message,
                Ok(Shutdown) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline").await;
                    let _ = client.disconnect().await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                    continue;
                }
                Err(err) => bail!("to_mqtt closed: {}", err),
            };

            let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
            debug!("publishing: {} = {}", topic, message.payload);

            for attempt in 1..=PUBLISH_ATTEMPTS {
                match client
                    .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                    .await
                {
                    Ok(_) => {
                        self.stats().bus_messages_sent += 1;
                        break;
                    }
                    Err(err) => {
                        error!(
                            "MQTT publish failed: {:?} (attempt {}/{})",
                            err, attempt, PUBLISH_ATTEMPTS
                        );
                        self.stats().bus_errors += 1;
                        if attempt < PUBLISH_ATTEMPTS {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn stats(&self) -> std::sync::MutexGuard<'_, BridgeStats> {
        self.shared_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
