use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;

// Requests queued between two event loop turns; simple format emits one per value
const REQUEST_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(default = "MqttConfig::default_keep_alive", with = "humantime_serde")]
    keep_alive: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "jkbms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("jkbms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.qos()?;
        Ok(config)
    }

    fn qos(&self) -> Result<QoS> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            qos => anyhow::bail!("Invalid MQTT QoS {qos}, expected 0, 1 or 2"),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// Drives the connection; rumqttc reconnects on the next poll after an error.
async fn drive_event_loop(mut event_loop: EventLoop, reconnect_delay: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                log::info!("Connected to MQTT broker: {:?}", ack.code);
            }
            Ok(event) => log::trace!("MQTT event: {event:?}"),
            Err(e) => {
                log::error!("MQTT connection error: {e}, retrying in {reconnect_delay:?}");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    config: MqttConfig,
}

impl MqttPublisher {
    /// Must be called from within the tokio runtime; the event loop is spawned onto it.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.qos()?;
        let (client, event_loop) = AsyncClient::new(config.mqtt_options(), REQUEST_CHANNEL_CAPACITY);
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        tokio::spawn(drive_event_loop(event_loop, config.reconnect_delay));
        Ok(Self {
            client,
            qos,
            config,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Queues the message without waiting, a full queue is reported as an error.
    pub fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={:?}",
            topic,
            self.qos
        );

        self.client
            .try_publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))?;

        Ok(())
    }
}
