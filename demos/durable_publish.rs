//! Publishes a few QoS2 readings on a durable session.
//!
//! Configure with `MQTT_BROKER`, `MQTT_CLIENT_ID` and `MQTT_PERSISTENCE_DIR`
//! (a `.env` file works too). Kill the process mid-run and start it again:
//! unacknowledged readings are replayed before the new ones.

use std::time::Duration;

use mqtt_durable_client::logging::init_logging_from_env;
use mqtt_durable_client::{Message, MqttClient, MqttClientConfig, QoS, TransportRegistry};
use tokio::time;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	init_logging_from_env("info,mqtt_durable_client=debug")?;

	let mut config = MqttClientConfig::from_env()?;
	if config.settings.persistence_dir.is_none() {
		config = config.with_persistence_dir("./mqtt-session");
	}

	let (client, connection) = MqttClient::connect_with_config(
		config,
		TransportRegistry::with_defaults(),
		|message: Message| {
			info!(topic = %message.topic, payload = ?message.payload, "Received");
		},
	)
	.await?;

	client.subscribe([("demo/readings/#", QoS::ExactlyOnce)]).await?;

	for reading in 0..5u32 {
		let topic = format!("demo/readings/{reading}");
		let token = client.publish(topic, reading.to_string(), QoS::ExactlyOnce, false)?;
		match time::timeout(Duration::from_secs(5), token).await {
			| Ok(Ok(receipt)) => info!(message_id = ?receipt.message_id, "Delivered"),
			| Ok(Err(err)) => warn!(error = %err, "Delivery failed"),
			| Err(_) => warn!(reading, "No acknowledgement yet, kept for replay"),
		}
	}

	connection.shutdown().await?;
	Ok(())
}
