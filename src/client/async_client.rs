use std::sync::Arc;
use std::time::Duration;

use arcstr::ArcStr;
use bytes::Bytes;
use rumqttc::QoS;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use super::config::MqttClientConfig;
use super::error::MqttClientError;
use super::handler::{MessageHandler, dispatch_messages};
use crate::connection::{Connector, MqttConnection, run};
use crate::session::{
	DeliveryEngine, DeliveryReceipt, DeliveryToken, Direction, GrantedQos,
};
use crate::transport::{ServerUri, TransportError, TransportRegistry};

/// Handle for publishing and subscribing on a durable session.
///
/// Cheap to clone; every clone drives the same session. The connection
/// itself is owned by the [`MqttConnection`] returned next to it.
#[derive(Clone, Debug)]
pub struct MqttClient {
	engine: Arc<DeliveryEngine>,
}

impl MqttClient {
	/// Connects to `url` over the default transports.
	///
	/// See [`MqttClientConfig::from_url`] for the accepted URL parameters.
	pub async fn connect<H: MessageHandler>(
		url: &str,
		handler: H,
	) -> Result<(Self, MqttConnection), MqttClientError> {
		let config = MqttClientConfig::from_url(url)?;
		Self::connect_with_config(config, TransportRegistry::with_defaults(), handler)
			.await
	}

	/// Opens the session, connects and starts the connection task.
	///
	/// The persisted session is opened first, so a failed first connect
	/// leaves it untouched. Once connected, unacknowledged messages from a
	/// previous run are replayed before this returns.
	pub async fn connect_with_config<H: MessageHandler>(
		config: MqttClientConfig,
		registry: TransportRegistry,
		handler: H,
	) -> Result<(Self, MqttConnection), MqttClientError> {
		let uri = ServerUri::parse(&config.server_uri)?;
		let factory = registry.get(uri.scheme()).ok_or_else(|| {
			TransportError::UnsupportedScheme {
				scheme: uri.scheme().to_string(),
			}
		})?;
		let keep_alive_secs = config.keep_alive_secs()?;

		let (messages_tx, messages_rx) = mpsc::unbounded_channel();
		let engine = Arc::new(DeliveryEngine::open(
			config.session(),
			config.create_store(),
			config.engine_options(),
			messages_tx,
		)?);

		let connector = Connector {
			factory,
			uri,
			client_id: config.client_id.clone(),
			clean_session: config.clean_session,
			keep_alive_secs,
			credentials: config.credentials.clone(),
			connection_timeout: Duration::from_millis(
				config.settings.connection_timeout_millis,
			),
			max_packet_size: config.settings.max_packet_size,
		};

		let link = match connector.connect().await {
			| Ok(link) => link,
			| Err(err) => {
				error!(
					error = %err,
					error_type = err.error_type(),
					server_uri = %config.server_uri,
					"Initial MQTT connection failed"
				);
				if let Err(close_err) = engine.close() {
					error!(error = %close_err, "Failed to close session");
				}
				return Err(err.into());
			}
		};
		info!(
			client_id = %config.client_id,
			server_uri = %config.server_uri,
			session_present = link.session_present,
			"Connected to MQTT broker"
		);

		let dispatcher_handle = tokio::spawn(dispatch_messages(messages_rx, handler));
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let (ready_tx, ready_rx) = oneshot::channel();
		let event_loop_handle = tokio::spawn(run(
			engine.clone(),
			connector,
			link,
			shutdown_rx,
			ready_tx,
			config.settings.max_reconnect_attempts,
		));

		let connection = MqttConnection::new(
			engine.clone(),
			shutdown_tx,
			event_loop_handle,
			dispatcher_handle,
		);
		// first attach replays persisted messages and may hit the store
		if let Ok(Err(err)) = ready_rx.await {
			if let Err(shutdown_err) = connection.shutdown().await {
				error!(error = %shutdown_err, "Failed to shut down connection");
			}
			return Err(err.into());
		}
		Ok((Self { engine }, connection))
	}

	/// Publishes a message.
	///
	/// Returns once the message is persisted and handed to the connection;
	/// await the token for the broker's acknowledgement.
	pub fn publish(
		&self,
		topic: impl Into<ArcStr>,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<DeliveryToken, MqttClientError> {
		Ok(self.engine.publish(topic, payload, qos, retain)?)
	}

	/// Publishes and waits for the handshake to complete
	pub async fn publish_and_wait(
		&self,
		topic: impl Into<ArcStr>,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Result<DeliveryReceipt, MqttClientError> {
		Ok(self.publish(topic, payload, qos, retain)?.await?)
	}

	/// Subscribes and waits for the SUBACK.
	///
	/// Returns the broker's answer for each filter, in request order.
	pub async fn subscribe<I, S>(
		&self,
		filters: I,
	) -> Result<Vec<GrantedQos>, MqttClientError>
	where
		I: IntoIterator<Item = (S, QoS)>,
		S: Into<String>,
	{
		Ok(self.engine.subscribe(filters)?.await?)
	}

	/// Unsubscribes and waits for the UNSUBACK
	pub async fn unsubscribe<I, S>(&self, filters: I) -> Result<(), MqttClientError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Ok(self.engine.unsubscribe(filters)?.await?)
	}

	/// Returns true while a transport is attached
	pub fn is_connected(&self) -> bool {
		self.engine.is_attached()
	}

	/// Outbound messages waiting for acknowledgement
	pub fn pending_messages(&self) -> usize {
		self.engine.inflight_count(Direction::Outbound)
	}

	/// The underlying delivery engine
	pub fn engine(&self) -> &Arc<DeliveryEngine> {
		&self.engine
	}
}
