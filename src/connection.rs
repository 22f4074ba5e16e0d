//! Connection task and its lifecycle handle
//!
//! One task per client owns the network link: it dials, exchanges
//! CONNECT/CONNACK, attaches the link to the [`DeliveryEngine`], feeds it
//! inbound bytes and sends keep-alive pings. A second task drains the
//! outbound channel into the stream. When the link drops the task reconnects
//! with exponential backoff and the engine replays what is still in flight.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rumqttc::{ConnAck, ConnectReturnCode, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, error, info, trace, warn};

use crate::client::{ConnectionEstablishmentError, Credentials, MqttClientError};
use crate::codec;
use crate::session::{DeliveryEngine, DeliveryError, DeliveryResult};
use crate::transport::{BoxedStream, ServerUri, TransportError, TransportFactory};

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
const READ_BUFFER_CAPACITY: usize = 4096;

/// Everything needed to (re)establish the link
pub(crate) struct Connector {
	pub(crate) factory: Arc<dyn TransportFactory>,
	pub(crate) uri: ServerUri,
	pub(crate) client_id: String,
	pub(crate) clean_session: bool,
	pub(crate) keep_alive_secs: u16,
	pub(crate) credentials: Option<Credentials>,
	pub(crate) connection_timeout: Duration,
	pub(crate) max_packet_size: usize,
}

/// A stream whose CONNACK has been read
pub(crate) struct Link {
	stream: BoxedStream,
	// bytes that arrived right behind the CONNACK
	buffer: BytesMut,
	pub(crate) session_present: bool,
}

impl Connector {
	/// Dials and completes the CONNECT/CONNACK exchange within the timeout
	pub(crate) async fn connect(&self) -> Result<Link, ConnectionEstablishmentError> {
		let timeout_millis =
			u64::try_from(self.connection_timeout.as_millis()).unwrap_or(u64::MAX);
		time::timeout(self.connection_timeout, self.establish_connection())
			.await
			.map_err(|_| ConnectionEstablishmentError::Timeout { timeout_millis })?
	}

	async fn establish_connection(&self) -> Result<Link, ConnectionEstablishmentError> {
		let mut stream = self.factory.connect(&self.uri).await?;
		let connect = codec::encode_connect(
			&self.client_id,
			self.keep_alive_secs,
			self.clean_session,
			self.credentials
				.as_ref()
				.map(|c| (c.username.as_str(), c.password.as_str())),
		)?;
		stream
			.write_all(&connect)
			.await
			.map_err(|err| TransportError::connect(self.uri.host_port(), err))?;

		let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
		loop {
			while let Some(packet) = codec::read_packet(&mut buffer, self.max_packet_size)? {
				match packet {
					| Packet::ConnAck(ConnAck {
						session_present,
						code,
					}) => {
						if code != ConnectReturnCode::Success {
							warn!(code = ?code, "Broker rejected CONNECT");
							return Err(ConnectionEstablishmentError::BrokerRejected {
								code,
							});
						}
						debug!(session_present, "CONNACK received");
						return Ok(Link {
							stream,
							buffer,
							session_present,
						});
					}
					| other => debug!(packet = ?other, "Ignoring packet before CONNACK"),
				}
			}
			let read = stream
				.read_buf(&mut buffer)
				.await
				.map_err(|err| TransportError::connect(self.uri.host_port(), err))?;
			if read == 0 {
				return Err(TransportError::Closed.into());
			}
		}
	}
}

/// Why a link stopped being served
enum LinkOutcome {
	Shutdown,
	Lost(String),
	Fatal(DeliveryError),
}

impl From<DeliveryError> for LinkOutcome {
	fn from(err: DeliveryError) -> Self {
		if err.is_fatal() {
			LinkOutcome::Fatal(err)
		} else {
			LinkOutcome::Lost(err.to_string())
		}
	}
}

/// Connection task: serves the link, reconnects when it drops and stops on
/// shutdown, on a fatal session error or after too many failed reconnects.
///
/// `ready` receives the outcome of the first attach.
pub(crate) async fn run(
	engine: Arc<DeliveryEngine>,
	connector: Connector,
	link: Link,
	mut shutdown_rx: oneshot::Receiver<()>,
	ready: oneshot::Sender<DeliveryResult<()>>,
	max_reconnect_attempts: u32,
) {
	let mut link = link;
	let mut ready = Some(ready);
	loop {
		match serve(&engine, &connector, link, &mut shutdown_rx, &mut ready).await {
			| LinkOutcome::Shutdown => break,
			| LinkOutcome::Fatal(err) => {
				error!(
					error = %err,
					error_type = err.error_type(),
					"Session failed, stopping connection task"
				);
				if let Some(ready) = ready.take() {
					let _ = ready.send(Err(err));
				}
				break;
			}
			| LinkOutcome::Lost(reason) => {
				warn!(reason = %reason, "MQTT connection lost");
			}
		}
		link = match reconnect(&connector, &mut shutdown_rx, max_reconnect_attempts)
			.await
		{
			| Some(link) => link,
			| None => break,
		};
	}
	engine.detach();
	info!("MQTT event loop terminated");
}

async fn reconnect(
	connector: &Connector,
	shutdown_rx: &mut oneshot::Receiver<()>,
	max_attempts: u32,
) -> Option<Link> {
	let mut error_count: u32 = 0;
	loop {
		if error_count >= max_attempts {
			error!(
				error_count,
				max_errors = max_attempts,
				"Too many consecutive errors, terminating event loop"
			);
			return None;
		}
		error_count += 1;

		let delay = INITIAL_RETRY_DELAY * 2_u32.pow((error_count - 1).min(10));
		let delay = delay.min(MAX_RETRY_DELAY);
		warn!(delay = ?delay, error_count, "Retrying MQTT connection");

		tokio::select! {
			_ = &mut *shutdown_rx => return None,
			_ = time::sleep(delay) => {}
		}
		tokio::select! {
			_ = &mut *shutdown_rx => return None,
			result = connector.connect() => match result {
				| Ok(link) => {
					info!(session_present = link.session_present, "Reconnected to MQTT broker");
					return Some(link);
				}
				| Err(err) => error!(
					error_count,
					error = %err,
					error_type = err.error_type(),
					"MQTT reconnect failed"
				),
			},
		}
	}
}

async fn serve(
	engine: &DeliveryEngine,
	connector: &Connector,
	link: Link,
	shutdown_rx: &mut oneshot::Receiver<()>,
	ready: &mut Option<oneshot::Sender<DeliveryResult<()>>>,
) -> LinkOutcome {
	let Link {
		stream,
		mut buffer,
		session_present,
	} = link;
	let (mut reader, writer) = tokio::io::split(stream);
	let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();
	let writer_handle = tokio::spawn(write_loop(writer, outbound_rx));

	let attached = engine
		.attach(Arc::new(outbound_tx.clone()), session_present)
		.and_then(|_| engine.on_packet_received(&mut buffer));
	if let Err(err) = attached {
		engine.detach();
		writer_handle.abort();
		return err.into();
	}
	if let Some(ready) = ready.take() {
		let _ = ready.send(Ok(()));
	}

	let mut keep_alive = (connector.keep_alive_secs > 0).then(|| {
		let period = Duration::from_secs(connector.keep_alive_secs.into());
		time::interval_at(Instant::now() + period, period)
	});
	let mut ping_outstanding = false;

	let outcome = loop {
		tokio::select! {
			_ = &mut *shutdown_rx => {
				debug!("Shutdown requested, sending DISCONNECT");
				let _ = outbound_tx.send(Bytes::from_static(&codec::DISCONNECT));
				break LinkOutcome::Shutdown;
			}
			_ = tick(&mut keep_alive) => {
				if ping_outstanding {
					break LinkOutcome::Lost("no response within keep-alive".to_string());
				}
				ping_outstanding = true;
				if outbound_tx.send(Bytes::from_static(&codec::PINGREQ)).is_err() {
					break LinkOutcome::Lost("writer stopped".to_string());
				}
				trace!("PINGREQ sent");
			}
			read = reader.read_buf(&mut buffer) => match read {
				| Ok(0) => break LinkOutcome::Lost("connection closed by broker".to_string()),
				| Ok(_) => {
					ping_outstanding = false;
					if let Err(err) = engine.on_packet_received(&mut buffer) {
						break err.into();
					}
				}
				| Err(err) => break LinkOutcome::Lost(err.to_string()),
			},
		}
	};

	engine.detach();
	drop(outbound_tx);
	match outcome {
		| LinkOutcome::Shutdown => {
			if let Err(err) = writer_handle.await {
				warn!(error = %err, "Writer task failed");
			}
		}
		| _ => writer_handle.abort(),
	}
	outcome
}

async fn tick(interval: &mut Option<Interval>) {
	match interval {
		| Some(interval) => {
			interval.tick().await;
		}
		| None => std::future::pending::<()>().await,
	}
}

/// Writes queued packets until every sender is gone, then shuts the stream
/// down.
async fn write_loop(
	mut writer: WriteHalf<BoxedStream>,
	mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
	while let Some(packet) = outbound.recv().await {
		if let Err(err) = writer.write_all(&packet).await {
			warn!(error = %err, "Failed to write packet");
			return;
		}
		if let Err(err) = writer.flush().await {
			warn!(error = %err, "Failed to flush stream");
			return;
		}
	}
	if let Err(err) = writer.shutdown().await {
		debug!(error = %err, "Stream shutdown failed");
	}
}

/// Lifecycle handle for the connection task.
///
/// Call [`shutdown`](Self::shutdown) before dropping it.
pub struct MqttConnection {
	engine: Arc<DeliveryEngine>,
	shutdown_tx: Option<oneshot::Sender<()>>,
	event_loop_handle: Option<JoinHandle<()>>,
	dispatcher_handle: Option<JoinHandle<()>>,
}

impl MqttConnection {
	pub(crate) fn new(
		engine: Arc<DeliveryEngine>,
		shutdown_tx: oneshot::Sender<()>,
		event_loop_handle: JoinHandle<()>,
		dispatcher_handle: JoinHandle<()>,
	) -> Self {
		Self {
			engine,
			shutdown_tx: Some(shutdown_tx),
			event_loop_handle: Some(event_loop_handle),
			dispatcher_handle: Some(dispatcher_handle),
		}
	}

	/// Returns true while a transport is attached
	pub fn is_connected(&self) -> bool {
		self.engine.is_attached()
	}

	/// Returns true once the connection task has stopped
	pub fn is_finished(&self) -> bool {
		self.event_loop_handle
			.as_ref()
			.is_none_or(|handle| handle.is_finished())
	}

	/// Gracefully shutdown the MQTT client by:
	/// 1. Signalling the connection task, which sends DISCONNECT and drains
	///    the writer
	/// 2. Waiting for the connection task to finish
	/// 3. Closing the session (persisted messages are kept) and letting the
	///    dispatcher deliver what is already queued
	pub async fn shutdown(mut self) -> Result<(), MqttClientError> {
		if let Some(shutdown_tx) = self.shutdown_tx.take() {
			if shutdown_tx.send(()).is_err() {
				debug!("Connection task already stopped");
			}
		} else {
			warn!("No shutdown channel available");
		}

		if let Some(handle) = self.event_loop_handle.take() {
			if let Err(e) = handle.await {
				warn!(error = %e, "Event loop task failed");
			}
		} else {
			warn!("No event loop handle available to await");
		}

		let closed = self.engine.close();

		if let Some(handle) = self.dispatcher_handle.take() {
			if let Err(e) = handle.await {
				warn!(error = %e, "Message dispatcher task failed");
			}
		}

		closed?;
		Ok(())
	}
}

impl Drop for MqttConnection {
	fn drop(&mut self) {
		if self.shutdown_tx.is_some() || self.event_loop_handle.is_some() {
			error!(
				"MqttConnection dropped without calling shutdown(). Please \
				 call shutdown() and await its completion before dropping."
			);
		}
	}
}
