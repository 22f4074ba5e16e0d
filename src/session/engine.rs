use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use arcstr::ArcStr;
use bytes::{Bytes, BytesMut};
use rumqttc::{Packet, Publish, QoS, SubAck, SubscribeReasonCode};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::dispatch::SubscriptionRegistry;
use super::error::{DeliveryError, DeliveryResult, ProtocolError};
use super::inflight::{
	Direction, HandshakeEvent, HandshakeState, InflightEntry, InflightTable,
};
use super::record::{self, RecordHeader};
use super::{DeliveryReceipt, GrantedQos, Message, Session};
use crate::codec::{self, DEFAULT_MAX_PACKET_SIZE};
use crate::persistence::{PersistenceError, PersistenceResult, PersistentStore};
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::PacketSink;

/// Outbound QoS1/QoS2 messages allowed in flight by default
pub const DEFAULT_MAX_INFLIGHT: u16 = 10;

/// Tuning for a [`DeliveryEngine`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
	/// Outbound QoS1/QoS2 publishes allowed in flight at once
	pub max_inflight: u16,
	/// Largest inbound packet accepted
	pub max_packet_size: usize,
	/// Accept `$share/<group>/<filter>` subscriptions
	pub shared_subscriptions: bool,
}

impl Default for EngineOptions {
	fn default() -> Self {
		Self {
			max_inflight: DEFAULT_MAX_INFLIGHT,
			max_packet_size: DEFAULT_MAX_PACKET_SIZE,
			shared_subscriptions: true,
		}
	}
}

type PublishReply = oneshot::Sender<DeliveryResult<DeliveryReceipt>>;
type SubscribeReply = oneshot::Sender<DeliveryResult<Vec<GrantedQos>>>;
type UnsubscribeReply = oneshot::Sender<DeliveryResult<()>>;

/// SUBSCRIBE or UNSUBSCRIBE waiting for its acknowledgement
enum ControlRequest {
	Subscribe {
		filters: Vec<(String, QoS)>,
		// None for resubscriptions issued by the engine itself
		reply: Option<SubscribeReply>,
	},
	Unsubscribe {
		reply: UnsubscribeReply,
	},
}

impl ControlRequest {
	fn fail(self, err: DeliveryError) {
		match self {
			| ControlRequest::Subscribe {
				reply: Some(reply), ..
			} => {
				let _ = reply.send(Err(err));
			}
			| ControlRequest::Subscribe { reply: None, .. } => {}
			| ControlRequest::Unsubscribe { reply } => {
				let _ = reply.send(Err(err));
			}
		}
	}
}

/// Resolves when a QoS1/QoS2 publish completes its handshake.
///
/// QoS0 tokens are ready immediately. If the session is closed first the
/// token resolves to [`DeliveryError::SessionClosed`]; the message itself
/// stays persisted and is replayed when the session is reopened.
#[derive(Debug)]
#[must_use = "a DeliveryToken does nothing unless awaited"]
pub struct DeliveryToken {
	message_id: Option<u16>,
	state: TokenState,
}

#[derive(Debug)]
enum TokenState {
	Ready(Option<DeliveryResult<DeliveryReceipt>>),
	Pending(oneshot::Receiver<DeliveryResult<DeliveryReceipt>>),
}

impl DeliveryToken {
	fn ready(receipt: DeliveryReceipt) -> Self {
		Self {
			message_id: receipt.message_id,
			state: TokenState::Ready(Some(Ok(receipt))),
		}
	}

	fn pending(message_id: u16) -> (PublishReply, Self) {
		let (tx, rx) = oneshot::channel();
		let token = Self {
			message_id: Some(message_id),
			state: TokenState::Pending(rx),
		};
		(tx, token)
	}

	/// Packet identifier of the publish, `None` for QoS0
	pub fn message_id(&self) -> Option<u16> {
		self.message_id
	}
}

impl Future for DeliveryToken {
	type Output = DeliveryResult<DeliveryReceipt>;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match &mut self.get_mut().state {
			| TokenState::Ready(result) => {
				Poll::Ready(result.take().unwrap_or(Err(DeliveryError::SessionClosed)))
			}
			| TokenState::Pending(rx) => Pin::new(rx)
				.poll(cx)
				.map(|result| result.unwrap_or(Err(DeliveryError::SessionClosed))),
		}
	}
}

/// Resolves when the broker answers a SUBSCRIBE or UNSUBSCRIBE.
#[derive(Debug)]
#[must_use = "a ResponseToken does nothing unless awaited"]
pub struct ResponseToken<T> {
	rx: oneshot::Receiver<DeliveryResult<T>>,
}

impl<T> Future for ResponseToken<T> {
	type Output = DeliveryResult<T>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		Pin::new(&mut self.rx)
			.poll(cx)
			.map(|result| result.unwrap_or(Err(DeliveryError::SessionClosed)))
	}
}

struct SessionState {
	session: Session,
	store: Box<dyn PersistentStore>,
	inflight: InflightTable,
	subscriptions: SubscriptionRegistry,
	waiters: HashMap<u16, PublishReply>,
	control: HashMap<u16, ControlRequest>,
	sink: Option<Arc<dyn PacketSink>>,
	next_sequence: u64,
	closed: bool,
}

/// QoS handshake engine for one session.
///
/// All state lives behind a single mutex shared by the send path
/// ([`publish`](Self::publish), [`subscribe`](Self::subscribe)) and the
/// receive path ([`on_packet_received`](Self::on_packet_received)). Packets
/// are handed to the attached [`PacketSink`] while the lock is held, so the
/// order on the wire matches the order of state changes.
///
/// Every outbound QoS1/QoS2 publish is persisted before it is sent and its
/// record is removed only once the handshake completes. Inbound QoS2
/// publishes are persisted until PUBREL so a restart between PUBREC and
/// PUBREL neither loses nor duplicates them.
pub struct DeliveryEngine {
	state: Mutex<SessionState>,
	options: EngineOptions,
}

impl DeliveryEngine {
	/// Opens the session on `store`.
	///
	/// A clean session clears the store; a durable one loads every record
	/// back into the inflight table, removing records that cannot be
	/// decoded. Inbound messages matching an active subscription are pushed
	/// to `messages`.
	pub fn open(
		session: Session,
		mut store: Box<dyn PersistentStore>,
		options: EngineOptions,
		messages: mpsc::UnboundedSender<Message>,
	) -> DeliveryResult<Self> {
		store.open(&session.store_key())?;

		let mut inflight = InflightTable::new(options.max_inflight);
		let next_sequence = if session.clean_session {
			store.clear()?;
			0
		} else {
			restore_inflight(&mut *store, &mut inflight)?
		};

		info!(
			client_id = %session.client_id,
			clean_session = session.clean_session,
			restored_outbound = inflight.len(Direction::Outbound),
			restored_inbound = inflight.len(Direction::Inbound),
			"Session opened"
		);

		Ok(Self {
			state: Mutex::new(SessionState {
				session,
				store,
				inflight,
				subscriptions: SubscriptionRegistry::new(messages),
				waiters: HashMap::new(),
				control: HashMap::new(),
				sink: None,
				next_sequence,
				closed: false,
			}),
			options,
		})
	}

	fn lock(&self) -> MutexGuard<'_, SessionState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Engine options
	pub fn options(&self) -> &EngineOptions {
		&self.options
	}

	/// Publishes a message.
	///
	/// QoS0 is sent straight away. QoS1/QoS2 get a packet id, are persisted,
	/// then sent; the returned token resolves when the handshake completes.
	/// Fails without creating any state if the topic is invalid, the window
	/// is full or no transport is attached.
	pub fn publish(
		&self,
		topic: impl Into<ArcStr>,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> DeliveryResult<DeliveryToken> {
		let message = Message::new(topic, payload, qos, retain);
		validate_topic_name(&message.topic)?;
		self.lock().publish(message)
	}

	/// Subscribes to every `(filter, qos)` pair.
	///
	/// Filters are active for dispatch as soon as the SUBSCRIBE is sent;
	/// those the broker rejects are dropped when the SUBACK arrives.
	pub fn subscribe<I, S>(
		&self,
		filters: I,
	) -> DeliveryResult<ResponseToken<Vec<GrantedQos>>>
	where
		I: IntoIterator<Item = (S, QoS)>,
		S: Into<String>,
	{
		let filters: Vec<(String, QoS)> = filters
			.into_iter()
			.map(|(filter, qos)| (filter.into(), qos))
			.collect();
		if filters.is_empty() {
			return Err(DeliveryError::NoFilters);
		}
		for (filter, _) in &filters {
			validate_topic_filter(filter, self.options.shared_subscriptions)?;
		}
		self.lock().subscribe(filters)
	}

	/// Unsubscribes from `filters`. Matching messages stop being delivered
	/// immediately.
	pub fn unsubscribe<I, S>(&self, filters: I) -> DeliveryResult<ResponseToken<()>>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let filters: Vec<String> = filters.into_iter().map(Into::into).collect();
		if filters.is_empty() {
			return Err(DeliveryError::NoFilters);
		}
		for filter in &filters {
			validate_topic_filter(filter, self.options.shared_subscriptions)?;
		}
		self.lock().unsubscribe(filters)
	}

	/// Processes every complete packet at the front of `buffer`.
	///
	/// Incomplete trailing bytes are left in place for the next read.
	/// Returns the number of packets handled.
	pub fn on_packet_received(&self, buffer: &mut BytesMut) -> DeliveryResult<usize> {
		let mut handled = 0;
		while let Some(packet) =
			codec::read_packet(buffer, self.options.max_packet_size)?
		{
			self.handle_packet(packet)?;
			handled += 1;
		}
		Ok(handled)
	}

	/// Processes one decoded packet.
	///
	/// Only persistence failures are returned; acknowledgements that do not
	/// fit their handshake are logged and dropped.
	pub fn handle_packet(&self, packet: Packet) -> DeliveryResult<()> {
		self.lock().handle_packet(packet)
	}

	/// Attaches a connected transport and replays unacknowledged work.
	///
	/// Outbound messages still waiting for PUBACK or PUBREC are re-sent as
	/// PUBLISH with DUP set, those past PUBREC get their PUBREL again, in the
	/// order they were first published. Inbound entries wait for the broker.
	/// When the broker kept no session, active filters are subscribed again.
	/// Returns the number of replayed packets.
	pub fn attach(
		&self,
		sink: Arc<dyn PacketSink>,
		session_present: bool,
	) -> DeliveryResult<usize> {
		let mut state = self.lock();
		state.ensure_open()?;
		state.sink = Some(sink);
		let replayed = state.replay()?;
		if !session_present {
			state.resubscribe()?;
		}
		info!(replayed, session_present, "Transport attached");
		Ok(replayed)
	}

	/// Detaches the transport after the connection dropped.
	///
	/// Pending SUBSCRIBE/UNSUBSCRIBE requests fail with
	/// [`DeliveryError::Disconnected`]. Publishes stay in flight.
	pub fn detach(&self) {
		let mut state = self.lock();
		if state.sink.take().is_some() {
			debug!("Transport detached");
		}
		state.fail_control_requests(DeliveryError::Disconnected);
	}

	/// Closes the session.
	///
	/// Persisted records are kept so a durable session resumes where it
	/// stopped. Waiting callers get [`DeliveryError::SessionClosed`].
	pub fn close(&self) -> DeliveryResult<()> {
		let mut state = self.lock();
		if state.closed {
			return Ok(());
		}
		state.closed = true;
		state.sink = None;
		state.fail_control_requests(DeliveryError::SessionClosed);
		state.subscriptions.close();
		for (_, reply) in state.waiters.drain() {
			let _ = reply.send(Err(DeliveryError::SessionClosed));
		}
		let in_flight = state.inflight.len(Direction::Outbound)
			+ state.inflight.len(Direction::Inbound);
		state.store.close()?;
		info!(
			client_id = %state.session.client_id,
			in_flight,
			"Session closed"
		);
		Ok(())
	}

	/// The session this engine serves
	pub fn session(&self) -> Session {
		self.lock().session.clone()
	}

	/// Number of live inflight entries in one direction
	pub fn inflight_count(&self, direction: Direction) -> usize {
		self.lock().inflight.len(direction)
	}

	/// Handshake state of one entry
	pub fn handshake_state(
		&self,
		message_id: u16,
		direction: Direction,
	) -> Option<HandshakeState> {
		self.lock()
			.inflight
			.get(message_id, direction)
			.map(|entry| entry.state)
	}

	/// Keys currently held by the store
	pub fn stored_keys(&self) -> DeliveryResult<BTreeSet<String>> {
		Ok(self.lock().store.keys()?)
	}

	/// Filters messages are currently dispatched for
	pub fn active_filters(&self) -> Vec<String> {
		self.lock()
			.subscriptions
			.filters()
			.into_iter()
			.map(|(filter, _)| filter)
			.collect()
	}

	/// Returns true while a transport is attached
	pub fn is_attached(&self) -> bool {
		self.lock().sink.is_some()
	}

	/// Returns true once [`close`](Self::close) has run
	pub fn is_closed(&self) -> bool {
		self.lock().closed
	}
}

impl fmt::Debug for DeliveryEngine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let state = self.lock();
		f.debug_struct("DeliveryEngine")
			.field("client_id", &state.session.client_id)
			.field("attached", &state.sink.is_some())
			.field("closed", &state.closed)
			.field("options", &self.options)
			.finish()
	}
}

fn restore_inflight(
	store: &mut dyn PersistentStore,
	inflight: &mut InflightTable,
) -> DeliveryResult<u64> {
	let mut next_sequence = 0;
	for key in store.keys()? {
		let Some((direction, message_id)) = record::parse_key(&key) else {
			warn!(key = %key, "Ignoring unrecognised persisted record");
			continue;
		};
		let entry = match restore_entry(store, &key, direction, message_id) {
			| Ok(Some(entry)) => entry,
			| Ok(None) => continue,
			// a record torn while first written was never sent
			| Err(err @ PersistenceError::Corrupt { .. }) => {
				warn!(key = %key, error = %err, "Removing corrupt persisted record");
				store.remove(&key)?;
				continue;
			}
			| Err(err) => return Err(err.into()),
		};
		debug!(
			key = %key,
			state = ?entry.state,
			sequence = entry.sequence,
			"Restored inflight message"
		);
		next_sequence = next_sequence.max(entry.sequence + 1);
		inflight.restore(entry)?;
	}
	Ok(next_sequence)
}

fn restore_entry(
	store: &dyn PersistentStore,
	key: &str,
	direction: Direction,
	message_id: u16,
) -> PersistenceResult<Option<InflightEntry>> {
	let Some(persisted) = store.get(key)? else {
		return Ok(None);
	};
	let header = RecordHeader::decode(key, &persisted.header)?;
	header
		.into_entry(key, direction, message_id, persisted.payload)
		.map(Some)
}

impl SessionState {
	fn ensure_open(&self) -> DeliveryResult<()> {
		if self.closed {
			Err(DeliveryError::SessionClosed)
		} else {
			Ok(())
		}
	}

	fn ensure_connected(&self) -> DeliveryResult<()> {
		self.ensure_open()?;
		if self.sink.is_none() {
			return Err(DeliveryError::NotConnected);
		}
		Ok(())
	}

	/// Hands a packet to the transport. A failed send is only logged: the
	/// connection is going down and replay on reconnect resends the work.
	fn emit(&self, packet: Bytes, kind: &'static str, message_id: u16) {
		let Some(sink) = &self.sink else {
			debug!(packet = kind, message_id, "No transport attached, packet not sent");
			return;
		};
		match sink.send_packet(packet) {
			| Ok(()) => trace!(packet = kind, message_id, "Packet sent"),
			| Err(err) => warn!(
				packet = kind,
				message_id,
				error = %err,
				"Failed to hand packet to transport"
			),
		}
	}

	fn persist(&mut self, entry: &InflightEntry) -> DeliveryResult<()> {
		let key = record::record_key(entry.direction, entry.message_id);
		let header = RecordHeader::from_entry(entry).encode(&key)?;
		self.store.put(&key, &header, &entry.message.payload)?;
		Ok(())
	}

	fn take_sequence(&mut self) -> u64 {
		let sequence = self.next_sequence;
		self.next_sequence += 1;
		sequence
	}

	fn publish(&mut self, mut message: Message) -> DeliveryResult<DeliveryToken> {
		self.ensure_connected()?;

		if message.qos == QoS::AtMostOnce {
			let packet = codec::encode_publish(
				&message.topic,
				&message.payload,
				QoS::AtMostOnce,
				message.retain,
				0,
				false,
			)?;
			if let Some(sink) = &self.sink {
				sink.send_packet(packet)?;
			}
			trace!(topic = %message.topic, "Published QoS0 message");
			return Ok(DeliveryToken::ready(DeliveryReceipt {
				message_id: None,
				qos: QoS::AtMostOnce,
			}));
		}

		let message_id = self.inflight.allocate_id(Direction::Outbound)?;
		message.message_id = Some(message_id);
		let packet = codec::encode_publish(
			&message.topic,
			&message.payload,
			message.qos,
			message.retain,
			message_id,
			false,
		)?;

		let entry = InflightEntry::new(
			message_id,
			Direction::Outbound,
			message,
			self.next_sequence,
		);
		self.persist(&entry)?;
		self.take_sequence();
		let topic = entry.message.topic.clone();
		let qos = entry.qos;
		if let Err(err) = self.inflight.insert(entry) {
			let _ = self.store.remove(&record::outbound_key(message_id));
			return Err(err.into());
		}

		let (reply, token) = DeliveryToken::pending(message_id);
		self.waiters.insert(message_id, reply);
		self.emit(packet, "PUBLISH", message_id);
		debug!(message_id, topic = %topic, qos = ?qos, "Published message");
		Ok(token)
	}

	fn subscribe(
		&mut self,
		filters: Vec<(String, QoS)>,
	) -> DeliveryResult<ResponseToken<Vec<GrantedQos>>> {
		self.ensure_connected()?;
		let message_id = self.inflight.allocate_control_id()?;
		let packet = match codec::encode_subscribe(message_id, &filters) {
			| Ok(packet) => packet,
			| Err(err) => {
				self.inflight.release_control_id(message_id);
				return Err(err.into());
			}
		};

		for (filter, qos) in &filters {
			self.subscriptions.activate(filter, *qos);
		}
		debug!(message_id, filters = ?filters, "Subscribing");
		let (reply, rx) = oneshot::channel();
		self.control.insert(
			message_id,
			ControlRequest::Subscribe {
				filters,
				reply: Some(reply),
			},
		);
		self.emit(packet, "SUBSCRIBE", message_id);
		Ok(ResponseToken { rx })
	}

	fn unsubscribe(
		&mut self,
		filters: Vec<String>,
	) -> DeliveryResult<ResponseToken<()>> {
		self.ensure_connected()?;
		let message_id = self.inflight.allocate_control_id()?;
		let packet = match codec::encode_unsubscribe(message_id, &filters) {
			| Ok(packet) => packet,
			| Err(err) => {
				self.inflight.release_control_id(message_id);
				return Err(err.into());
			}
		};

		for filter in &filters {
			self.subscriptions.deactivate(filter);
		}
		debug!(message_id, filters = ?filters, "Unsubscribing");
		let (reply, rx) = oneshot::channel();
		self.control
			.insert(message_id, ControlRequest::Unsubscribe { reply });
		self.emit(packet, "UNSUBSCRIBE", message_id);
		Ok(ResponseToken { rx })
	}

	fn replay(&mut self) -> DeliveryResult<usize> {
		let mut replayed = 0;
		for entry in self.inflight.in_send_order(Direction::Outbound) {
			let (packet, kind) = match entry.state {
				| HandshakeState::AwaitingPubAck | HandshakeState::AwaitingPubRec => (
					codec::encode_publish(
						&entry.message.topic,
						&entry.message.payload,
						entry.qos,
						entry.message.retain,
						entry.message_id,
						true,
					)?,
					"PUBLISH",
				),
				| HandshakeState::AwaitingPubComp => {
					(codec::encode_pubrel(entry.message_id)?, "PUBREL")
				}
				| HandshakeState::AwaitingPubRel | HandshakeState::Complete => {
					continue;
				}
			};
			debug!(message_id = entry.message_id, packet = kind, "Replaying");
			self.emit(packet, kind, entry.message_id);
			replayed += 1;
		}
		Ok(replayed)
	}

	fn resubscribe(&mut self) -> DeliveryResult<()> {
		if self.subscriptions.is_empty() {
			return Ok(());
		}
		let filters = self.subscriptions.filters();
		let message_id = self.inflight.allocate_control_id()?;
		let packet = match codec::encode_subscribe(message_id, &filters) {
			| Ok(packet) => packet,
			| Err(err) => {
				self.inflight.release_control_id(message_id);
				return Err(err.into());
			}
		};
		info!(count = filters.len(), "Broker kept no session, resubscribing");
		self.control.insert(
			message_id,
			ControlRequest::Subscribe {
				filters,
				reply: None,
			},
		);
		self.emit(packet, "SUBSCRIBE", message_id);
		Ok(())
	}

	fn fail_control_requests(&mut self, err: DeliveryError) {
		for (message_id, request) in mem::take(&mut self.control) {
			self.inflight.release_control_id(message_id);
			request.fail(err.clone());
		}
	}

	fn handle_packet(&mut self, packet: Packet) -> DeliveryResult<()> {
		if self.closed {
			debug!("Session closed, ignoring packet");
			return Ok(());
		}
		match packet {
			| Packet::Publish(publish) => self.on_publish(publish),
			| Packet::PubAck(ack) => self.on_outbound_ack(ack.pkid, HandshakeEvent::PubAck),
			| Packet::PubRec(rec) => self.on_outbound_ack(rec.pkid, HandshakeEvent::PubRec),
			| Packet::PubComp(comp) => {
				self.on_outbound_ack(comp.pkid, HandshakeEvent::PubComp)
			}
			| Packet::PubRel(rel) => self.on_pubrel(rel.pkid),
			| Packet::SubAck(suback) => {
				self.on_suback(suback);
				Ok(())
			}
			| Packet::UnsubAck(unsuback) => {
				self.on_unsuback(unsuback.pkid);
				Ok(())
			}
			| other => {
				trace!(packet = ?other, "Ignoring packet");
				Ok(())
			}
		}
	}

	fn on_publish(&mut self, publish: Publish) -> DeliveryResult<()> {
		let message = Message::from_publish(&publish);
		let message_id = publish.pkid;
		match publish.qos {
			| QoS::AtMostOnce => {
				self.subscriptions.deliver(message);
			}
			| QoS::AtLeastOnce => {
				self.subscriptions.deliver(message);
				self.emit(codec::encode_puback(message_id)?, "PUBACK", message_id);
			}
			| QoS::ExactlyOnce => {
				if self.inflight.contains(message_id, Direction::Inbound) {
					debug!(message_id, "Duplicate QoS2 publish, resending PUBREC");
				} else {
					let mut entry = InflightEntry::new(
						message_id,
						Direction::Inbound,
						message,
						self.next_sequence,
					);
					entry.matched = self.subscriptions.matches(&entry.message.topic);
					if !entry.matched {
						debug!(
							message_id,
							topic = %entry.message.topic,
							"QoS2 publish matches no active subscription"
						);
					}
					self.persist(&entry)?;
					self.take_sequence();
					self.inflight.insert(entry)?;
				}
				self.emit(codec::encode_pubrec(message_id)?, "PUBREC", message_id);
			}
		}
		Ok(())
	}

	fn on_outbound_ack(
		&mut self,
		message_id: u16,
		event: HandshakeEvent,
	) -> DeliveryResult<()> {
		let previous = self
			.inflight
			.get(message_id, Direction::Outbound)
			.map(|entry| entry.state);
		let next = match self.inflight.advance(message_id, Direction::Outbound, event)
		{
			| Ok(next) => next,
			| Err(err) => {
				warn!(message_id, error = %err, "Discarding acknowledgement");
				return Ok(());
			}
		};

		match next {
			| HandshakeState::AwaitingPubComp => {
				if previous == Some(HandshakeState::AwaitingPubRec) {
					let entry = self
						.inflight
						.get(message_id, Direction::Outbound)
						.cloned();
					if let Some(entry) = entry {
						self.persist(&entry)?;
					}
				} else {
					debug!(message_id, "Repeated PUBREC, resending PUBREL");
				}
				self.emit(codec::encode_pubrel(message_id)?, "PUBREL", message_id);
				Ok(())
			}
			| HandshakeState::Complete => self.complete_outbound(message_id),
			| _ => Ok(()),
		}
	}

	fn complete_outbound(&mut self, message_id: u16) -> DeliveryResult<()> {
		self.store.remove(&record::outbound_key(message_id))?;
		let Some(entry) = self.inflight.remove(message_id, Direction::Outbound)
		else {
			return Ok(());
		};
		if let Some(reply) = self.waiters.remove(&message_id) {
			let _ = reply.send(Ok(DeliveryReceipt {
				message_id: Some(message_id),
				qos: entry.qos,
			}));
		}
		debug!(message_id, qos = ?entry.qos, "Outbound delivery complete");
		Ok(())
	}

	fn on_pubrel(&mut self, message_id: u16) -> DeliveryResult<()> {
		match self
			.inflight
			.advance(message_id, Direction::Inbound, HandshakeEvent::PubRel)
		{
			| Ok(_) => {
				let released = self
					.inflight
					.get(message_id, Direction::Inbound)
					.filter(|entry| entry.matched)
					.map(|entry| entry.message.clone());
				if let Some(message) = released {
					self.subscriptions.release(message);
				}
				self.emit(codec::encode_pubcomp(message_id)?, "PUBCOMP", message_id);
				self.store.remove(&record::inbound_key(message_id))?;
				self.inflight.remove(message_id, Direction::Inbound);
				debug!(message_id, "Inbound delivery complete");
			}
			| Err(ProtocolError::UnknownMessageId { .. }) => {
				debug!(message_id, "PUBREL for unknown id, answering PUBCOMP");
				self.emit(codec::encode_pubcomp(message_id)?, "PUBCOMP", message_id);
			}
			| Err(err) => {
				warn!(message_id, error = %err, "Discarding PUBREL");
			}
		}
		Ok(())
	}

	fn on_suback(&mut self, suback: SubAck) {
		let message_id = suback.pkid;
		let Some(request) = self.control.remove(&message_id) else {
			warn!(message_id, "SUBACK for unknown request");
			return;
		};
		match request {
			| ControlRequest::Subscribe { filters, reply } => {
				self.inflight.release_control_id(message_id);
				let mut granted = Vec::with_capacity(filters.len());
				for (index, (filter, _)) in filters.iter().enumerate() {
					match suback.return_codes.get(index) {
						| Some(SubscribeReasonCode::Success(qos)) => {
							granted.push(GrantedQos::Granted(*qos));
						}
						| _ => {
							warn!(filter = %filter, "Broker rejected subscription");
							self.subscriptions.deactivate(filter);
							granted.push(GrantedQos::Rejected);
						}
					}
				}
				debug!(message_id, granted = ?granted, "Subscription acknowledged");
				if let Some(reply) = reply {
					let _ = reply.send(Ok(granted));
				}
			}
			| request @ ControlRequest::Unsubscribe { .. } => {
				warn!(message_id, "SUBACK received for an UNSUBSCRIBE");
				self.control.insert(message_id, request);
			}
		}
	}

	fn on_unsuback(&mut self, message_id: u16) {
		let Some(request) = self.control.remove(&message_id) else {
			warn!(message_id, "UNSUBACK for unknown request");
			return;
		};
		match request {
			| ControlRequest::Unsubscribe { reply } => {
				self.inflight.release_control_id(message_id);
				debug!(message_id, "Unsubscribe acknowledged");
				let _ = reply.send(Ok(()));
			}
			| request @ ControlRequest::Subscribe { .. } => {
				warn!(message_id, "UNSUBACK received for a SUBSCRIBE");
				self.control.insert(message_id, request);
			}
		}
	}
}
