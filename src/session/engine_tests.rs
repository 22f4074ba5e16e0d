use std::collections::BTreeSet;
use std::mem;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use rumqttc::{
	Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, SubAck,
	SubscribeReasonCode, UnsubAck,
};
use tokio::sync::mpsc;

use super::engine::{DeliveryEngine, EngineOptions};
use super::error::DeliveryError;
use super::inflight::{Direction, HandshakeState};
use super::record::RecordHeader;
use super::{DeliveryReceipt, GrantedQos, Message, Session};
use crate::codec::{self, DEFAULT_MAX_PACKET_SIZE};
use crate::persistence::{
	MemoryPersistence, PersistedRecord, PersistenceError, PersistenceResult,
	PersistentStore,
};
use crate::transport::{PacketSink, TransportError};

/// Sink that keeps every packet for inspection
#[derive(Default)]
struct RecordingSink {
	packets: Mutex<Vec<Bytes>>,
}

impl PacketSink for RecordingSink {
	fn send_packet(&self, packet: Bytes) -> Result<(), TransportError> {
		self.packets.lock().unwrap().push(packet);
		Ok(())
	}
}

impl RecordingSink {
	fn take(&self) -> Vec<Packet> {
		let raw = mem::take(&mut *self.packets.lock().unwrap());
		raw.into_iter()
			.map(|bytes| {
				let mut buffer = BytesMut::from(&bytes[..]);
				codec::read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE)
					.unwrap()
					.unwrap()
			})
			.collect()
	}
}

/// Memory store that outlives the engine, so a restart can be simulated
#[derive(Clone, Default)]
struct SharedStore(Arc<Mutex<MemoryPersistence>>);

impl PersistentStore for SharedStore {
	fn open(&mut self, session_key: &str) -> PersistenceResult<()> {
		self.0.lock().unwrap().open(session_key)
	}

	fn put(
		&mut self,
		key: &str,
		header: &[u8],
		payload: &[u8],
	) -> PersistenceResult<()> {
		self.0.lock().unwrap().put(key, header, payload)
	}

	fn get(&self, key: &str) -> PersistenceResult<Option<PersistedRecord>> {
		self.0.lock().unwrap().get(key)
	}

	fn remove(&mut self, key: &str) -> PersistenceResult<()> {
		self.0.lock().unwrap().remove(key)
	}

	fn keys(&self) -> PersistenceResult<BTreeSet<String>> {
		self.0.lock().unwrap().keys()
	}

	fn clear(&mut self) -> PersistenceResult<()> {
		self.0.lock().unwrap().clear()
	}

	fn close(&mut self) -> PersistenceResult<()> {
		self.0.lock().unwrap().close()
	}
}

/// Store whose writes always fail
#[derive(Default)]
struct ReadOnlyStore(MemoryPersistence);

impl PersistentStore for ReadOnlyStore {
	fn open(&mut self, session_key: &str) -> PersistenceResult<()> {
		self.0.open(session_key)
	}

	fn put(&mut self, key: &str, _: &[u8], _: &[u8]) -> PersistenceResult<()> {
		Err(PersistenceError::io(
			key,
			std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
		))
	}

	fn get(&self, key: &str) -> PersistenceResult<Option<PersistedRecord>> {
		self.0.get(key)
	}

	fn remove(&mut self, key: &str) -> PersistenceResult<()> {
		self.0.remove(key)
	}

	fn keys(&self) -> PersistenceResult<BTreeSet<String>> {
		self.0.keys()
	}

	fn clear(&mut self) -> PersistenceResult<()> {
		self.0.clear()
	}

	fn close(&mut self) -> PersistenceResult<()> {
		self.0.close()
	}
}

struct Harness {
	engine: DeliveryEngine,
	sink: Arc<RecordingSink>,
	messages: mpsc::UnboundedReceiver<Message>,
}

impl Harness {
	fn received(&mut self) -> Vec<Message> {
		let mut received = Vec::new();
		while let Ok(message) = self.messages.try_recv() {
			received.push(message);
		}
		received
	}
}

fn open_engine(
	store: impl PersistentStore + 'static,
	clean_session: bool,
	max_inflight: u16,
) -> Harness {
	let (tx, messages) = mpsc::unbounded_channel();
	let options = EngineOptions {
		max_inflight,
		..EngineOptions::default()
	};
	let engine = DeliveryEngine::open(
		Session::new("client-1", "tcp://localhost:1883", clean_session),
		Box::new(store),
		options,
		tx,
	)
	.unwrap();
	Harness {
		engine,
		sink: Arc::new(RecordingSink::default()),
		messages,
	}
}

fn connected(store: impl PersistentStore + 'static, clean_session: bool) -> Harness {
	let harness = open_engine(store, clean_session, 10);
	harness.engine.attach(harness.sink.clone(), true).unwrap();
	harness
}

fn inbound_publish(topic: &str, qos: QoS, message_id: u16, payload: &str) -> Packet {
	let mut publish = Publish::new(topic, qos, payload);
	publish.pkid = message_id;
	Packet::Publish(publish)
}

fn keys(engine: &DeliveryEngine) -> Vec<String> {
	engine.stored_keys().unwrap().into_iter().collect()
}

/// Subscribes and acknowledges every filter with its requested QoS
fn subscribe_all(harness: &Harness, filters: &[(&str, QoS)]) {
	let token = harness
		.engine
		.subscribe(filters.iter().map(|(filter, qos)| (*filter, *qos)))
		.unwrap();
	let message_id = match harness.sink.take().pop() {
		| Some(Packet::Subscribe(subscribe)) => subscribe.pkid,
		| other => panic!("expected SUBSCRIBE, got {other:?}"),
	};
	harness
		.engine
		.handle_packet(Packet::SubAck(SubAck {
			pkid: message_id,
			return_codes: filters
				.iter()
				.map(|(_, qos)| SubscribeReasonCode::Success(*qos))
				.collect(),
		}))
		.unwrap();
	token.now_or_never().unwrap().unwrap();
}

#[test]
fn test_qos1_publish_completes_on_puback() {
	let harness = connected(MemoryPersistence::new(), true);

	let token = harness
		.engine
		.publish("sensors/temperature", "21.5", QoS::AtLeastOnce, false)
		.unwrap();
	assert_eq!(token.message_id(), Some(1));

	match harness.sink.take().as_slice() {
		| [Packet::Publish(publish)] => {
			assert_eq!(publish.pkid, 1);
			assert_eq!(publish.qos, QoS::AtLeastOnce);
			assert!(!publish.dup);
			assert_eq!(publish.payload.as_ref(), b"21.5");
		}
		| other => panic!("expected one PUBLISH, got {other:?}"),
	}
	assert_eq!(keys(&harness.engine), vec!["so-1"]);
	assert_eq!(
		harness.engine.handshake_state(1, Direction::Outbound),
		Some(HandshakeState::AwaitingPubAck)
	);

	harness
		.engine
		.handle_packet(Packet::PubAck(PubAck::new(1)))
		.unwrap();

	assert_eq!(
		token.now_or_never().unwrap().unwrap(),
		DeliveryReceipt {
			message_id: Some(1),
			qos: QoS::AtLeastOnce,
		}
	);
	assert!(keys(&harness.engine).is_empty());
	assert_eq!(harness.engine.inflight_count(Direction::Outbound), 0);
}

#[test]
fn test_qos2_publish_handshake() {
	let store = SharedStore::default();
	let harness = connected(store.clone(), true);

	let mut token = harness
		.engine
		.publish("a/b", "x", QoS::ExactlyOnce, true)
		.unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::Publish(p)] if p.pkid == 1 && p.retain
	));

	harness
		.engine
		.handle_packet(Packet::PubRec(PubRec::new(1)))
		.unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubRel(rel)] if rel.pkid == 1
	));
	assert_eq!(
		harness.engine.handshake_state(1, Direction::Outbound),
		Some(HandshakeState::AwaitingPubComp)
	);
	let record = store.get("so-1").unwrap().unwrap();
	let header = RecordHeader::decode("so-1", &record.header).unwrap();
	assert!(header.pubrec_received);
	assert_eq!(record.payload.as_ref(), b"x");
	assert!((&mut token).now_or_never().is_none());

	// A repeated PUBREC is answered with PUBREL again
	harness
		.engine
		.handle_packet(Packet::PubRec(PubRec::new(1)))
		.unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubRel(rel)] if rel.pkid == 1
	));

	harness
		.engine
		.handle_packet(Packet::PubComp(PubComp::new(1)))
		.unwrap();
	assert_eq!(
		token.now_or_never().unwrap().unwrap().qos,
		QoS::ExactlyOnce
	);
	assert!(keys(&harness.engine).is_empty());
}

#[test]
fn test_qos0_publish_creates_no_state() {
	let harness = connected(MemoryPersistence::new(), true);

	let token = harness
		.engine
		.publish("a/b", "x", QoS::AtMostOnce, false)
		.unwrap();
	assert_eq!(token.message_id(), None);
	assert_eq!(
		token.now_or_never().unwrap().unwrap(),
		DeliveryReceipt {
			message_id: None,
			qos: QoS::AtMostOnce,
		}
	);
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::Publish(p)] if p.qos == QoS::AtMostOnce
	));
	assert!(keys(&harness.engine).is_empty());
	assert_eq!(harness.engine.inflight_count(Direction::Outbound), 0);
}

#[test]
fn test_publish_rejections_create_no_state() {
	let harness = open_engine(MemoryPersistence::new(), true, 10);

	assert!(matches!(
		harness.engine.publish("a/b", "x", QoS::AtLeastOnce, false),
		Err(DeliveryError::NotConnected)
	));

	harness.engine.attach(harness.sink.clone(), true).unwrap();
	for topic in ["a/+", "a/#", ""] {
		assert!(matches!(
			harness.engine.publish(topic, "x", QoS::AtLeastOnce, false),
			Err(DeliveryError::InvalidTopic(_))
		));
	}
	assert!(harness.sink.take().is_empty());
	assert!(keys(&harness.engine).is_empty());

	harness.engine.close().unwrap();
	assert!(matches!(
		harness.engine.publish("a/b", "x", QoS::AtLeastOnce, false),
		Err(DeliveryError::SessionClosed)
	));
	assert!(matches!(
		harness.engine.attach(harness.sink.clone(), true),
		Err(DeliveryError::SessionClosed)
	));
}

#[test]
fn test_window_full() {
	let harness = open_engine(MemoryPersistence::new(), true, 2);
	harness.engine.attach(harness.sink.clone(), true).unwrap();

	let first = harness.engine.publish("a", "1", QoS::AtLeastOnce, false).unwrap();
	let second = harness.engine.publish("a", "2", QoS::ExactlyOnce, false).unwrap();
	assert_eq!(first.message_id(), Some(1));
	assert_eq!(second.message_id(), Some(2));

	assert!(matches!(
		harness.engine.publish("a", "3", QoS::AtLeastOnce, false),
		Err(DeliveryError::WindowFull { max_inflight: 2 })
	));
	assert_eq!(keys(&harness.engine), vec!["so-1", "so-2"]);

	// QoS0 does not count against the window
	harness.engine.publish("a", "4", QoS::AtMostOnce, false).unwrap();

	harness
		.engine
		.handle_packet(Packet::PubAck(PubAck::new(1)))
		.unwrap();
	let third = harness.engine.publish("a", "5", QoS::AtLeastOnce, false).unwrap();
	assert_eq!(third.message_id(), Some(1));
}

#[test]
fn test_persistence_failure_creates_no_state() {
	let harness = open_engine(ReadOnlyStore::default(), true, 10);
	harness.engine.attach(harness.sink.clone(), true).unwrap();

	let err = harness
		.engine
		.publish("a", "x", QoS::AtLeastOnce, false)
		.unwrap_err();
	assert!(err.is_fatal());
	assert_eq!(err.error_type(), "persistence");
	assert_eq!(harness.engine.inflight_count(Direction::Outbound), 0);
	assert!(harness.sink.take().is_empty());
}

#[test]
fn test_out_of_sequence_acks_are_discarded() {
	let harness = connected(MemoryPersistence::new(), true);
	let mut token = harness.engine.publish("a", "x", QoS::AtLeastOnce, false).unwrap();
	harness.sink.take();

	for packet in [
		Packet::PubAck(PubAck::new(9)),
		Packet::PubComp(PubComp::new(1)),
		Packet::PubRec(PubRec::new(1)),
	] {
		harness.engine.handle_packet(packet).unwrap();
	}

	assert!(harness.sink.take().is_empty());
	assert_eq!(
		harness.engine.handshake_state(1, Direction::Outbound),
		Some(HandshakeState::AwaitingPubAck)
	);
	assert_eq!(keys(&harness.engine), vec!["so-1"]);
	assert!((&mut token).now_or_never().is_none());
}

#[test]
fn test_inbound_qos1_delivers_then_acks() {
	let mut harness = connected(MemoryPersistence::new(), true);
	subscribe_all(&harness, &[("sport/#", QoS::AtLeastOnce)]);

	harness
		.engine
		.handle_packet(inbound_publish("sport/tennis", QoS::AtLeastOnce, 4, "15-0"))
		.unwrap();

	let received = harness.received();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].topic.as_str(), "sport/tennis");
	assert_eq!(received[0].message_id, Some(4));
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubAck(ack)] if ack.pkid == 4
	));
	assert!(keys(&harness.engine).is_empty());
}

#[test]
fn test_inbound_qos2_is_delivered_exactly_once() {
	let mut harness = connected(MemoryPersistence::new(), true);
	subscribe_all(&harness, &[("sport/+", QoS::ExactlyOnce)]);

	let publish = || inbound_publish("sport/tennis", QoS::ExactlyOnce, 5, "30-0");
	harness.engine.handle_packet(publish()).unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubRec(rec)] if rec.pkid == 5
	));
	assert!(harness.received().is_empty());
	assert_eq!(keys(&harness.engine), vec!["si-5"]);

	// Redelivered PUBLISH only repeats the PUBREC
	harness.engine.handle_packet(publish()).unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubRec(rec)] if rec.pkid == 5
	));
	assert_eq!(harness.engine.inflight_count(Direction::Inbound), 1);
	assert!(harness.received().is_empty());

	harness
		.engine
		.handle_packet(Packet::PubRel(PubRel::new(5)))
		.unwrap();
	let received = harness.received();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].payload.as_ref(), b"30-0");
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubComp(comp)] if comp.pkid == 5
	));
	assert!(keys(&harness.engine).is_empty());

	// A PUBREL for an id no longer in flight is completed without delivery
	harness
		.engine
		.handle_packet(Packet::PubRel(PubRel::new(5)))
		.unwrap();
	assert!(harness.received().is_empty());
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubComp(comp)] if comp.pkid == 5
	));
}

#[test]
fn test_messages_without_subscription_are_dropped() {
	let mut harness = connected(MemoryPersistence::new(), true);
	subscribe_all(&harness, &[("sport/+", QoS::AtMostOnce)]);

	for topic in ["news/world", "sport", "sport/tennis/player1"] {
		harness
			.engine
			.handle_packet(inbound_publish(topic, QoS::AtMostOnce, 0, "x"))
			.unwrap();
	}
	assert!(harness.received().is_empty());
}

#[test]
fn test_subscribe_with_rejected_filter() {
	let harness = connected(MemoryPersistence::new(), true);

	let token = harness
		.engine
		.subscribe([("sport/+", QoS::AtLeastOnce), ("$SYS/#", QoS::ExactlyOnce)])
		.unwrap();
	let subscribe = match harness.sink.take().pop() {
		| Some(Packet::Subscribe(subscribe)) => subscribe,
		| other => panic!("expected SUBSCRIBE, got {other:?}"),
	};
	let filters: Vec<_> = subscribe
		.filters
		.iter()
		.map(|filter| (filter.path.as_str(), filter.qos))
		.collect();
	assert_eq!(
		filters,
		vec![("sport/+", QoS::AtLeastOnce), ("$SYS/#", QoS::ExactlyOnce)]
	);
	assert_eq!(harness.engine.active_filters(), vec!["$SYS/#", "sport/+"]);

	harness
		.engine
		.handle_packet(Packet::SubAck(SubAck {
			pkid: subscribe.pkid,
			return_codes: vec![
				SubscribeReasonCode::Success(QoS::AtMostOnce),
				SubscribeReasonCode::Failure,
			],
		}))
		.unwrap();

	assert_eq!(
		token.now_or_never().unwrap().unwrap(),
		vec![GrantedQos::Granted(QoS::AtMostOnce), GrantedQos::Rejected]
	);
	assert_eq!(harness.engine.active_filters(), vec!["sport/+"]);
}

#[test]
fn test_subscribe_validation() {
	let harness = connected(MemoryPersistence::new(), true);

	assert!(matches!(
		harness.engine.subscribe([("sport/#/ranking", QoS::AtMostOnce)]),
		Err(DeliveryError::InvalidTopic(_))
	));
	assert!(matches!(
		harness.engine.subscribe(Vec::<(String, QoS)>::new()),
		Err(DeliveryError::NoFilters)
	));
	assert!(matches!(
		harness.engine.unsubscribe(["sport+"]),
		Err(DeliveryError::InvalidTopic(_))
	));
	assert!(harness.sink.take().is_empty());
	assert!(harness.engine.active_filters().is_empty());
}

#[test]
fn test_unsubscribe_stops_delivery() {
	let mut harness = connected(MemoryPersistence::new(), true);
	subscribe_all(&harness, &[("sport/+", QoS::AtMostOnce)]);

	let token = harness.engine.unsubscribe(["sport/+"]).unwrap();
	let message_id = match harness.sink.take().pop() {
		| Some(Packet::Unsubscribe(unsubscribe)) => {
			assert_eq!(unsubscribe.topics, vec!["sport/+".to_string()]);
			unsubscribe.pkid
		}
		| other => panic!("expected UNSUBSCRIBE, got {other:?}"),
	};

	harness
		.engine
		.handle_packet(inbound_publish("sport/tennis", QoS::AtMostOnce, 0, "x"))
		.unwrap();
	assert!(harness.received().is_empty());

	harness
		.engine
		.handle_packet(Packet::UnsubAck(UnsubAck::new(message_id)))
		.unwrap();
	assert!(token.now_or_never().unwrap().is_ok());
}

#[test]
fn test_detach_fails_pending_requests_but_keeps_publishes() {
	let harness = connected(MemoryPersistence::new(), true);
	let mut publish = harness.engine.publish("a", "x", QoS::AtLeastOnce, false).unwrap();
	let subscribe = harness.engine.subscribe([("a", QoS::AtMostOnce)]).unwrap();

	harness.engine.detach();
	assert!(!harness.engine.is_attached());
	assert!(matches!(
		subscribe.now_or_never().unwrap(),
		Err(DeliveryError::Disconnected)
	));
	assert!((&mut publish).now_or_never().is_none());
	assert!(matches!(
		harness.engine.publish("a", "y", QoS::AtLeastOnce, false),
		Err(DeliveryError::NotConnected)
	));
}

#[test]
fn test_reconnect_replays_in_publish_order() {
	let harness = connected(MemoryPersistence::new(), true);
	for qos in [QoS::AtLeastOnce, QoS::ExactlyOnce, QoS::ExactlyOnce] {
		let _ = harness.engine.publish("a/b", "x", qos, false).unwrap();
	}
	harness
		.engine
		.handle_packet(Packet::PubRec(PubRec::new(3)))
		.unwrap();
	harness.sink.take();

	harness.engine.detach();
	let sink = Arc::new(RecordingSink::default());
	assert_eq!(harness.engine.attach(sink.clone(), true).unwrap(), 3);

	match sink.take().as_slice() {
		| [
			Packet::Publish(first),
			Packet::Publish(second),
			Packet::PubRel(third),
		] => {
			assert_eq!((first.pkid, first.dup), (1, true));
			assert_eq!((second.pkid, second.dup), (2, true));
			assert_eq!(third.pkid, 3);
		}
		| other => panic!("unexpected replay {other:?}"),
	}
}

#[test]
fn test_restart_replays_before_new_publishes() {
	let store = SharedStore::default();
	{
		let harness = connected(store.clone(), false);
		for _ in 0..3 {
			let _ = harness.engine.publish("a/b", "x", QoS::AtLeastOnce, false).unwrap();
		}
		for id in [1, 2] {
			harness
				.engine
				.handle_packet(Packet::PubAck(PubAck::new(id)))
				.unwrap();
		}
		harness.engine.close().unwrap();
	}

	let harness = open_engine(store, false, 10);
	assert_eq!(harness.engine.inflight_count(Direction::Outbound), 1);
	assert_eq!(
		harness.engine.handshake_state(3, Direction::Outbound),
		Some(HandshakeState::AwaitingPubAck)
	);

	harness.engine.attach(harness.sink.clone(), true).unwrap();
	let token = harness.engine.publish("a/b", "new", QoS::AtLeastOnce, false).unwrap();
	assert_eq!(token.message_id(), Some(1));

	match harness.sink.take().as_slice() {
		| [Packet::Publish(replayed), Packet::Publish(fresh)] => {
			assert_eq!((replayed.pkid, replayed.dup), (3, true));
			assert_eq!((fresh.pkid, fresh.dup), (1, false));
			assert_eq!(fresh.payload.as_ref(), b"new");
		}
		| other => panic!("unexpected packets {other:?}"),
	}
}

#[test]
fn test_restart_resumes_inbound_qos2() {
	let store = SharedStore::default();
	{
		let harness = connected(store.clone(), false);
		subscribe_all(&harness, &[("sport/#", QoS::ExactlyOnce)]);
		harness
			.engine
			.handle_packet(inbound_publish("sport/tennis", QoS::ExactlyOnce, 7, "40-0"))
			.unwrap();
		harness.engine.close().unwrap();
	}

	let mut harness = connected(store, false);
	assert_eq!(harness.engine.inflight_count(Direction::Inbound), 1);
	// Inbound entries are not replayed, the broker resends PUBREL
	assert!(harness.sink.take().is_empty());

	// PUBREL can arrive with the CONNACK, before the application resubscribes
	harness
		.engine
		.handle_packet(Packet::PubRel(PubRel::new(7)))
		.unwrap();

	let received = harness.received();
	assert_eq!(received.len(), 1);
	assert_eq!(received[0].payload.as_ref(), b"40-0");
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubComp(comp)] if comp.pkid == 7
	));
	assert!(keys(&harness.engine).is_empty());
}

#[test]
fn test_inbound_qos2_match_is_decided_on_arrival() {
	let mut harness = connected(MemoryPersistence::new(), true);
	harness
		.engine
		.handle_packet(inbound_publish("sport/tennis", QoS::ExactlyOnce, 3, "15-0"))
		.unwrap();
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubRec(rec)] if rec.pkid == 3
	));

	subscribe_all(&harness, &[("sport/#", QoS::ExactlyOnce)]);
	harness
		.engine
		.handle_packet(Packet::PubRel(PubRel::new(3)))
		.unwrap();

	assert!(harness.received().is_empty());
	assert!(matches!(
		harness.sink.take().as_slice(),
		[Packet::PubComp(comp)] if comp.pkid == 3
	));
	assert!(keys(&harness.engine).is_empty());
}

#[test]
fn test_clean_session_discards_records() {
	let store = SharedStore::default();
	{
		let harness = connected(store.clone(), false);
		let _ = harness.engine.publish("a", "x", QoS::AtLeastOnce, false).unwrap();
		harness.engine.close().unwrap();
	}
	assert_eq!(store.keys().unwrap_err().error_type(), "not_open");

	let harness = open_engine(store, true, 10);
	assert_eq!(harness.engine.inflight_count(Direction::Outbound), 0);
	assert!(keys(&harness.engine).is_empty());
}

#[test]
fn test_close_resolves_waiters_and_keeps_records() {
	let store = SharedStore::default();
	let harness = connected(store.clone(), false);
	let token = harness.engine.publish("a", "x", QoS::ExactlyOnce, false).unwrap();

	harness.engine.close().unwrap();
	assert!(harness.engine.is_closed());
	assert!(matches!(
		token.now_or_never().unwrap(),
		Err(DeliveryError::SessionClosed)
	));
	// Packets after close are ignored
	harness
		.engine
		.handle_packet(Packet::PubRec(PubRec::new(1)))
		.unwrap();
	harness.engine.close().unwrap();

	store.clone().open("again").unwrap();
	assert!(store.get("so-1").unwrap().is_some());
}

#[test]
fn test_resubscribes_when_broker_lost_session() {
	let harness = connected(MemoryPersistence::new(), true);
	subscribe_all(&harness, &[("a/+", QoS::AtLeastOnce), ("b/#", QoS::AtMostOnce)]);
	harness.engine.detach();

	harness.engine.attach(harness.sink.clone(), true).unwrap();
	assert!(harness.sink.take().is_empty());

	harness.engine.detach();
	harness.engine.attach(harness.sink.clone(), false).unwrap();
	match harness.sink.take().as_slice() {
		| [Packet::Subscribe(subscribe)] => {
			let paths: Vec<_> =
				subscribe.filters.iter().map(|f| f.path.as_str()).collect();
			assert_eq!(paths, vec!["a/+", "b/#"]);
		}
		| other => panic!("expected SUBSCRIBE, got {other:?}"),
	}
}

#[test]
fn test_on_packet_received_keeps_partial_bytes() {
	let harness = connected(MemoryPersistence::new(), true);
	let _ = harness.engine.publish("a", "1", QoS::AtLeastOnce, false).unwrap();
	let _ = harness.engine.publish("a", "2", QoS::AtLeastOnce, false).unwrap();

	let mut buffer = BytesMut::new();
	buffer.extend_from_slice(&codec::encode_puback(1).unwrap());
	buffer.extend_from_slice(&codec::encode_puback(2).unwrap()[..3]);

	assert_eq!(harness.engine.on_packet_received(&mut buffer).unwrap(), 1);
	assert_eq!(buffer.len(), 3);
	assert_eq!(keys(&harness.engine), vec!["so-2"]);

	buffer.extend_from_slice(&[0x02]);
	assert_eq!(harness.engine.on_packet_received(&mut buffer).unwrap(), 1);
	assert!(keys(&harness.engine).is_empty());

	let mut garbage = BytesMut::from(&[0x00, 0x00][..]);
	assert!(matches!(
		harness.engine.on_packet_received(&mut garbage),
		Err(DeliveryError::Codec(_))
	));
}
