//! Session delivery engine
//!
//! Drives the QoS1 and QoS2 handshakes for one client session, keeps every
//! unacknowledged message in a [`PersistentStore`](crate::persistence::PersistentStore)
//! and replays it after a reconnect or a restart.

mod dispatch;
/// Delivery engine
pub mod engine;
/// Session error types
pub mod error;
/// In-flight message tracking
pub mod inflight;
pub mod record;

#[cfg(test)]
mod engine_tests;

use arcstr::ArcStr;
use bytes::Bytes;
use rumqttc::QoS;

pub use engine::{
	DEFAULT_MAX_INFLIGHT, DeliveryEngine, DeliveryToken, EngineOptions, ResponseToken,
};
pub use error::{DeliveryError, DeliveryResult, InflightError, ProtocolError};
pub use inflight::{
	Direction, HandshakeEvent, HandshakeState, InflightEntry, InflightTable,
};
pub use record::RecordHeader;

/// Identity of a client session.
///
/// A durable session (`clean_session == false`) resumes whatever was in
/// flight when it was last closed; a clean session starts from nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
	/// MQTT client identifier
	pub client_id: String,
	/// Broker URI as configured
	pub server_uri: String,
	/// Discard persisted state on open
	pub clean_session: bool,
}

impl Session {
	/// Creates a session identity
	pub fn new(
		client_id: impl Into<String>,
		server_uri: impl Into<String>,
		clean_session: bool,
	) -> Self {
		Self {
			client_id: client_id.into(),
			server_uri: server_uri.into(),
			clean_session,
		}
	}

	/// Key the session's records are stored under
	pub fn store_key(&self) -> String {
		format!("{}-{}", self.client_id, self.server_uri)
	}
}

/// An application message, published or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	/// Topic name
	pub topic: ArcStr,
	/// Opaque payload
	pub payload: Bytes,
	/// Quality of service
	pub qos: QoS,
	/// Retain flag
	pub retain: bool,
	/// Set when the broker redelivers a message
	pub dup: bool,
	/// Packet identifier, present for QoS1 and QoS2
	pub message_id: Option<u16>,
}

impl Message {
	/// Creates a message without a packet identifier
	pub fn new(
		topic: impl Into<ArcStr>,
		payload: impl Into<Bytes>,
		qos: QoS,
		retain: bool,
	) -> Self {
		Self {
			topic: topic.into(),
			payload: payload.into(),
			qos,
			retain,
			dup: false,
			message_id: None,
		}
	}

	pub(crate) fn from_publish(publish: &rumqttc::Publish) -> Self {
		Self {
			topic: ArcStr::from(publish.topic.as_str()),
			payload: publish.payload.clone(),
			qos: publish.qos,
			retain: publish.retain,
			dup: publish.dup,
			message_id: (publish.qos != QoS::AtMostOnce).then_some(publish.pkid),
		}
	}
}

/// Outcome of a completed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
	/// Packet identifier used, `None` for QoS0
	pub message_id: Option<u16>,
	/// QoS the message was published with
	pub qos: QoS,
}

/// Broker's answer for one filter of a SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantedQos {
	/// Subscription accepted with this maximum QoS
	Granted(QoS),
	/// Subscription refused
	Rejected,
}
