//! Persisted form of in-flight messages
//!
//! Outbound QoS1/QoS2 publishes are stored under `so-<id>`, inbound QoS2
//! publishes awaiting PUBREL under `si-<id>`. The record header is a bincode
//! encoded [`RecordHeader`]; the payload is stored untouched.

use bincode::{Decode, Encode};
use bytes::Bytes;
use rumqttc::QoS;

use super::Message;
use super::inflight::{Direction, HandshakeState, InflightEntry};
use crate::persistence::{PersistenceError, PersistenceResult};

const OUTBOUND_PREFIX: &str = "so-";
const INBOUND_PREFIX: &str = "si-";

/// Store key of an outbound record
pub fn outbound_key(message_id: u16) -> String {
	format!("{OUTBOUND_PREFIX}{message_id}")
}

/// Store key of an inbound record
pub fn inbound_key(message_id: u16) -> String {
	format!("{INBOUND_PREFIX}{message_id}")
}

/// Store key for an id in the given direction
pub fn record_key(direction: Direction, message_id: u16) -> String {
	match direction {
		| Direction::Outbound => outbound_key(message_id),
		| Direction::Inbound => inbound_key(message_id),
	}
}

/// Splits a store key into direction and message id.
///
/// Returns `None` for keys this crate did not write, including id 0.
pub fn parse_key(key: &str) -> Option<(Direction, u16)> {
	let (direction, id) = if let Some(id) = key.strip_prefix(OUTBOUND_PREFIX) {
		(Direction::Outbound, id)
	} else {
		(Direction::Inbound, key.strip_prefix(INBOUND_PREFIX)?)
	};
	match id.parse::<u16>() {
		| Ok(0) | Err(_) => None,
		| Ok(id) => Some((direction, id)),
	}
}

/// Metadata stored alongside a record's payload.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RecordHeader {
	/// QoS as its wire value
	pub qos: u8,
	/// Retain flag of the PUBLISH
	pub retain: bool,
	/// Topic name of the PUBLISH
	pub topic: String,
	/// Per-session send order
	pub sequence: u64,
	/// Set once PUBREC has been received for an outbound QoS2 message
	pub pubrec_received: bool,
	/// Set when an inbound QoS2 message matched an active filter on arrival
	pub matched: bool,
}

impl RecordHeader {
	/// Header describing the current state of an entry
	pub fn from_entry(entry: &InflightEntry) -> Self {
		Self {
			qos: qos_to_u8(entry.qos),
			retain: entry.message.retain,
			topic: entry.message.topic.to_string(),
			sequence: entry.sequence,
			pubrec_received: entry.state == HandshakeState::AwaitingPubComp,
			matched: entry.matched,
		}
	}

	/// Encodes the header for storage
	pub fn encode(&self, key: &str) -> PersistenceResult<Vec<u8>> {
		bincode::encode_to_vec(self, bincode::config::standard())
			.map_err(|err| PersistenceError::corrupt(key, err.to_string()))
	}

	/// Decodes a stored header
	pub fn decode(key: &str, bytes: &[u8]) -> PersistenceResult<Self> {
		let (header, _) = bincode::decode_from_slice::<Self, _>(
			bytes,
			bincode::config::standard(),
		)
		.map_err(|err| PersistenceError::corrupt(key, err.to_string()))?;
		Ok(header)
	}

	/// Rebuilds the inflight entry a record stands for.
	///
	/// Outbound records without the PUBREC marker wait for PUBACK or PUBREC
	/// depending on QoS; with the marker they wait for PUBCOMP. Inbound
	/// records always wait for PUBREL and keep their match result, so the
	/// release does not depend on which filters are active after a restart.
	pub fn into_entry(
		self,
		key: &str,
		direction: Direction,
		message_id: u16,
		payload: Bytes,
	) -> PersistenceResult<InflightEntry> {
		let qos = qos_from_u8(self.qos).ok_or_else(|| {
			PersistenceError::corrupt(key, format!("invalid QoS {}", self.qos))
		})?;
		if qos == QoS::AtMostOnce {
			return Err(PersistenceError::corrupt(key, "QoS 0 is never persisted"));
		}

		let mut message = Message::new(self.topic, payload, qos, self.retain);
		message.message_id = Some(message_id);
		let mut entry = InflightEntry::new(message_id, direction, message, self.sequence);
		if direction == Direction::Outbound && self.pubrec_received {
			entry.state = HandshakeState::AwaitingPubComp;
		}
		entry.matched = direction == Direction::Inbound && self.matched;
		Ok(entry)
	}
}

pub(crate) fn qos_to_u8(qos: QoS) -> u8 {
	match qos {
		| QoS::AtMostOnce => 0,
		| QoS::AtLeastOnce => 1,
		| QoS::ExactlyOnce => 2,
	}
}

pub(crate) fn qos_from_u8(value: u8) -> Option<QoS> {
	match value {
		| 0 => Some(QoS::AtMostOnce),
		| 1 => Some(QoS::AtLeastOnce),
		| 2 => Some(QoS::ExactlyOnce),
		| _ => None,
	}
}
