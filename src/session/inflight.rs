use std::collections::{BTreeMap, BTreeSet};

use rumqttc::QoS;

use super::Message;
use super::error::{InflightError, ProtocolError};

/// Direction of a QoS handshake relative to this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
	/// Published by this client
	Outbound,
	/// Published by the broker
	Inbound,
}

/// Position of a message in its QoS handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
	/// Outbound QoS1 sent, PUBACK outstanding
	AwaitingPubAck,
	/// Outbound QoS2 sent, PUBREC outstanding
	AwaitingPubRec,
	/// Outbound QoS2 PUBREL sent, PUBCOMP outstanding
	AwaitingPubComp,
	/// Inbound QoS2 PUBREC sent, PUBREL outstanding
	AwaitingPubRel,
	/// Handshake finished, entry about to be removed
	Complete,
}

impl HandshakeState {
	/// First state of a handshake for the given direction and QoS
	pub fn initial(direction: Direction, qos: QoS) -> Self {
		match (direction, qos) {
			| (Direction::Inbound, _) => HandshakeState::AwaitingPubRel,
			| (Direction::Outbound, QoS::ExactlyOnce) => {
				HandshakeState::AwaitingPubRec
			}
			| (Direction::Outbound, _) => HandshakeState::AwaitingPubAck,
		}
	}
}

/// Acknowledgement packets that drive a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeEvent {
	/// PUBACK received
	PubAck,
	/// PUBREC received
	PubRec,
	/// PUBCOMP received
	PubComp,
	/// PUBREL received
	PubRel,
}

/// One message with protocol work outstanding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightEntry {
	/// Packet identifier, never zero
	pub message_id: u16,
	/// QoS of the handshake, `AtLeastOnce` or `ExactlyOnce`
	pub qos: QoS,
	/// Who published the message
	pub direction: Direction,
	/// Current handshake position
	pub state: HandshakeState,
	/// Message contents
	pub message: Message,
	/// Per-session send order, used to replay in the original order
	pub sequence: u64,
	/// Inbound QoS2 only: an active filter matched when the PUBLISH arrived,
	/// so the message is released to the application on PUBREL
	pub matched: bool,
}

impl InflightEntry {
	/// Creates an entry in the first state of its handshake
	pub fn new(
		message_id: u16,
		direction: Direction,
		message: Message,
		sequence: u64,
	) -> Self {
		let qos = message.qos;
		Self {
			message_id,
			qos,
			direction,
			state: HandshakeState::initial(direction, qos),
			message,
			sequence,
			matched: false,
		}
	}
}

/// In-memory index of in-flight message ids.
///
/// Holds at most one entry per (direction, id). Outbound publishes are
/// bounded by `max_inflight`; SUBSCRIBE and UNSUBSCRIBE reserve ids from the
/// same outbound space through [`allocate_control_id`](Self::allocate_control_id)
/// without counting against the window.
#[derive(Debug)]
pub struct InflightTable {
	max_inflight: u16,
	entries: BTreeMap<(Direction, u16), InflightEntry>,
	control_ids: BTreeSet<u16>,
}

impl InflightTable {
	/// Creates an empty table. A `max_inflight` of zero is raised to one.
	pub fn new(max_inflight: u16) -> Self {
		Self {
			max_inflight: max_inflight.max(1),
			entries: BTreeMap::new(),
			control_ids: BTreeSet::new(),
		}
	}

	/// Window size per direction
	pub fn max_inflight(&self) -> u16 {
		self.max_inflight
	}

	/// Number of live entries in one direction
	pub fn len(&self, direction: Direction) -> usize {
		self.entries.keys().filter(|(dir, _)| *dir == direction).count()
	}

	/// Returns true if no entry is alive in either direction
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Returns the lowest id in `1..=65535` not in use for `direction`.
	pub fn allocate_id(&self, direction: Direction) -> Result<u16, InflightError> {
		let window_full = InflightError::WindowFull {
			max_inflight: self.max_inflight,
		};
		if self.len(direction) >= usize::from(self.max_inflight) {
			return Err(window_full);
		}
		(1..=u16::MAX)
			.find(|id| !self.is_taken(direction, *id))
			.ok_or(window_full)
	}

	/// Reserves an outbound id for a SUBSCRIBE or UNSUBSCRIBE.
	pub fn allocate_control_id(&mut self) -> Result<u16, InflightError> {
		let id = (1..=u16::MAX)
			.find(|id| !self.is_taken(Direction::Outbound, *id))
			.ok_or(InflightError::WindowFull {
				max_inflight: self.max_inflight,
			})?;
		self.control_ids.insert(id);
		Ok(id)
	}

	/// Frees an id reserved by [`allocate_control_id`](Self::allocate_control_id).
	/// Returns false if the id was not reserved.
	pub fn release_control_id(&mut self, id: u16) -> bool {
		self.control_ids.remove(&id)
	}

	fn is_taken(&self, direction: Direction, id: u16) -> bool {
		self.entries.contains_key(&(direction, id))
			|| (direction == Direction::Outbound && self.control_ids.contains(&id))
	}

	/// Adds a new entry. Fails if the id is already alive.
	pub fn insert(&mut self, entry: InflightEntry) -> Result<(), InflightError> {
		let key = (entry.direction, entry.message_id);
		if self.is_taken(entry.direction, entry.message_id) {
			return Err(InflightError::DuplicateId {
				message_id: entry.message_id,
				direction: entry.direction,
			});
		}
		self.entries.insert(key, entry);
		Ok(())
	}

	/// Re-inserts an entry loaded from persistence at session open.
	///
	/// Same checks as [`insert`](Self::insert): only id collisions are
	/// rejected. The window is enforced by [`allocate_id`](Self::allocate_id),
	/// so a restored set larger than `max_inflight` is accepted and blocks
	/// new publishes until it drains.
	pub fn restore(&mut self, entry: InflightEntry) -> Result<(), InflightError> {
		self.insert(entry)
	}

	/// Moves an entry forward on `event` and returns its new state.
	///
	/// A repeated PUBREC while awaiting PUBCOMP is accepted and leaves the
	/// state unchanged, so the caller can answer it with another PUBREL.
	pub fn advance(
		&mut self,
		message_id: u16,
		direction: Direction,
		event: HandshakeEvent,
	) -> Result<HandshakeState, ProtocolError> {
		let entry = self.entries.get_mut(&(direction, message_id)).ok_or(
			ProtocolError::UnknownMessageId {
				message_id,
				direction,
			},
		)?;

		let next = match (direction, entry.state, event) {
			| (
				Direction::Outbound,
				HandshakeState::AwaitingPubAck,
				HandshakeEvent::PubAck,
			) => HandshakeState::Complete,
			| (
				Direction::Outbound,
				HandshakeState::AwaitingPubRec | HandshakeState::AwaitingPubComp,
				HandshakeEvent::PubRec,
			) => HandshakeState::AwaitingPubComp,
			| (
				Direction::Outbound,
				HandshakeState::AwaitingPubComp,
				HandshakeEvent::PubComp,
			) => HandshakeState::Complete,
			| (
				Direction::Inbound,
				HandshakeState::AwaitingPubRel,
				HandshakeEvent::PubRel,
			) => HandshakeState::Complete,
			| (_, state, event) => {
				return Err(ProtocolError::UnexpectedEvent {
					message_id,
					state,
					event,
				});
			}
		};
		entry.state = next;
		Ok(next)
	}

	/// Looks up an entry
	pub fn get(&self, message_id: u16, direction: Direction) -> Option<&InflightEntry> {
		self.entries.get(&(direction, message_id))
	}

	/// Returns true if an entry is alive under this id
	pub fn contains(&self, message_id: u16, direction: Direction) -> bool {
		self.entries.contains_key(&(direction, message_id))
	}

	/// Removes and returns an entry
	pub fn remove(
		&mut self,
		message_id: u16,
		direction: Direction,
	) -> Option<InflightEntry> {
		self.entries.remove(&(direction, message_id))
	}

	/// Entries of one direction in their original send order
	pub fn in_send_order(&self, direction: Direction) -> Vec<&InflightEntry> {
		let mut entries: Vec<_> = self
			.entries
			.values()
			.filter(|entry| entry.direction == direction)
			.collect();
		entries.sort_by_key(|entry| entry.sequence);
		entries
	}

	/// Drops every entry and control id
	pub fn clear(&mut self) {
		self.entries.clear();
		self.control_ids.clear();
	}
}
