use thiserror::Error;

use super::inflight::{Direction, HandshakeEvent, HandshakeState};
use crate::codec::CodecError;
use crate::persistence::PersistenceError;
use crate::topic::TopicError;
use crate::transport::TransportError;

/// An acknowledgement that does not fit the handshake of its message id.
///
/// These are logged and the offending packet is discarded; the session
/// carries on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
	/// No entry is in flight under this id
	#[error("No {direction:?} message in flight with id {message_id}")]
	UnknownMessageId {
		/// Packet identifier of the acknowledgement
		message_id: u16,
		/// Direction that was looked up
		direction: Direction,
	},

	/// The entry exists but is not waiting for this event
	#[error("Unexpected {event:?} for message {message_id} in state {state:?}")]
	UnexpectedEvent {
		/// Packet identifier of the acknowledgement
		message_id: u16,
		/// Where the handshake stands
		state: HandshakeState,
		/// The acknowledgement received
		event: HandshakeEvent,
	},
}

/// Errors raised by the [`InflightTable`](super::InflightTable)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InflightError {
	/// The direction already holds `max_inflight` entries
	#[error("Inflight window is full ({max_inflight} messages)")]
	WindowFull {
		/// Window size per direction
		max_inflight: u16,
	},

	/// An entry with the same id is already alive
	#[error("Message id {message_id} is already in flight ({direction:?})")]
	DuplicateId {
		/// The colliding packet identifier
		message_id: u16,
		/// Direction of the live entry
		direction: Direction,
	},

	/// Acknowledgement out of sequence
	#[error(transparent)]
	Protocol(#[from] ProtocolError),
}

/// Errors returned by the [`DeliveryEngine`](super::DeliveryEngine).
///
/// The type is `Clone` so that one failure can resolve every caller waiting
/// on the session.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
	/// Persistence failed; delivery can no longer be guaranteed
	#[error("Persistence failure: {0}")]
	Persistence(#[from] PersistenceError),

	/// Publish rejected because the outbound window is full
	#[error("Inflight window is full ({max_inflight} messages)")]
	WindowFull {
		/// Configured outbound window
		max_inflight: u16,
	},

	/// Topic name or filter rejected before any state was created
	#[error("Invalid topic: {0}")]
	InvalidTopic(#[from] TopicError),

	/// Subscribe or unsubscribe called without any filter
	#[error("At least one topic filter is required")]
	NoFilters,

	/// No connection is attached to the session
	#[error("Not connected")]
	NotConnected,

	/// The session has been closed
	#[error("Session closed")]
	SessionClosed,

	/// The connection dropped before the broker answered
	#[error("Connection lost before the request was acknowledged")]
	Disconnected,

	/// Inflight bookkeeping failed
	#[error("Inflight error: {0}")]
	Inflight(InflightError),

	/// Packet could not be encoded or decoded
	#[error("Codec error: {0}")]
	Codec(#[from] CodecError),

	/// The transport refused the packet
	#[error("Transport error: {0}")]
	Transport(#[from] TransportError),
}

impl DeliveryError {
	/// Returns true if the session cannot continue after this error
	pub fn is_fatal(&self) -> bool {
		matches!(self, DeliveryError::Persistence(_))
	}

	/// Returns the error type for categorization
	pub fn error_type(&self) -> &'static str {
		match self {
			| DeliveryError::Persistence(_) => "persistence",
			| DeliveryError::WindowFull { .. } => "window_full",
			| DeliveryError::InvalidTopic(_) => "invalid_topic",
			| DeliveryError::NoFilters => "no_filters",
			| DeliveryError::NotConnected => "not_connected",
			| DeliveryError::SessionClosed => "session_closed",
			| DeliveryError::Disconnected => "disconnected",
			| DeliveryError::Inflight(_) => "inflight",
			| DeliveryError::Codec(_) => "codec",
			| DeliveryError::Transport(_) => "transport",
		}
	}
}

impl From<InflightError> for DeliveryError {
	fn from(err: InflightError) -> Self {
		match err {
			| InflightError::WindowFull { max_inflight } => {
				DeliveryError::WindowFull { max_inflight }
			}
			| other => DeliveryError::Inflight(other),
		}
	}
}

/// Convenient Result type for engine operations
pub type DeliveryResult<T> = Result<T, DeliveryError>;
