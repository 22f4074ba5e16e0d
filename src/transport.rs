//! Byte-stream transports
//!
//! A transport is anything that yields an `AsyncRead + AsyncWrite` stream for
//! a [`ServerUri`]. Factories are looked up by URI scheme in a
//! [`TransportRegistry`] the caller builds; plain TCP is registered by
//! [`TransportRegistry::with_defaults`].

/// Server URI parsing
pub mod authority;
/// Scheme to transport factory map
pub mod registry;

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use authority::{Authority, ServerUri, default_port, parse_authority};
pub use registry::{TcpTransport, TransportFactory, TransportRegistry};

/// Errors raised while resolving, dialing or writing to a transport
#[derive(Error, Debug, Clone)]
pub enum TransportError {
	/// No factory registered for the URI scheme
	#[error("Unsupported URI scheme '{scheme}'")]
	UnsupportedScheme {
		/// Scheme of the URI
		scheme: String,
	},

	/// The URI or its authority cannot be parsed
	#[error("Invalid server URI '{uri}': {reason}")]
	InvalidUri {
		/// The URI as given
		uri: String,
		/// What is wrong with it
		reason: String,
	},

	/// Dialing or stream I/O failed
	#[error("Connection to {address} failed: {source}")]
	Connect {
		/// Address that was dialed
		address: String,
		/// Underlying I/O error
		#[source]
		source: Arc<io::Error>,
	},

	/// The stream or the outbound channel is closed
	#[error("Transport closed")]
	Closed,
}

impl TransportError {
	/// Creates a new InvalidUri error
	pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
		Self::InvalidUri {
			uri: uri.into(),
			reason: reason.into(),
		}
	}

	/// Creates a new Connect error
	pub fn connect(address: impl Into<String>, source: io::Error) -> Self {
		Self::Connect {
			address: address.into(),
			source: Arc::new(source),
		}
	}

	/// Returns the error type for categorization
	pub fn error_type(&self) -> &'static str {
		match self {
			| TransportError::UnsupportedScheme { .. } => "unsupported_scheme",
			| TransportError::InvalidUri { .. } => "invalid_uri",
			| TransportError::Connect { .. } => "connect",
			| TransportError::Closed => "closed",
		}
	}
}

/// A bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// A dialed transport stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Where the delivery engine writes encoded packets.
///
/// `send_packet` is called with the session lock held, so it must not block.
pub trait PacketSink: Send + Sync {
	/// Queues one encoded packet for transmission
	fn send_packet(&self, packet: Bytes) -> Result<(), TransportError>;
}

impl PacketSink for mpsc::UnboundedSender<Bytes> {
	fn send_packet(&self, packet: Bytes) -> Result<(), TransportError> {
		self.send(packet).map_err(|_| TransportError::Closed)
	}
}
