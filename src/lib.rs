//! # MQTT Durable Client
//!
//! An MQTT 3.1.1 client whose session survives disconnects and process
//! restarts: every unacknowledged QoS1/QoS2 message is persisted and
//! replayed, and inbound QoS2 messages are delivered exactly once.
//!
//! ## Features
//!
//! - **Crash-safe persistence**: one file per in-flight message, written
//!   with a backup-then-overwrite protocol
//! - **QoS handshakes**: PUBACK, PUBREC/PUBREL/PUBCOMP in both directions
//! - **Reconnect replay**: unacknowledged publishes are re-sent with DUP set,
//!   in their original order, before any new traffic
//! - **Wildcard routing**: inbound messages reach the application only when
//!   they match an active filter (`+`, `#`, `$share/<group>/...`)
//! - **Pluggable transports**: scheme → factory registry, plain TCP included
//! - **Graceful Shutdown**: DISCONNECT is flushed, persisted state is kept
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mqtt_durable_client::{Message, MqttClient, MqttClientConfig, QoS, TransportRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MqttClientConfig::from_url("mqtt://localhost:1883?client_id=meter-7")?
//!         .with_persistence_dir("./mqtt-session");
//!
//!     let (client, connection) = MqttClient::connect_with_config(
//!         config,
//!         TransportRegistry::with_defaults(),
//!         |message: Message| println!("{}: {:?}", message.topic, message.payload),
//!     )
//!     .await?;
//!
//!     client.subscribe([("meters/+/reading", QoS::AtLeastOnce)]).await?;
//!
//!     // Resolves once the broker has completed the QoS2 handshake
//!     let receipt = client
//!         .publish("meters/7/reading", "42.1", QoS::ExactlyOnce, false)?
//!         .await?;
//!     println!("delivered as message {:?}", receipt.message_id);
//!
//!     connection.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Pattern Matching
//!
//! - `+` matches a single topic level (e.g., `sensors/+/temperature`)
//! - `#` matches the remaining levels, including none (e.g., `sensors/#`)
//! - `$share/<group>/` is ignored when matching shared subscriptions

#![warn(missing_docs)]

// Core modules
pub mod client;
pub mod codec;
pub mod connection;
pub mod logging;
pub mod persistence;
pub mod session;
pub mod topic;
pub mod transport;

// === Core Public API ===
// Main client types
pub use client::{
	ClientSettings, Credentials, MessageHandler, MqttClient, MqttClientConfig,
	MqttClientError,
};
pub use connection::MqttConnection;

// Session and delivery
pub use session::{
	DeliveryEngine, DeliveryReceipt, DeliveryToken, GrantedQos, Message, Session,
};

// Storage
pub use persistence::{FilePersistence, MemoryPersistence, PersistentStore};

// Transports
pub use transport::{ServerUri, TcpTransport, TransportFactory, TransportRegistry};

// Logging
pub use logging::{LogFormat, init_logging};

// Essential external types
pub use rumqttc::QoS;

/// Result type alias for operations that may fail with MqttClientError
pub type Result<T> = std::result::Result<T, MqttClientError>;

/// Prelude module for convenient imports
///
/// This module provides the most commonly used types for typical MQTT applications.
/// Use this when you want to import everything you need with a single line:
///
/// ```rust
/// use mqtt_durable_client::prelude::*;
/// ```
pub mod prelude {
	//! Essential types for most MQTT applications

	pub use crate::{
		DeliveryReceipt, GrantedQos, Message, MqttClient, MqttClientConfig,
		MqttClientError, MqttConnection, QoS, Result,
	};
}

/// Advanced types for driving the session engine directly
///
/// Useful for custom transports, tests against scripted brokers and tools
/// that inspect persisted sessions.
///
/// ```rust
/// use mqtt_durable_client::advanced::*;
/// ```
pub mod advanced {
	//! Advanced types for complex use cases

	pub use crate::session::{
		Direction, EngineOptions, HandshakeEvent, HandshakeState, InflightEntry,
		InflightTable, RecordHeader, ResponseToken,
	};

	pub use crate::persistence::{PersistedRecord, file_store::sanitize_session_key};

	// Topic utilities
	pub use crate::topic::{is_matched, limits, validate_topic_filter, validate_topic_name};

	// Transport plumbing
	pub use crate::transport::{
		AsyncStream, Authority, BoxedStream, PacketSink, default_port, parse_authority,
	};

	pub use crate::codec;
}

/// Error types used throughout the library
///
/// Re-exports all error types in one convenient location for error handling.
///
/// ```rust
/// use mqtt_durable_client::errors::*;
/// ```
pub mod errors {
	//! All error types used in the library

	pub use crate::client::{ConnectionEstablishmentError, MqttClientError};
	pub use crate::codec::CodecError;
	pub use crate::logging::LoggingError;
	pub use crate::persistence::PersistenceError;
	pub use crate::session::{DeliveryError, InflightError, ProtocolError};
	pub use crate::topic::TopicError;
	pub use crate::transport::TransportError;
}
