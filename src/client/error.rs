use rumqttc::ConnectReturnCode;
use thiserror::Error;

use crate::codec::CodecError;
use crate::persistence::PersistenceError;
use crate::session::DeliveryError;
use crate::topic::TopicError;
use crate::transport::TransportError;

/// Failure to bring up a connection to the broker
#[derive(Debug, Clone, Error)]
pub enum ConnectionEstablishmentError {
	/// Dialing or writing CONNECT failed
	#[error("Network error: {0}")]
	Network(#[from] TransportError),
	/// CONNECT could not be encoded or the broker answered with garbage
	#[error("Protocol error: {0}")]
	Codec(#[from] CodecError),
	/// CONNACK carried a non-success return code
	#[error("Broker rejected connection: {code:?}")]
	BrokerRejected {
		/// Return code from the CONNACK
		code: ConnectReturnCode,
	},
	/// No CONNACK within the configured timeout
	#[error("Connection timed out after {timeout_millis}ms")]
	Timeout {
		/// Configured connection timeout
		timeout_millis: u64,
	},
}

impl ConnectionEstablishmentError {
	/// Short classification for structured logs
	pub fn error_type(&self) -> &'static str {
		match self {
			| ConnectionEstablishmentError::Network(_) => "network",
			| ConnectionEstablishmentError::Codec(_) => "codec",
			| ConnectionEstablishmentError::BrokerRejected { .. } => {
				"broker_rejected"
			}
			| ConnectionEstablishmentError::Timeout { .. } => "timeout",
		}
	}
}

/// Errors that can occur in MQTT client operations
#[derive(Debug, Clone, Error)]
pub enum MqttClientError {
	/// Publish, subscribe or session failure from the delivery engine
	#[error("Delivery error: {0}")]
	Delivery(#[from] DeliveryError),
	/// Session storage failure
	#[error("Persistence error: {0}")]
	Persistence(#[from] PersistenceError),
	/// Invalid broker URI or unsupported scheme
	#[error("Transport error: {0}")]
	Transport(#[from] TransportError),
	/// Invalid topic name or filter
	#[error("Topic error: {0}")]
	Topic(#[from] TopicError),
	/// Connection could not be established
	#[error("Connection error: {0}")]
	Connection(#[from] ConnectionEstablishmentError),
	/// Invalid configuration parameter values
	#[error("Invalid configuration value: {0}")]
	ConfigurationValue(String),
}

impl MqttClientError {
	/// Creates a [`MqttClientError::ConfigurationValue`]
	pub fn configuration_value(message: impl Into<String>) -> Self {
		MqttClientError::ConfigurationValue(message.into())
	}

	/// Returns true if the session can no longer guarantee delivery
	pub fn is_fatal(&self) -> bool {
		match self {
			| MqttClientError::Delivery(err) => err.is_fatal(),
			| MqttClientError::Persistence(_) => true,
			| _ => false,
		}
	}
}
