//! MQTT client module
//!
//! This module provides the async client handle, its configuration and the
//! errors surfaced while connecting.

/// Asynchronous MQTT client implementation
pub mod async_client;
/// Client configuration
pub mod config;
/// Client error types
pub mod error;
/// Inbound message callbacks
pub mod handler;

// Re-export commonly used types for convenience
pub use async_client::MqttClient;
pub use config::{ClientSettings, Credentials, MqttClientConfig, generate_client_id};
pub use error::{ConnectionEstablishmentError, MqttClientError};
pub use handler::MessageHandler;

// Connection type is available from the root level
// Use: mqtt_durable_client::MqttConnection
