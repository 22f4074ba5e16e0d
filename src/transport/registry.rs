use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxedStream, ServerUri, TransportError};

/// Dials a stream for a server URI
pub trait TransportFactory: Send + Sync {
	/// Opens a new stream to `uri`
	fn connect(
		&self,
		uri: &ServerUri,
	) -> BoxFuture<'static, Result<BoxedStream, TransportError>>;
}

/// Plain TCP via `tokio::net::TcpStream`
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

impl TransportFactory for TcpTransport {
	fn connect(
		&self,
		uri: &ServerUri,
	) -> BoxFuture<'static, Result<BoxedStream, TransportError>> {
		let host = uri.host().to_string();
		let port = uri.port();
		let address = uri.host_port();
		Box::pin(async move {
			let stream = TcpStream::connect((host.as_str(), port))
				.await
				.map_err(|err| TransportError::connect(&address, err))?;
			stream
				.set_nodelay(true)
				.map_err(|err| TransportError::connect(&address, err))?;
			debug!(address = %address, "TCP connection established");
			Ok(Box::new(stream) as BoxedStream)
		})
	}
}

/// Scheme to [`TransportFactory`] lookup, built by the caller.
#[derive(Clone, Default)]
pub struct TransportRegistry {
	factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
	/// Creates an empty registry
	pub fn new() -> Self {
		Self::default()
	}

	/// Registry with `tcp` and `mqtt` mapped to [`TcpTransport`]
	pub fn with_defaults() -> Self {
		let mut registry = Self::new();
		registry.register("tcp", TcpTransport);
		registry.register("mqtt", TcpTransport);
		registry
	}

	/// Registers `factory` for `scheme`, replacing any previous one
	pub fn register(
		&mut self,
		scheme: impl Into<String>,
		factory: impl TransportFactory + 'static,
	) -> &mut Self {
		self.factories
			.insert(scheme.into().to_ascii_lowercase(), Arc::new(factory));
		self
	}

	/// Factory registered for `scheme`
	pub fn get(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
		self.factories.get(&scheme.to_ascii_lowercase()).cloned()
	}

	/// Returns true if a factory is registered for `scheme`
	pub fn supports(&self, scheme: &str) -> bool {
		self.factories.contains_key(&scheme.to_ascii_lowercase())
	}

	/// Dials `uri` with the factory registered for its scheme
	pub async fn connect(
		&self,
		uri: &ServerUri,
	) -> Result<BoxedStream, TransportError> {
		let factory = self.get(uri.scheme()).ok_or_else(|| {
			TransportError::UnsupportedScheme {
				scheme: uri.scheme().to_string(),
			}
		})?;
		factory.connect(uri).await
	}
}

impl fmt::Debug for TransportRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut schemes: Vec<_> = self.factories.keys().collect();
		schemes.sort();
		f.debug_struct("TransportRegistry")
			.field("schemes", &schemes)
			.finish()
	}
}
