use tokio::sync::mpsc;
use tracing::debug;

use crate::session::Message;

/// Receives messages that match an active subscription.
///
/// Called from a dedicated dispatcher task, never under the session lock,
/// in the order the broker delivered the messages.
pub trait MessageHandler: Send + 'static {
	/// Handles one inbound message
	fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where F: Fn(Message) + Send + 'static
{
	fn on_message(&self, message: Message) {
		self(message)
	}
}

/// Feeds queued messages to `handler` until the session closes its sender.
pub(crate) async fn dispatch_messages<H: MessageHandler>(
	mut messages: mpsc::UnboundedReceiver<Message>,
	handler: H,
) {
	while let Some(message) = messages.recv().await {
		handler.on_message(message);
	}
	debug!("Message dispatcher stopped");
}

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};

	use rumqttc::QoS;

	use super::*;

	#[tokio::test]
	async fn test_dispatch_runs_until_sender_dropped() {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		let (tx, rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(dispatch_messages(rx, move |message: Message| {
			sink.lock().unwrap().push(message.topic.to_string());
		}));

		tx.send(Message::new("a/1", "x", QoS::AtMostOnce, false)).unwrap();
		tx.send(Message::new("a/2", "y", QoS::AtLeastOnce, false)).unwrap();
		drop(tx);
		task.await.unwrap();

		assert_eq!(*seen.lock().unwrap(), vec!["a/1", "a/2"]);
	}
}
