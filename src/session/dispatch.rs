use std::collections::BTreeMap;

use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::Message;
use crate::topic::is_matched;

/// Active subscription filters and the channel inbound messages are pushed
/// to.
///
/// Messages that match no active filter are dropped here, so the
/// application only ever sees traffic it asked for.
#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
	filters: BTreeMap<String, QoS>,
	// None once the session is closed
	messages: Option<mpsc::UnboundedSender<Message>>,
}

impl SubscriptionRegistry {
	pub(crate) fn new(messages: mpsc::UnboundedSender<Message>) -> Self {
		Self {
			filters: BTreeMap::new(),
			messages: Some(messages),
		}
	}

	/// Drops the sender so the receiving side sees the end of the stream.
	pub(crate) fn close(&mut self) {
		self.messages = None;
	}

	pub(crate) fn activate(&mut self, filter: &str, qos: QoS) {
		self.filters.insert(filter.to_string(), qos);
	}

	pub(crate) fn deactivate(&mut self, filter: &str) -> bool {
		self.filters.remove(filter).is_some()
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.filters.is_empty()
	}

	pub(crate) fn filters(&self) -> Vec<(String, QoS)> {
		self.filters
			.iter()
			.map(|(filter, qos)| (filter.clone(), *qos))
			.collect()
	}

	pub(crate) fn matches(&self, topic: &str) -> bool {
		self.filters.keys().any(|filter| is_matched(filter, topic))
	}

	/// Pushes `message` to the application if an active filter matches.
	/// Returns true if the message was handed over.
	pub(crate) fn deliver(&self, message: Message) -> bool {
		if !self.matches(&message.topic) {
			debug!(
				topic = %message.topic,
				"Dropping message that matches no active subscription"
			);
			return false;
		}
		self.release(message)
	}

	/// Pushes `message` to the application without consulting the filters.
	///
	/// Used for inbound QoS2 messages whose match was decided when the
	/// PUBLISH arrived.
	pub(crate) fn release(&self, message: Message) -> bool {
		let Some(messages) = &self.messages else {
			debug!(topic = %message.topic, "Session closed, message discarded");
			return false;
		};
		trace!(
			topic = %message.topic,
			payload_size = message.payload.len(),
			"Delivering message"
		);
		if messages.send(message).is_err() {
			debug!("Message receiver dropped, message discarded");
			return false;
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_delivers_only_matching_messages() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut registry = SubscriptionRegistry::new(tx);

		assert!(!registry.deliver(Message::new("sport/tennis", "x", QoS::AtMostOnce, false)));

		registry.activate("sport/+", QoS::AtLeastOnce);
		registry.activate("$share/g/news/#", QoS::AtMostOnce);
		assert!(registry.deliver(Message::new("sport/tennis", "1", QoS::AtMostOnce, false)));
		assert!(registry.deliver(Message::new("news", "2", QoS::AtMostOnce, false)));
		assert!(!registry.deliver(Message::new("sport", "3", QoS::AtMostOnce, false)));

		assert_eq!(rx.try_recv().unwrap().payload.as_ref(), b"1");
		assert_eq!(rx.try_recv().unwrap().payload.as_ref(), b"2");
		assert!(rx.try_recv().is_err());

		assert!(registry.deactivate("sport/+"));
		assert!(!registry.deactivate("sport/+"));
		assert!(!registry.matches("sport/tennis"));

		assert!(registry.release(Message::new("sport/tennis", "5", QoS::ExactlyOnce, false)));
		assert_eq!(rx.try_recv().unwrap().payload.as_ref(), b"5");

		registry.close();
		assert!(!registry.deliver(Message::new("news", "4", QoS::AtMostOnce, false)));
		assert!(!registry.release(Message::new("news", "6", QoS::AtMostOnce, false)));
		assert!(rx.try_recv().is_err());
	}
}
