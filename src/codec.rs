//! MQTT 3.1.1 packet framing
//!
//! Encoding and decoding are delegated to rumqttc's v4 packet types; this
//! module only frames a byte buffer into packets and turns the packets the
//! engine emits into bytes.

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::Error as WireError;
use rumqttc::{
	Connect, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS, Subscribe,
	SubscribeFilter, Unsubscribe,
};
use thiserror::Error;

/// PINGREQ, fixed header only
pub const PINGREQ: [u8; 2] = [0xC0, 0x00];
/// DISCONNECT, fixed header only
pub const DISCONNECT: [u8; 2] = [0xE0, 0x00];
/// Largest inbound packet accepted by default
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Errors raised while framing or encoding packets.
///
/// A malformed inbound packet leaves the byte stream out of sync, so it is
/// fatal for the connection (not for the session).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
	/// Inbound bytes are not a valid packet
	#[error("Malformed packet: {reason}")]
	Malformed {
		/// Decoder message
		reason: String,
	},

	/// An outbound packet could not be encoded
	#[error("Failed to encode {packet}: {reason}")]
	Encode {
		/// Packet kind, e.g. `PUBLISH`
		packet: &'static str,
		/// Encoder message
		reason: String,
	},
}

impl CodecError {
	fn encode(packet: &'static str, err: WireError) -> Self {
		Self::Encode {
			packet,
			reason: err.to_string(),
		}
	}
}

/// Takes one complete packet off the front of `buffer`.
///
/// Returns `Ok(None)` and leaves the buffer untouched when more bytes are
/// needed.
pub fn read_packet(
	buffer: &mut BytesMut,
	max_packet_size: usize,
) -> Result<Option<Packet>, CodecError> {
	match rumqttc::mqttbytes::v4::read(buffer, max_packet_size) {
		| Ok(packet) => Ok(Some(packet)),
		| Err(WireError::InsufficientBytes(_)) => Ok(None),
		| Err(err) => Err(CodecError::Malformed {
			reason: err.to_string(),
		}),
	}
}

fn encode_with(
	packet: &'static str,
	write: impl FnOnce(&mut BytesMut) -> Result<usize, WireError>,
) -> Result<Bytes, CodecError> {
	let mut buffer = BytesMut::new();
	write(&mut buffer).map_err(|err| CodecError::encode(packet, err))?;
	Ok(buffer.freeze())
}

/// Encodes a PUBLISH. `message_id` is ignored for QoS0.
pub fn encode_publish(
	topic: &str,
	payload: &Bytes,
	qos: QoS,
	retain: bool,
	message_id: u16,
	dup: bool,
) -> Result<Bytes, CodecError> {
	let mut publish = Publish::new(topic, qos, Vec::<u8>::new());
	publish.payload = payload.clone();
	publish.retain = retain;
	if qos != QoS::AtMostOnce {
		publish.pkid = message_id;
		publish.dup = dup;
	}
	encode_with("PUBLISH", |buffer| publish.write(buffer))
}

/// Encodes a PUBACK
pub fn encode_puback(message_id: u16) -> Result<Bytes, CodecError> {
	encode_with("PUBACK", |buffer| PubAck::new(message_id).write(buffer))
}

/// Encodes a PUBREC
pub fn encode_pubrec(message_id: u16) -> Result<Bytes, CodecError> {
	encode_with("PUBREC", |buffer| PubRec::new(message_id).write(buffer))
}

/// Encodes a PUBREL
pub fn encode_pubrel(message_id: u16) -> Result<Bytes, CodecError> {
	encode_with("PUBREL", |buffer| PubRel::new(message_id).write(buffer))
}

/// Encodes a PUBCOMP
pub fn encode_pubcomp(message_id: u16) -> Result<Bytes, CodecError> {
	encode_with("PUBCOMP", |buffer| PubComp::new(message_id).write(buffer))
}

/// Encodes a SUBSCRIBE for every `(filter, qos)` pair
pub fn encode_subscribe(
	message_id: u16,
	filters: &[(String, QoS)],
) -> Result<Bytes, CodecError> {
	let subscribe = Subscribe {
		pkid: message_id,
		filters: filters
			.iter()
			.map(|(filter, qos)| SubscribeFilter::new(filter.clone(), *qos))
			.collect(),
	};
	encode_with("SUBSCRIBE", |buffer| subscribe.write(buffer))
}

/// Encodes an UNSUBSCRIBE
pub fn encode_unsubscribe(
	message_id: u16,
	filters: &[String],
) -> Result<Bytes, CodecError> {
	let unsubscribe = Unsubscribe {
		pkid: message_id,
		topics: filters.to_vec(),
	};
	encode_with("UNSUBSCRIBE", |buffer| unsubscribe.write(buffer))
}

/// Encodes a CONNECT
pub fn encode_connect(
	client_id: &str,
	keep_alive_secs: u16,
	clean_session: bool,
	credentials: Option<(&str, &str)>,
) -> Result<Bytes, CodecError> {
	let mut connect = Connect::new(client_id);
	connect.keep_alive = keep_alive_secs;
	connect.clean_session = clean_session;
	if let Some((username, password)) = credentials {
		connect.set_login(username, password);
	}
	encode_with("CONNECT", |buffer| connect.write(buffer))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_partial_packet_needs_more_bytes() {
		let publish = encode_publish(
			"sensors/temperature",
			&Bytes::from_static(b"21.5"),
			QoS::AtLeastOnce,
			false,
			7,
			false,
		)
		.unwrap();

		let mut buffer = BytesMut::from(&publish[..publish.len() - 1]);
		assert!(matches!(
			read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE),
			Ok(None)
		));
		assert_eq!(buffer.len(), publish.len() - 1);

		buffer.extend_from_slice(&publish[publish.len() - 1..]);
		buffer.extend_from_slice(&encode_puback(7).unwrap());
		match read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE) {
			| Ok(Some(Packet::Publish(p))) => {
				assert_eq!(p.topic, "sensors/temperature");
				assert_eq!(p.pkid, 7);
				assert_eq!(p.qos, QoS::AtLeastOnce);
				assert!(!p.dup);
				assert_eq!(p.payload.as_ref(), b"21.5");
			}
			| other => panic!("expected PUBLISH, got {other:?}"),
		}
		assert!(matches!(
			read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE),
			Ok(Some(Packet::PubAck(ack))) if ack.pkid == 7
		));
		assert!(buffer.is_empty());
	}

	#[test]
	fn test_dup_flag_only_for_qos_above_zero() {
		let payload = Bytes::from_static(b"x");
		let dup = encode_publish("a", &payload, QoS::ExactlyOnce, true, 3, true)
			.unwrap();
		// DUP, QoS2 and RETAIN bits of the fixed header
		assert_eq!(dup[0], 0x30 | 0x08 | 0x04 | 0x01);

		let qos0 =
			encode_publish("a", &payload, QoS::AtMostOnce, false, 3, true).unwrap();
		assert_eq!(qos0[0], 0x30);
	}

	#[test]
	fn test_malformed_packet() {
		// Reserved packet type 0
		let mut buffer = BytesMut::from(&[0x00, 0x00][..]);
		assert!(matches!(
			read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE),
			Err(CodecError::Malformed { .. })
		));
	}

	#[test]
	fn test_fixed_packets() {
		let mut buffer = BytesMut::from(&[0xD0, 0x00][..]);
		assert!(matches!(
			read_packet(&mut buffer, DEFAULT_MAX_PACKET_SIZE),
			Ok(Some(_))
		));
		assert_eq!(encode_pubrel(1).unwrap().as_ref(), &[0x62, 0x02, 0x00, 0x01]);
	}
}
