//! Validation of topic names and topic filters

use super::error::limits::*;
use super::error::{TopicError, TopicResult};

/// Validates a topic name or topic filter.
///
/// `wildcards_allowed` is `false` for topic names used in PUBLISH and `true`
/// for subscription filters. Rules are checked in order: encoded length,
/// wildcard presence, `#` placement, `+` placement, shared subscription
/// syntax.
pub fn validate(
	topic: &str,
	wildcards_allowed: bool,
	shared_subscriptions_allowed: bool,
) -> TopicResult<()> {
	let len = topic.len();
	if len < MIN_TOPIC_LENGTH {
		return Err(TopicError::Empty);
	}
	if len > MAX_TOPIC_LENGTH {
		return Err(TopicError::TooLong {
			len,
			max: MAX_TOPIC_LENGTH,
		});
	}
	if topic.contains('\0') {
		return Err(TopicError::NullCharacter {
			topic: topic.to_string(),
		});
	}

	if !wildcards_allowed {
		if contains_wildcards(topic) {
			return Err(TopicError::WildcardsNotAllowed {
				topic: topic.to_string(),
			});
		}
		return Ok(());
	}

	validate_multi_level_wildcard(topic)?;
	validate_single_level_wildcard(topic)?;

	if let Some(rest) = topic.strip_prefix(SHARED_SUBSCRIPTION_PREFIX) {
		if !shared_subscriptions_allowed {
			return Err(TopicError::SharedSubscriptionNotAllowed {
				topic: topic.to_string(),
			});
		}
		validate_shared_subscription(topic, rest)?;
	}

	Ok(())
}

/// Validates a concrete topic name for PUBLISH.
pub fn validate_topic_name(topic: &str) -> TopicResult<()> {
	validate(topic, false, false)
}

/// Validates a subscription filter.
pub fn validate_topic_filter(
	filter: &str,
	shared_subscriptions_allowed: bool,
) -> TopicResult<()> {
	validate(filter, true, shared_subscriptions_allowed)
}

/// Returns true if the topic contains `+` or `#`
pub fn contains_wildcards(topic: &str) -> bool {
	topic.contains([SINGLE_LEVEL_WILDCARD, MULTI_LEVEL_WILDCARD])
}

fn validate_multi_level_wildcard(topic: &str) -> TopicResult<()> {
	let count = topic.matches(MULTI_LEVEL_WILDCARD).count();
	if count == 0 {
		return Ok(());
	}
	let isolated = topic == "#" || topic.ends_with("/#");
	if count > 1 || !isolated {
		return Err(TopicError::MultiLevelWildcard {
			topic: topic.to_string(),
		});
	}
	Ok(())
}

fn validate_single_level_wildcard(topic: &str) -> TopicResult<()> {
	let bytes = topic.as_bytes();
	let separator = LEVEL_SEPARATOR as u8;
	for (position, _) in topic.match_indices(SINGLE_LEVEL_WILDCARD) {
		let before_ok = position == 0 || bytes[position - 1] == separator;
		let after_ok =
			position + 1 == bytes.len() || bytes[position + 1] == separator;
		if !before_ok || !after_ok {
			return Err(TopicError::single_level_wildcard(topic, position));
		}
	}
	Ok(())
}

fn validate_shared_subscription(topic: &str, rest: &str) -> TopicResult<()> {
	let Some((group, filter)) = rest.split_once(LEVEL_SEPARATOR) else {
		return Err(TopicError::invalid_shared(
			topic,
			"expected $share/<group>/<filter>",
		));
	};
	if group.is_empty() {
		return Err(TopicError::invalid_shared(topic, "share name is empty"));
	}
	if contains_wildcards(group) {
		return Err(TopicError::invalid_shared(
			topic,
			"share name cannot contain wildcards",
		));
	}
	if filter.is_empty() {
		return Err(TopicError::invalid_shared(topic, "filter is empty"));
	}
	Ok(())
}
