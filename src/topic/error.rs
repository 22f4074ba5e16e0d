//! Error types and limits for topic names and topic filters

use thiserror::Error;

/// A topic name or topic filter failed validation.
///
/// Validation happens before any network or persistence action, so a
/// `TopicError` never leaves partial state behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicError {
	/// Topic is empty
	#[error("Topic cannot be empty")]
	Empty,

	/// Encoded topic exceeds the MQTT string limit
	#[error("Topic is {len} bytes long, the limit is {max}")]
	TooLong {
		/// Encoded length in bytes
		len: usize,
		/// Largest allowed length
		max: usize,
	},

	/// Topic contains the U+0000 character
	#[error("Topic '{topic}' contains a null character")]
	NullCharacter {
		/// The offending topic
		topic: String,
	},

	/// Wildcards used where only a concrete topic name is allowed
	#[error("Topic '{topic}' contains wildcards, which are not allowed here")]
	WildcardsNotAllowed {
		/// The offending topic
		topic: String,
	},

	/// `#` is repeated or not the whole last level
	#[error(
		"Invalid topic filter '{topic}': # wildcard must be the last level \
		 and appear only once"
	)]
	MultiLevelWildcard {
		/// The offending filter
		topic: String,
	},

	/// `+` shares a level with other characters
	#[error(
		"Invalid topic filter '{topic}': + wildcard must occupy a whole level \
		 (position {position})"
	)]
	SingleLevelWildcard {
		/// The offending filter
		topic: String,
		/// Byte offset of the misplaced `+`
		position: usize,
	},

	/// `$share/` filter while shared subscriptions are disabled
	#[error("Shared subscription '{topic}' is not allowed")]
	SharedSubscriptionNotAllowed {
		/// The offending filter
		topic: String,
	},

	/// Malformed `$share/<group>/<filter>`
	#[error("Invalid shared subscription '{topic}': {reason}")]
	InvalidSharedSubscription {
		/// The offending filter
		topic: String,
		/// What is wrong with it
		reason: String,
	},
}

impl TopicError {
	/// Creates a new SingleLevelWildcard error
	pub fn single_level_wildcard(
		topic: impl Into<String>,
		position: usize,
	) -> Self {
		Self::SingleLevelWildcard {
			topic: topic.into(),
			position,
		}
	}

	/// Creates a new InvalidSharedSubscription error
	pub fn invalid_shared(
		topic: impl Into<String>,
		reason: impl Into<String>,
	) -> Self {
		Self::InvalidSharedSubscription {
			topic: topic.into(),
			reason: reason.into(),
		}
	}

	/// Returns the error type for categorization
	pub fn error_type(&self) -> &'static str {
		match self {
			| TopicError::Empty => "empty",
			| TopicError::TooLong { .. } => "too_long",
			| TopicError::NullCharacter { .. } => "null_character",
			| TopicError::WildcardsNotAllowed { .. } => "wildcards_not_allowed",
			| TopicError::MultiLevelWildcard { .. } => "multi_level_wildcard",
			| TopicError::SingleLevelWildcard { .. } => "single_level_wildcard",
			| TopicError::SharedSubscriptionNotAllowed { .. } => {
				"shared_subscription_not_allowed"
			}
			| TopicError::InvalidSharedSubscription { .. } => {
				"invalid_shared_subscription"
			}
		}
	}
}

/// Convenient Result type for topic operations
pub type TopicResult<T> = Result<T, TopicError>;

/// Topic limits and reserved tokens
pub mod limits {
	/// Minimum encoded topic length in bytes
	pub const MIN_TOPIC_LENGTH: usize = 1;

	/// Maximum encoded topic length in bytes (MQTT UTF-8 string limit)
	pub const MAX_TOPIC_LENGTH: usize = 65535;

	/// Level separator
	pub const LEVEL_SEPARATOR: char = '/';

	/// Single-level wildcard
	pub const SINGLE_LEVEL_WILDCARD: char = '+';

	/// Multi-level wildcard
	pub const MULTI_LEVEL_WILDCARD: char = '#';

	/// Prefix of a shared subscription filter
	pub const SHARED_SUBSCRIPTION_PREFIX: &str = "$share/";
}
