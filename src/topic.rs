//! Topic handling module
//!
//! Validation of topic names and subscription filters, and wildcard matching
//! of concrete topic names against filters.

/// Topic errors and limits
pub mod error;
/// Wildcard matching
pub mod topic_matcher;
pub mod validation;


pub use error::{TopicError, TopicResult, limits};
pub use topic_matcher::{is_matched, strip_shared_prefix};
pub use validation::{
	contains_wildcards, validate, validate_topic_filter, validate_topic_name,
};
