use super::error::limits::{
	LEVEL_SEPARATOR, SHARED_SUBSCRIPTION_PREFIX,
};

/// Returns true if the concrete topic `name` matches the subscription
/// `filter`.
///
/// Both strings are compared level by level: `+` matches exactly one level,
/// a trailing `#` matches the remaining levels including none at all (so
/// `sport/#` matches `sport`), and every other level must be equal. A
/// `$share/<group>/` prefix is ignored so shared subscriptions dispatch on
/// their real filter.
///
/// The filter is expected to be valid; see [`super::validate`].
pub fn is_matched(filter: &str, name: &str) -> bool {
	let filter = strip_shared_prefix(filter);
	if filter == name {
		return true;
	}

	let mut filter_levels = filter.split(LEVEL_SEPARATOR);
	let mut name_levels = name.split(LEVEL_SEPARATOR);
	loop {
		match (filter_levels.next(), name_levels.next()) {
			| (Some("#"), _) => return filter_levels.next().is_none(),
			| (Some("+"), Some(_)) => {}
			| (Some(expected), Some(found)) if expected == found => {}
			| (None, None) => return true,
			| _ => return false,
		}
	}
}

/// Strips `$share/<group>/` from a shared subscription filter.
///
/// Filters without the prefix, or with a malformed one, are returned as is.
pub fn strip_shared_prefix(filter: &str) -> &str {
	filter
		.strip_prefix(SHARED_SUBSCRIPTION_PREFIX)
		.and_then(|rest| rest.split_once(LEVEL_SEPARATOR))
		.map_or(filter, |(_, real_filter)| real_filter)
}
