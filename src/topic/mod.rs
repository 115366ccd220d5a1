//! Topic names, topic filters and matching
//!
//! Implements MQTT v3.1.1 topic semantics: `/`-separated levels, the `+`
//! single-level and `#` multi-level wildcards, and the rule that topics
//! whose first level starts with `$` never match a leading wildcard.

/// Topic level separator
pub const SEPARATOR: char = '/';

/// Multi-level wildcard, only valid as the final level of a filter
pub const WILDCARD: &str = "#";

/// Single-level wildcard
pub const PART_WILDCARD: &str = "+";

/// Prefix of server-internal topics ($SYS and friends)
pub const INTERNAL_PREFIX: char = '$';

/// Split a topic or filter into its levels
pub fn split(topic: &str) -> Vec<&str> {
    topic.split(SEPARATOR).collect()
}

/// Join topic levels back into a topic string
pub fn join(parts: &[&str]) -> String {
    parts.join("/")
}

/// Validate a topic name as used in PUBLISH: non-empty, no NUL and no
/// wildcard characters anywhere.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("empty topic");
    }
    if topic.contains(['#', '+', '\0']) {
        return Err("topic contains invalid characters");
    }
    Ok(())
}

/// Validate a topic filter as used in SUBSCRIBE: non-empty, no NUL; `+` only
/// as a whole level; `#` only as the final whole level.
pub fn validate_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("empty topic filter");
    }
    if filter.contains('\0') {
        return Err("topic filter contains NUL character");
    }
    let parts: Vec<&str> = filter.split(SEPARATOR).collect();
    for (i, part) in parts.iter().enumerate() {
        if part.contains(['#', '+']) && part.len() != 1 {
            return Err("wildcard must occupy an entire filter level");
        }
        if *part == WILDCARD && i != parts.len() - 1 {
            return Err("multi-level wildcard must be the final filter level");
        }
    }
    Ok(())
}

/// Match a topic to a filter
pub fn matches(topic: &str, filter: &str) -> bool {
    matches_parts(&split(topic), &split(filter))
}

/// Match split topic levels against split filter levels.
///
/// `+` consumes exactly one level, a trailing `#` consumes the rest, and a
/// `$`-prefixed first topic level refuses to match a leading wildcard.
pub fn matches_parts<T, F>(topic_parts: &[T], filter_parts: &[F]) -> bool
where
    T: AsRef<str>,
    F: AsRef<str>,
{
    if topic_parts.is_empty() || filter_parts.is_empty() {
        return false;
    }
    if topic_parts[0].as_ref().starts_with(INTERNAL_PREFIX)
        && (filter_parts[0].as_ref() == PART_WILDCARD || filter_parts[0].as_ref() == WILDCARD)
    {
        return false;
    }
    for (i, part) in topic_parts.iter().enumerate() {
        match filter_parts.get(i).map(AsRef::as_ref) {
            None => return false,
            Some(f) if f == WILDCARD => return true,
            Some(f) if f != PART_WILDCARD && f != part.as_ref() => return false,
            Some(_) => {}
        }
    }
    // "a/b" also matches "a/b/#" (the wildcard covers zero levels)
    filter_parts.len() == topic_parts.len()
        || (filter_parts.len() == topic_parts.len() + 1
            && filter_parts[topic_parts.len()].as_ref() == WILDCARD)
}
