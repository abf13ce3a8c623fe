//! Wildcard matching between topic names and subscription filters
//!
//! Fan-out goes from a topic to its subscribers by enumerating every filter
//! that could match the topic and looking each one up in the subscription
//! map. For a topic of `n` levels that is `2^(n+1) + 2^n - 1` candidates,
//! so topics deeper than [`EXPANSION_DEPTH_LIMIT`] are matched by scanning
//! the registered filters with [`topic_matches_filter`] instead.
//!
//! Rules:
//! - `/` separates levels, empty levels are significant
//! - `+` matches exactly one level
//! - `#` matches the parent level and everything below it, and must be last
//! - topics starting with `$` are not matched by a leading `+` or `#`

/// Deepest topic still matched by candidate expansion
pub const EXPANSION_DEPTH_LIMIT: usize = 12;

/// Number of `/`-separated levels in a topic or filter
#[inline]
pub fn level_count(topic: &str) -> usize {
    topic.split('/').count()
}

/// Every filter string that matches `topic`.
///
/// Each level contributes either itself or `+`; at every level boundary a
/// `#` may end the filter. The returned filters are distinct.
pub fn candidate_filters(topic: &str) -> Vec<String> {
    let levels: Vec<&str> = topic.split('/').collect();
    let system = topic.starts_with('$');

    let mut out = Vec::with_capacity(3 << levels.len().min(EXPANSION_DEPTH_LIMIT));
    let mut prefixes = vec![String::new()];

    for (i, level) in levels.iter().enumerate() {
        let wildcards = !(system && i == 0);
        if wildcards {
            out.extend(prefixes.iter().map(|p| format!("{}#", p)));
        }

        let sep = if i + 1 < levels.len() { "/" } else { "" };
        let mut next = Vec::with_capacity(prefixes.len() * 2);
        for prefix in &prefixes {
            next.push(format!("{}{}{}", prefix, level, sep));
            if wildcards {
                next.push(format!("{}+{}", prefix, sep));
            }
        }
        prefixes = next;
    }

    // "a/b/#" also matches "a/b"
    out.extend(prefixes.iter().map(|p| format!("{}/#", p)));
    out.extend(prefixes);
    out
}

/// Check if a topic filter matches a topic name
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(filter_level) = filter_levels.next() {
        if filter_level == "#" {
            return filter_levels.peek().is_none();
        }
        match topic_levels.next() {
            Some(level) if filter_level == "+" || filter_level == level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

/// Validate a topic name for a broker-originated publish
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }
    if topic.len() > u16::MAX as usize {
        return Err("topic name exceeds maximum length");
    }
    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }
    if topic.contains(['+', '#']) {
        return Err("topic name cannot contain wildcards");
    }
    Ok(())
}
