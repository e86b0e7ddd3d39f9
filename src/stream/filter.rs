/// Whether any pattern in `filters` accepts `event_type`. `*` matches any run
/// of characters, so `*` accepts everything and `invoice.*` accepts
/// `invoice.created`. An empty list accepts nothing; callers normalise
/// their lists with [`event_type_filters`] first.
pub fn matches_event_type(filters: &[String], event_type: &str) -> bool {
    filters
        .iter()
        .any(|pattern| glob_match(pattern.trim(), event_type))
}

/// Drops blank patterns; a list left empty means every event type.
pub fn event_type_filters(raw: Vec<String>) -> Vec<String> {
    let filters: Vec<String> = raw
        .into_iter()
        .map(|pattern| pattern.trim().to_string())
        .filter(|pattern| !pattern.is_empty())
        .collect();
    if filters.is_empty() {
        vec!["*".to_string()]
    } else {
        filters
    }
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = value.strip_prefix(first) else {
        return false;
    };

    let middle: Vec<&str> = parts.collect();
    let Some((last, inner)) = middle.split_last() else {
        return true;
    };
    for part in inner {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
