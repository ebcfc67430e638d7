use std::borrow::Cow;

/// Normalizes a metric name for line based protocols such as graphite.
///
/// Whitespace becomes `_`, slashes become `-` and all other characters outside of
/// `[A-Za-z0-9_.-]` are removed.
pub fn sanitize_path(name: &str) -> Cow<'_, str> {
    let is_clean = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if is_clean {
        return Cow::Borrowed(name);
    }

    let sanitized = name
        .chars()
        .filter_map(|c| match c {
            c if c.is_whitespace() => Some('_'),
            '/' => Some('-'),
            c if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') => Some(c),
            _ => None,
        })
        .collect();

    Cow::Owned(sanitized)
}

/// Replaces characters that carry meaning in graphite tags (`;`, `=`, `~`, `!`) and
/// whitespace with `_`.
pub fn sanitize_tag(value: &str) -> Cow<'_, str> {
    let is_reserved = |c: char| c.is_whitespace() || matches!(c, ';' | '=' | '~' | '!');
    if !value.contains(is_reserved) {
        return Cow::Borrowed(value);
    }

    Cow::Owned(value.replace(is_reserved, "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert!(matches!(sanitize_path("api.requests"), Cow::Borrowed(_)));
        assert_eq!(sanitize_path("api requests/s!"), "api_requests-s");
        assert_eq!(sanitize_path("päge.views"), "pge.views");
    }

    #[test]
    fn test_sanitize_tag() {
        assert!(matches!(sanitize_tag("production"), Cow::Borrowed(_)));
        assert_eq!(sanitize_tag("a;b=c d"), "a_b_c_d");
    }
}
