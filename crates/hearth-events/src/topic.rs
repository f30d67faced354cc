//! Hierarchical topic pattern matching.

/// Check whether a dotted topic matches a subscription pattern.
///
/// Patterns are dotted segments where `*` matches exactly one segment
/// and a trailing `**` matches one or more remaining segments:
///
/// - `logs.*` matches `logs.gateway` but not `logs.gateway.request`
/// - `logs.**` matches both
/// - `*` alone matches any single-segment topic
#[must_use]
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('.').peekable();
    let mut topic_segments = topic.split('.');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("**"), Some(_)) => {
                // `**` must be the final pattern segment; it swallows
                // the rest of the topic.
                return pattern_segments.peek().is_none();
            }
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("gateway.request.echo", "gateway.request.echo"));
        assert!(!topic_matches("gateway.request.echo", "gateway.request.users"));
    }

    #[test]
    fn test_single_wildcard() {
        assert!(topic_matches("gateway.request.*", "gateway.request.echo"));
        assert!(!topic_matches("gateway.request.*", "gateway.request"));
        assert!(!topic_matches(
            "gateway.request.*",
            "gateway.request.echo.extra"
        ));
        assert!(topic_matches("gateway.*.echo", "gateway.request.echo"));
    }

    #[test]
    fn test_trailing_multi_wildcard() {
        assert!(topic_matches("logs.**", "logs.gateway"));
        assert!(topic_matches("logs.**", "logs.gateway.request"));
        assert!(!topic_matches("logs.**", "logs"));
        assert!(!topic_matches("logs.**", "metrics.gateway"));
    }

    #[test]
    fn test_segment_count_mismatch() {
        assert!(!topic_matches("a.b", "a"));
        assert!(!topic_matches("a", "a.b"));
    }
}
