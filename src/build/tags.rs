// Tag and platform list parsing

/// Tag used when the operator did not name any
pub(crate) const DEFAULT_TAG: &str = "latest";

/// Separators accepted between tags: ASCII comma, full-width comma, pipe
const TAG_SEPARATORS: &[char] = &[',', '\u{FF0C}', '|'];

/// Split a free-form tag input into an ordered list of tags.
///
/// Segments are trimmed and empty segments dropped. The result is never empty:
/// when nothing usable remains, a single `latest` tag is returned.
pub(crate) fn parse_tags(input: &str) -> Vec<String> {
    let tags: Vec<String> = input
        .split(TAG_SEPARATORS)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if tags.is_empty() {
        vec![DEFAULT_TAG.to_string()]
    } else {
        tags
    }
}

/// Split a comma-separated platform list (e.g. `linux/amd64,linux/arm64`)
pub(crate) fn parse_platforms(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
