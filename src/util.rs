//! Shared text helpers.

/// Keep the last `limit` bytes of `text`, cut on a char boundary, with a
/// marker noting how much was dropped. Test and compiler failures print
/// their summary at the end, so the tail is what matters.
pub fn truncate_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {} bytes truncated ...]\n{}", start, &text[start..])
}

/// Keep the first `limit` bytes of `text`, cut on a char boundary.
pub fn truncate_head(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[... {} bytes truncated ...]",
        &text[..end],
        text.len() - end
    )
}

/// Lowercase, dash-separated, at most `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut collapsed = String::new();
    for part in slug.split('-').filter(|p| !p.is_empty()) {
        if !collapsed.is_empty() {
            collapsed.push('-');
        }
        collapsed.push_str(part);
    }
    let mut truncated: String = collapsed.chars().take(max_len).collect();
    while truncated.ends_with('-') {
        truncated.pop();
    }
    truncated
}
