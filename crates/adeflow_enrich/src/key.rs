/// Canonical form of a lookup term: trimmed, lowercased, inner whitespace
/// collapsed to single spaces. `None` when nothing is left.
pub fn normalize_key(raw: &str) -> Option<String> {
    let normalized = raw
        .split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
