/// Generate a new sandbox identifier: a 26-character ULID.
///
/// Lexicographically sortable, so listing by id follows creation order.
pub fn generate() -> String {
    ulid::Ulid::new().to_string()
}

/// The single "looks like an ID" predicate used by every service.
///
/// Exactly: length 26, every character in `[0-9A-Z]`. Anything else is
/// treated as a name.
pub fn looks_like_id(s: &str) -> bool {
    s.len() == 26 && s.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
}
