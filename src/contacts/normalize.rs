//! Identifier normalization shared by the directory and the deduplicator.

/// Normalize a phone number to `+<digits>`.
///
/// Bare 10-digit numbers are treated as NANP and get a `+1` prefix;
/// 11-digit numbers starting with `1` get a `+`. Returns `None` when the
/// input has fewer than 7 digits or contains letters.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_alphabetic()) {
        return None;
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }
    if trimmed.starts_with('+') {
        return Some(format!("+{digits}"));
    }
    match digits.len() {
        10 => Some(format!("+1{digits}")),
        11 if digits.starts_with('1') => Some(format!("+{digits}")),
        _ => Some(format!("+{digits}")),
    }
}

/// Lowercased, trimmed mail address, or `None` if it does not look like one.
pub fn normalize_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('<').trim_end_matches('>');
    let (local, domain) = trimmed.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Sender ids that are neither numbers nor addresses, such as SMS short
/// codes ("72345") or alphanumeric sender ids ("AMAZON"). Lowercased; `None`
/// for empty input or anything with inner whitespace.
pub fn normalize_handle(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Canonical form of any sender identifier.
///
/// Phone numbers become `+<digits>`, addresses are lowercased, anything else
/// is trimmed and lowercased.
pub fn normalize_identifier(raw: &str) -> String {
    if let Some(address) = normalize_address(raw) {
        return address;
    }
    if let Some(phone) = normalize_phone(raw) {
        return phone;
    }
    raw.trim().to_lowercase()
}
