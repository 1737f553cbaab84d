//! String hygiene for untrusted request input.

/// Truncates `value` to at most `max_bytes` bytes.
///
/// The cut is moved back to the nearest char boundary so the result is
/// always valid UTF-8. Oversized input is never an error.
pub fn shorten(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }

    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
