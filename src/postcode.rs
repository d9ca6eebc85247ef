/// Canonicalizes a free-text Dutch postal code into the form used for cache keys.
///
/// `"1234ab"` becomes `"1234 AB"`. Inputs that are not a full postal code fall back to
/// the first run of four digits, and anything else is returned stripped and uppercased.
pub fn normalize_postcode(raw: &str) -> String {
    let compact: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect();

    if is_full_postcode(&compact) {
        return format!("{} {}", &compact[..4], &compact[4..]);
    }

    if let Some(digits) = first_four_digit_run(&compact) {
        return digits.to_string();
    }

    compact
}

fn is_full_postcode(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 6
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4..].iter().all(u8::is_ascii_uppercase)
}

fn first_four_digit_run(value: &str) -> Option<&str> {
    let bytes = value.as_bytes();
    let mut run_start = None;
    for (idx, byte) in bytes.iter().enumerate() {
        if byte.is_ascii_digit() {
            let start = *run_start.get_or_insert(idx);
            if idx + 1 - start == 4 {
                return Some(&value[start..=idx]);
            }
        } else {
            run_start = None;
        }
    }
    None
}
