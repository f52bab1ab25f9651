//! Phone number normalization
//!
//! All phone comparisons in the system run on normalized forms. Two forms
//! exist: E.164 (`+1530...`) used on the wire towards the carrier, and
//! digits-only (`1530...`) used as the key of the active-phone registry and
//! for database matching.

/// Strip everything but ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Normalize a raw phone number to E.164.
///
/// NANP-centric: a bare 10-digit number is assumed to be US/Canada and gets
/// a `+1` prefix; an 11-digit number starting with `1` gets a `+`; anything
/// else is passed through with a `+` prepended.
pub fn normalize_phone(raw: &str) -> String {
    let digits = digits_only(raw);
    if digits.len() == 10 {
        format!("+1{}", digits)
    } else if digits.len() == 11 && digits.starts_with('1') {
        format!("+{}", digits)
    } else {
        format!("+{}", digits)
    }
}

/// Extract the NANP area code (the three digits after the country code)
/// from an E.164 or loosely formatted number.
///
/// Returns `None` when there are not enough digits to carry an area code.
pub fn area_code(raw: &str) -> Option<String> {
    let digits = digits_only(raw);
    let national = if digits.len() == 11 && digits.starts_with('1') {
        &digits[1..]
    } else if digits.len() == 10 {
        &digits[..]
    } else {
        return None;
    };
    Some(national[..3].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_only() {
        assert_eq!(digits_only("+1 (530) 774-8286"), "15307748286");
        assert_eq!(digits_only("530.774.8286"), "5307748286");
        assert_eq!(digits_only(""), "");
    }

    #[test]
    fn test_normalize_ten_digits() {
        assert_eq!(normalize_phone("5307748286"), "+15307748286");
        assert_eq!(normalize_phone("(530) 774-8286"), "+15307748286");
    }

    #[test]
    fn test_normalize_eleven_digits() {
        assert_eq!(normalize_phone("15307748286"), "+15307748286");
        assert_eq!(normalize_phone("+1 530 774 8286"), "+15307748286");
    }

    #[test]
    fn test_normalize_other_lengths() {
        assert_eq!(normalize_phone("445307748286"), "+445307748286");
    }

    #[test]
    fn test_area_code() {
        assert_eq!(area_code("+15307748286").as_deref(), Some("530"));
        assert_eq!(area_code("5307748286").as_deref(), Some("530"));
        assert_eq!(area_code("+1659238"), None);
    }
}
