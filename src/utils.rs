//! Fixed-width ASCII field helpers shared by the header and TAL parsers.
//!
//! EDF headers are space-padded ASCII; numeric fields must parse the same
//! way regardless of the process locale, so everything funnels through the
//! non-localized helpers here.

/// Returns the trimmed string content of a fixed-width header field.
pub fn field_str(bytes: &[u8], start: usize, len: usize) -> String {
    String::from_utf8_lossy(&bytes[start..start + len])
        .trim()
        .to_string()
}

/// Non-localized integer parse; `None` on anything but an optionally
/// signed run of ASCII digits.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse().ok()
}

/// Non-localized float parse. EDF always uses `.` as the decimal
/// separator, which matches Rust's `str::parse`.
pub fn parse_float(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let v: f64 = s.parse().ok()?;
    if v.is_finite() {
        Some(v)
    } else {
        None
    }
}

/// ULP-based float equality.
///
/// Record-start timestamps accumulate rounding from repeated decimal
/// parsing, so direct `==` misfires; anything within `max_ulps`
/// representable values counts as equal.
pub fn approx_eq_ulps(a: f64, b: f64, max_ulps: u64) -> bool {
    if a == b {
        return true;
    }
    if a.is_sign_positive() != b.is_sign_positive() {
        return false;
    }
    let ia = a.to_bits();
    let ib = b.to_bits();
    ia.abs_diff(ib) <= max_ulps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_str_trims_padding() {
        let raw = b"0       12.5    ";
        assert_eq!(field_str(raw, 0, 8), "0");
        assert_eq!(field_str(raw, 8, 8), "12.5");
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int("  123 "), Some(123));
        assert_eq!(parse_int("-7"), Some(-7));
        assert_eq!(parse_int(""), None);
        assert_eq!(parse_int("12.5"), None);
        assert_eq!(parse_int("abc"), None);
    }

    #[test]
    fn test_parse_float() {
        assert_eq!(parse_float("1"), Some(1.0));
        assert_eq!(parse_float(" -0.5 "), Some(-0.5));
        assert_eq!(parse_float("nan"), None);
        assert_eq!(parse_float(""), None);
    }

    #[test]
    fn test_approx_eq_ulps() {
        let a = 0.1 + 0.2;
        assert!(approx_eq_ulps(a, 0.3, 16));
        assert!(!approx_eq_ulps(1.0, 1.0001, 16));
        assert!(approx_eq_ulps(0.0, -0.0, 16));
    }
}
