//! Field parsing shared by the table loaders.

/// Parse a reporter intensity cell. Empty cells and the usual NA spellings
/// are missing, encoded as zero. Returns None for unparseable text.
pub(crate) fn parse_intensity(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_na(trimmed) {
        return Some(0.0);
    }
    let value: f64 = trimmed.parse().ok()?;
    if value.is_finite() && value > 0.0 {
        Some(value)
    } else {
        Some(0.0)
    }
}

/// Parse a quality metric (interference, purity, score). Empty cells become
/// NaN so that downstream comparisons treat them as unknown.
pub(crate) fn parse_metric(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if is_na(trimmed) {
        return Some(f64::NAN);
    }
    trimmed.parse().ok()
}

/// Parse a non-negative integer cell. Empty cells are zero.
pub(crate) fn parse_count(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    if is_na(trimmed) {
        return Some(0);
    }
    trimmed.parse().ok()
}

/// MaxQuant-style marker columns hold "+" when set and are empty otherwise.
pub(crate) fn parse_flag(raw: &str) -> bool {
    raw.trim() == "+"
}

/// Split a semicolon-separated identifier list, dropping empty entries.
pub(crate) fn split_ids(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn is_na(trimmed: &str) -> bool {
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("nan")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_intensity() {
        assert_eq!(parse_intensity("120.5"), Some(120.5));
        assert_eq!(parse_intensity(""), Some(0.0));
        assert_eq!(parse_intensity("NA"), Some(0.0));
        assert_eq!(parse_intensity("NaN"), Some(0.0));
        assert_eq!(parse_intensity("-3"), Some(0.0));
        assert_eq!(parse_intensity("abc"), None);
    }

    #[test]
    fn test_parse_metric() {
        assert_eq!(parse_metric("0.85"), Some(0.85));
        assert!(parse_metric("").unwrap().is_nan());
        assert!(parse_metric("NA").unwrap().is_nan());
        assert_eq!(parse_metric("x"), None);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("4"), Some(4));
        assert_eq!(parse_count(""), Some(0));
        assert_eq!(parse_count("-1"), None);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("+"));
        assert!(parse_flag(" + "));
        assert!(!parse_flag(""));
        assert!(!parse_flag("yes"));
    }

    #[test]
    fn test_split_ids() {
        assert_eq!(split_ids("12;34 ;56"), vec!["12", "34", "56"]);
        assert_eq!(split_ids(""), Vec::<String>::new());
        assert_eq!(split_ids(";;7"), vec!["7"]);
    }
}
