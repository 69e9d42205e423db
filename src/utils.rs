//! Utility functions

/// Parse a human-readable size like `12.3MiB` or `456KiB` into bytes
///
/// Accepts the unit forms engine tools print: optional `K`/`M`/`G`/`T`
/// prefix with `iB` or `B` suffix, or a bare byte count. Returns None for
/// unparseable input.
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let numeric_end = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(numeric_end);
    let value: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "K" | "KB" | "KiB" => 1024.0,
        "M" | "MB" | "MiB" => 1024.0 * 1024.0,
        "G" | "GB" | "GiB" => 1024.0 * 1024.0 * 1024.0,
        "T" | "TB" | "TiB" => 1024.0_f64.powi(4),
        _ => return None,
    };

    Some((value * multiplier) as u64)
}

/// Format a byte count as a human-readable size
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

/// Replace characters that are invalid in filenames with underscores
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_units() {
        assert_eq!(parse_size("1KiB"), Some(1024));
        assert_eq!(parse_size("1MiB"), Some(1024 * 1024));
        assert_eq!(parse_size("2GiB"), Some(2 * 1024 * 1024 * 1024));
    }

    #[test]
    fn parses_fractional_sizes() {
        assert_eq!(parse_size("12.5KiB"), Some(12_800));
        assert_eq!(parse_size("0.5MiB"), Some(524_288));
    }

    #[test]
    fn parses_bare_bytes_and_short_units() {
        assert_eq!(parse_size("42"), Some(42));
        assert_eq!(parse_size("42B"), Some(42));
        assert_eq!(parse_size("3M"), Some(3 * 1024 * 1024));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("fast"), None);
        assert_eq!(parse_size("12XB"), None);
    }

    #[test]
    fn formats_round_trip_magnitudes() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1024), "1.0KiB");
        assert_eq!(format_size(1536), "1.5KiB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.0MiB");
    }

    #[test]
    fn sanitizes_invalid_filename_characters() {
        assert_eq!(sanitize_filename("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_filename("normal name.mp4"), "normal name.mp4");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }
}
