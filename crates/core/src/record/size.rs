use once_cell::sync::Lazy;
use regex_lite::Regex;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([0-9][0-9.,]*)\s*(kb|кб|mb|мб|gb|гб|tb|тб)").expect("static size regex")
});

/// Byte count of a display size such as `"1.46 GB"` or `"700 МБ"`.
///
/// Unknown or unparsable strings yield 0.
pub fn parse_size_name(size_name: &str) -> u64 {
    let lowered = size_name.to_lowercase();
    let Some(caps) = SIZE_RE.captures(&lowered) else {
        return 0;
    };

    let Ok(value) = caps[1].replace(',', ".").parse::<f64>() else {
        return 0;
    };

    let multiplier = match &caps[2] {
        "kb" | "кб" => 1024.0,
        "mb" | "мб" => 1024.0 * 1024.0,
        "gb" | "гб" => 1024.0 * 1024.0 * 1024.0,
        "tb" | "тб" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return 0,
    };

    (value * multiplier) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_name_units() {
        assert_eq!(parse_size_name("700 MB"), 700 * 1024 * 1024);
        assert_eq!(parse_size_name("2 GB"), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_name("1 TB"), 1024_u64.pow(4));
        assert_eq!(parse_size_name("512 KB"), 512 * 1024);
    }

    #[test]
    fn test_parse_size_name_cyrillic_and_comma() {
        assert_eq!(parse_size_name("1,5 ГБ"), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_size_name("700 мб"), 700 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_name_garbage() {
        assert_eq!(parse_size_name(""), 0);
        assert_eq!(parse_size_name("unknown"), 0);
        assert_eq!(parse_size_name("12 parsecs"), 0);
    }
}
