use chrono::NaiveDate;
use regex_lite::Regex;

/// Parse `123.45` / `123,45` style text into minor units, half-up on any
/// extra fractional digits being absent (two digits expected).
pub(crate) fn parse_amount_to_minor(raw: &str) -> Option<i64> {
    let cleaned = raw.trim().replace(',', ".");
    let mut parts = cleaned.splitn(2, '.');
    let whole: i64 = parts.next()?.parse().ok()?;
    let fraction = parts.next().unwrap_or("0");
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction[..2].parse().ok()?,
    };
    Some(whole * 100 + cents)
}

/// Best-effort amount recovery from a filename like `lunch-12.50.jpg` or
/// `usd_45.pdf`. Values at or below `floor_minor` are treated as noise.
pub(crate) fn infer_amount_from_filename(filename: &str, floor_minor: i64) -> Option<i64> {
    if filename.is_empty() {
        return None;
    }
    let decimal = Regex::new(r"(\d+[.,]\d{2})").ok()?;
    let inferred = match decimal.find(filename) {
        Some(found) => parse_amount_to_minor(found.as_str()),
        None => {
            let prefixed = Regex::new(r"(?i)(?:cad|usd|eur|gbp)[-_]?(\d+[.,]?\d*)").ok()?;
            prefixed
                .captures(filename)
                .and_then(|caps| caps.get(1))
                .and_then(|m| parse_amount_to_minor(m.as_str()))
        }
    }?;
    (inferred > floor_minor.max(0)).then_some(inferred)
}

pub(crate) fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.split('T').next().unwrap_or(raw).trim();
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn amounts_parse_from_decimal_text() {
        assert_eq!(parse_amount_to_minor("115.00"), Some(11_500));
        assert_eq!(parse_amount_to_minor("12,50"), Some(1_250));
        assert_eq!(parse_amount_to_minor("7"), Some(700));
        assert_eq!(parse_amount_to_minor("abc"), None);
    }

    #[test]
    fn filenames_yield_amounts_above_the_floor() {
        assert_eq!(
            infer_amount_from_filename("lunch-12.50.jpg", 0),
            Some(1_250)
        );
        assert_eq!(infer_amount_from_filename("usd_45.pdf", 0), Some(4_500));
        assert_eq!(infer_amount_from_filename("lunch-12.50.jpg", 5_000), None);
        assert_eq!(infer_amount_from_filename("IMG_0042.jpg", 0), None);
    }

    #[test]
    fn iso_dates_parse_with_or_without_time() {
        assert_eq!(
            parse_iso_date("2025-03-10"),
            NaiveDate::from_ymd_opt(2025, 3, 10)
        );
        assert_eq!(
            parse_iso_date("2025-03-10T09:30:00"),
            NaiveDate::from_ymd_opt(2025, 3, 10)
        );
        assert_eq!(parse_iso_date("next tuesday"), None);
    }
}
