use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

const LABELS: &[&str] = &["closing date", "deadline", "closes on", "closes", "closing", "due"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d %Y",
    "%b %d %Y",
    "%d-%b-%Y",
    "%d-%B-%Y",
];

/// Parses the deadline formats seen on Kenyan procurement portals and exports.
///
/// Numeric dates are day-first. Date-only values resolve to the last second of that day (UTC).
pub fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    let text = strip_label(raw.trim());
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc());
        }
    }

    let cleaned = clean_date_text(text);
    for candidate in [text, cleaned.as_str()] {
        for fmt in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(candidate, fmt) {
                return Some(end_of_day(date));
            }
        }
    }
    None
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    date.and_time(last_second).and_utc()
}

fn strip_label(text: &str) -> &str {
    let lower = text.to_ascii_lowercase();
    for label in LABELS {
        if lower.starts_with(label) {
            return text[label.len()..].trim_start_matches([':', '-', ' ']).trim();
        }
    }
    text
}

/// Drops ordinal suffixes ("1st", "22nd"), commas and repeated whitespace.
fn clean_date_text(text: &str) -> String {
    text.replace(',', " ")
        .split_whitespace()
        .map(|token| {
            let lower = token.to_ascii_lowercase();
            for suffix in ["st", "nd", "rd", "th"] {
                if let Some(number) = lower.strip_suffix(suffix) {
                    if !number.is_empty() && number.chars().all(|c| c.is_ascii_digit()) {
                        return number.to_string();
                    }
                }
            }
            token.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn eod(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 23, 59, 59).single().unwrap()
    }

    #[test]
    fn parses_iso_and_day_first_numeric_dates() {
        assert_eq!(parse_deadline("2030-01-01"), Some(eod(2030, 1, 1)));
        assert_eq!(parse_deadline("05/03/2030"), Some(eod(2030, 3, 5)));
        assert_eq!(parse_deadline("05-03-2030"), Some(eod(2030, 3, 5)));
    }

    #[test]
    fn parses_textual_months_and_ordinals() {
        assert_eq!(parse_deadline("1st March 2030"), Some(eod(2030, 3, 1)));
        assert_eq!(parse_deadline("March 22nd, 2030"), Some(eod(2030, 3, 22)));
        assert_eq!(parse_deadline("15-Apr-2030"), Some(eod(2030, 4, 15)));
        assert_eq!(parse_deadline("Closing Date: 3 Jun 2030"), Some(eod(2030, 6, 3)));
    }

    #[test]
    fn keeps_explicit_times() {
        assert_eq!(
            parse_deadline("2030-01-01 10:00"),
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 10, 0, 0).single().unwrap())
        );
        assert_eq!(
            parse_deadline("2030-01-01T10:00:00+03:00"),
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 7, 0, 0).single().unwrap())
        );
    }

    #[test]
    fn rejects_free_text() {
        assert_eq!(parse_deadline(""), None);
        assert_eq!(parse_deadline("To be announced"), None);
        assert_eq!(parse_deadline("31/02/2030"), None);
    }
}
