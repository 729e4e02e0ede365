use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// Delimiters tried in order when splitting an offered-slots cell; the first
/// one present in the text wins.
const SLOT_DELIMITERS: &[char] = &[';', ',', '\n'];

/// Naive date-time layouts accepted from the spreadsheet, localized to the
/// agent timezone when they carry no offset of their own.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %I:%M %p",
    "%d/%m/%Y %H:%M",
    "%B %d %Y %I:%M %p",
    "%b %d %Y %I:%M %p",
    "%B %d, %Y %I:%M %p",
];

const ZONED_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%z", "%Y-%m-%d %H:%M:%S %z"];

/// Parse one date-time fragment, localizing naive values to `tz` and
/// converting zoned ones into `tz`.
pub fn parse_fragment(fragment: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(fragment) {
        return Some(dt.with_timezone(&tz));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(fragment, fmt) {
            return Some(dt.with_timezone(&tz));
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(fragment, fmt) {
            return tz.from_local_datetime(&naive).earliest();
        }
    }
    None
}

/// Turn the raw offered-slots text into future instants in `tz`, sorted
/// ascending. Unparsable or past fragments are dropped with a warning; this
/// never fails.
pub fn parse_offered_slots(raw: &str, tz: Tz) -> Vec<DateTime<Tz>> {
    if raw.trim().is_empty() {
        return vec![];
    }
    let fragments: Vec<&str> = match SLOT_DELIMITERS.iter().find(|d| raw.contains(**d)) {
        Some(delim) => raw
            .split(*delim)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect(),
        None => vec![raw.trim()],
    };

    let now = Utc::now().with_timezone(&tz);
    let mut slots: Vec<DateTime<Tz>> = vec![];
    for fragment in fragments {
        match parse_fragment(fragment, tz) {
            Some(dt) if dt > now => slots.push(dt),
            Some(_) => warn!(slot=%fragment, "skipping offered slot in the past"),
            None => warn!(slot=%fragment, "failed to parse offered slot"),
        }
    }
    slots.sort();
    slots
}

fn meridiem(is_pm: bool) -> &'static str {
    if is_pm {
        "PM"
    } else {
        "AM"
    }
}

/// Render an instant as e.g. "Tuesday, June 10 at 9:05 AM IST". The hour is
/// deliberately not zero-padded so the synthesized voice reads it naturally.
pub fn format_natural(dt: &DateTime<Tz>) -> String {
    let (is_pm, hour) = dt.hour12();
    format!(
        "{} at {}:{:02} {} {}",
        dt.format("%A, %B %d"),
        hour,
        dt.minute(),
        meridiem(is_pm),
        dt.format("%Z"),
    )
}

/// Render an ISO instant string for prompts and confirmations. Falls back to
/// a bare clock time for naive inputs and to a generic phrase when the input
/// is empty or unparsable.
pub fn format_iso_natural(iso: &str, tz: Tz) -> String {
    let iso = iso.trim();
    if iso.is_empty() {
        return "the proposed time".to_string();
    }
    if let Some(dt) = parse_fragment(iso, tz) {
        return format_natural(&dt);
    }
    // One more pass without timezone context, rendering clock time only.
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(iso, fmt) {
            let (is_pm, hour) = naive.hour12();
            return format!("{}:{:02} {}", hour, naive.minute(), meridiem(is_pm));
        }
    }
    "the proposed time".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Kolkata;

    #[test]
    fn parses_semicolon_list_sorted_ascending() {
        let raw = "2099-06-11T14:00:00+05:30; 2099-06-10T09:00:00+05:30; 2099-06-12T11:30:00+05:30";
        let slots = parse_offered_slots(raw, Kolkata);
        assert_eq!(slots.len(), 3);
        assert!(slots.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(slots[0], Kolkata.with_ymd_and_hms(2099, 6, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn drops_past_and_unparsable_fragments() {
        let raw = "2001-01-01T09:00:00+05:30, not a date, 2099-06-10 09:00";
        let slots = parse_offered_slots(raw, Kolkata);
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0], Kolkata.with_ymd_and_hms(2099, 6, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn whole_string_is_one_slot_without_delimiters() {
        let slots = parse_offered_slots("2099-06-10T09:00:00", Kolkata);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn empty_input_yields_no_slots() {
        assert!(parse_offered_slots("", Kolkata).is_empty());
        assert!(parse_offered_slots("   ", Kolkata).is_empty());
    }

    #[test]
    fn naive_fragments_are_localized() {
        let slots = parse_offered_slots("2099-06-10 09:00", Kolkata);
        assert_eq!(slots[0].offset().to_string(), "IST");
    }

    #[test]
    fn natural_format_has_unpadded_hour() {
        let dt = Kolkata.with_ymd_and_hms(2099, 6, 10, 9, 5, 0).unwrap();
        let text = format_natural(&dt);
        assert!(text.contains("at 9:05 AM"), "got: {text}");
        assert!(!text.contains("09:05"));
        assert!(text.contains("June 10"));
        assert!(text.ends_with("IST"));
    }

    #[test]
    fn afternoon_formats_as_pm() {
        let dt = Kolkata.with_ymd_and_hms(2099, 6, 11, 14, 0, 0).unwrap();
        assert!(format_natural(&dt).contains("at 2:00 PM"));
    }

    #[test]
    fn iso_formatting_fallbacks() {
        assert_eq!(format_iso_natural("", Kolkata), "the proposed time");
        assert_eq!(format_iso_natural("garbage", Kolkata), "the proposed time");
        let full = format_iso_natural("2099-06-10T09:05:00+05:30", Kolkata);
        assert!(full.contains("at 9:05 AM"));
    }
}
