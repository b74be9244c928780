use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::err::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttendanceWindow {
    pub opens_at: NaiveDateTime,
    pub closes_at: NaiveDateTime,
}

impl AttendanceWindow {
    /// The class slot on `day`, widened by `buffer` on both sides.
    pub fn for_day(day: NaiveDate, start: NaiveTime, end: NaiveTime, buffer: Duration) -> Self {
        Self {
            opens_at: day.and_time(start) - buffer,
            closes_at: day.and_time(end) + buffer,
        }
    }

    pub fn contains(&self, now: NaiveDateTime) -> bool {
        self.opens_at <= now && now <= self.closes_at
    }

    pub fn check(&self, now: NaiveDateTime) -> Result<(), Error> {
        if self.contains(now) {
            return Ok(());
        }
        let opens_at = self.opens_at.format("%I:%M %p").to_string();
        let closes_at = self.closes_at.format("%I:%M %p").to_string();
        Err(Error::OutsideWindow {
            message: format!(
                "Attendance can only be marked between {} and {}",
                opens_at, closes_at
            ),
            opens_at,
            closes_at,
        })
    }
}

/// A classroom only has a window when both ends of its slot are set.
pub fn window_for(
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
    now: NaiveDateTime,
    buffer_minutes: i64,
) -> Option<AttendanceWindow> {
    match (start, end) {
        (Some(start), Some(end)) => Some(AttendanceWindow::for_day(
            now.date(),
            start,
            end,
            Duration::minutes(buffer_minutes),
        )),
        _ => None,
    }
}

/// Accepts `HH:MM` as sent by time inputs, or `HH:MM:SS`.
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

pub fn de_opt_time<'de, D>(deserializer: D) -> Result<Option<NaiveTime>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => parse_time(raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time `{}`", raw))),
    }
}

pub fn schedule_label(days: Option<&str>, start: Option<NaiveTime>, end: Option<NaiveTime>) -> String {
    match (days.filter(|d| !d.trim().is_empty()), start) {
        (Some(days), Some(start)) => {
            let end = end
                .map(|e| e.format("%H:%M").to_string())
                .unwrap_or_default();
            format!("{} {} - {}", days.trim(), start.format("%H:%M"), end)
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 2).unwrap()
    }

    #[test]
    fn buffer_widens_both_ends() {
        let window = window_for(Some(t(9, 0)), Some(t(10, 0)), day().and_time(t(8, 0)), 15).unwrap();
        assert!(!window.contains(day().and_time(t(8, 44))));
        assert!(window.contains(day().and_time(t(8, 45))));
        assert!(window.contains(day().and_time(t(10, 15))));
        assert!(!window.contains(day().and_time(t(10, 16))));
    }

    #[test]
    fn no_window_without_both_ends() {
        let now = day().and_time(t(3, 0));
        assert!(window_for(Some(t(9, 0)), None, now, 15).is_none());
        assert!(window_for(None, Some(t(9, 0)), now, 15).is_none());
    }

    #[test]
    fn closed_window_reports_bounds() {
        let window = window_for(Some(t(9, 0)), Some(t(10, 0)), day().and_time(t(12, 0)), 15).unwrap();
        match window.check(day().and_time(t(12, 0))) {
            Err(Error::OutsideWindow {
                opens_at,
                closes_at,
                ..
            }) => {
                assert_eq!(opens_at, "08:45 AM");
                assert_eq!(closes_at, "10:15 AM");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn time_inputs() {
        assert_eq!(parse_time("09:30"), Some(t(9, 30)));
        assert_eq!(parse_time(" 17:05:00 "), Some(t(17, 5)));
        assert_eq!(parse_time("9am"), None);

        #[derive(serde::Deserialize)]
        struct Slot {
            #[serde(default, deserialize_with = "de_opt_time")]
            start: Option<NaiveTime>,
        }
        let slot: Slot = serde_json::from_str(r#"{"start":"08:15"}"#).unwrap();
        assert_eq!(slot.start, Some(t(8, 15)));
        let slot: Slot = serde_json::from_str(r#"{"start":""}"#).unwrap();
        assert_eq!(slot.start, None);
        let slot: Slot = serde_json::from_str("{}").unwrap();
        assert_eq!(slot.start, None);
        assert!(serde_json::from_str::<Slot>(r#"{"start":"noon"}"#).is_err());
    }

    #[test]
    fn labels() {
        assert_eq!(
            schedule_label(Some("Mon/Wed"), Some(t(9, 0)), Some(t(10, 30))),
            "Mon/Wed 09:00 - 10:30"
        );
        assert_eq!(schedule_label(None, Some(t(9, 0)), None), "");
        assert_eq!(schedule_label(Some("  "), Some(t(9, 0)), None), "");
    }
}
