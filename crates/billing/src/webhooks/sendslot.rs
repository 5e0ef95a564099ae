//! Send-time quantization for checkout reminder emails.
//!
//! Reminders land in one of three daily slots (07:00, 11:00, 18:00) in the
//! member base's home timezone, so nobody gets nudged in the middle of the
//! night.

use time::{Date, Duration, Month, OffsetDateTime, Time, UtcOffset, Weekday};

/// Europe/Brussels offset for the given date. EU rule: CEST from the last
/// Sunday of March to the last Sunday of October, CET otherwise.
fn brussels_offset(date: Date) -> UtcOffset {
    let last_sunday = |month: Month| -> u8 {
        let days = time::util::days_in_month(month, date.year());
        let mut day = days;
        while let Ok(d) = Date::from_calendar_date(date.year(), month, day) {
            if d.weekday() == Weekday::Sunday {
                return day;
            }
            day -= 1;
        }
        days
    };

    let summer = match date.month() {
        Month::April
        | Month::May
        | Month::June
        | Month::July
        | Month::August
        | Month::September => true,
        Month::March => date.day() >= last_sunday(Month::March),
        Month::October => date.day() < last_sunday(Month::October),
        _ => false,
    };
    let hours = if summer { 2 } else { 1 };
    UtcOffset::from_hms(hours, 0, 0).unwrap_or(UtcOffset::UTC)
}

/// Next reminder send slot at or after `now`, returned in UTC.
pub fn next_send_slot(now: OffsetDateTime) -> OffsetDateTime {
    let local = now.to_offset(brussels_offset(now.date()));
    let hour = local.hour();

    let (date, slot_hour) = if hour > 17 {
        (local.date().next_day().unwrap_or(local.date()), 7)
    } else if hour <= 6 {
        (local.date(), 7)
    } else if hour <= 10 {
        (local.date(), 11)
    } else {
        (local.date(), 18)
    };

    let time = Time::from_hms(slot_hour, 0, 0).unwrap_or(Time::MIDNIGHT);
    let slot = date.with_time(time).assume_offset(brussels_offset(date));
    // A late-evening rollover can cross a DST boundary; never schedule in
    // the past.
    if slot < now {
        slot + Duration::hours(24)
    } else {
        slot
    }
}
