use serde::Deserialize;
use tracing::{debug, warn};

use crate::profile::ProfileRecord;
use crate::types::ZoneMode;

/// Setpoint pushed when a zone must not heat.
pub const TEMP_OFF: f64 = 0.0;

/// Out-of-band value meaning "no authoritative target". Never pushed to an
/// actuator; a zone resolving to this simply stops updating.
pub const TEMP_FALLBACK: f64 = -1.0;

/// One period of a day schedule, as published on the `DayN` sub-topics:
/// `[{"From":"06:00","To":"22:00","TempID":1}]`.
#[derive(Debug, Deserialize)]
struct SchedulePeriod {
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "TempID", default)]
    temp_id: u8,
}

/// Everything the precedence chain needs for one zone at one instant.
pub(crate) struct ResolveInputs<'a> {
    pub mode: Option<ZoneMode>,
    pub manual_temp: Option<&'a str>,
    pub present: bool,
    /// Boost temperature when a boost session is running.
    pub boost_temp: Option<f64>,
    /// Window open and the debounce delay has elapsed.
    pub window_lockout: bool,
    pub record: Option<&'a ProfileRecord>,
    /// ISO weekday, 1 = Monday.
    pub weekday: u32,
    /// Minutes since midnight.
    pub minutes: u32,
}

/// Resolves one target temperature from the fixed precedence chain.
///
/// Order: window lockout, boost, Off, Bypass, Manual, absence (overrides
/// the mode to Away), Holiday, Profile. Every data problem degrades to
/// [`TEMP_FALLBACK`]; this function never fails.
pub(crate) fn resolve_target(zone_id: &str, inputs: &ResolveInputs<'_>) -> f64 {
    if inputs.window_lockout {
        debug!(zone = %zone_id, "window open, heating locked out");
        return TEMP_OFF;
    }

    if let Some(temp) = inputs.boost_temp {
        debug!(zone = %zone_id, temp, "boost active");
        return temp;
    }

    let Some(mode) = inputs.mode else {
        warn!(zone = %zone_id, "no valid mode, using fallback");
        return TEMP_FALLBACK;
    };

    if mode == ZoneMode::Off {
        return TEMP_OFF;
    }
    if mode == ZoneMode::Bypass {
        return TEMP_FALLBACK;
    }
    if mode == ZoneMode::Manual {
        return match inputs.manual_temp.and_then(|v| v.trim().parse::<f64>().ok()) {
            Some(temp) => temp,
            None => {
                warn!(zone = %zone_id, "manual temperature unset or invalid");
                TEMP_FALLBACK
            }
        };
    }

    // Absence wins over the schedule-driven modes.
    let mode = if inputs.present { mode } else { ZoneMode::Away };

    let Some(record) = inputs.record else {
        warn!(zone = %zone_id, "no schedule profile loaded");
        return TEMP_FALLBACK;
    };
    if !record.is_complete() {
        debug!(
            zone = %zone_id,
            topic = %record.topic(),
            age = ?record.last_update().map(|t| t.elapsed()),
            "schedule profile incomplete"
        );
        return TEMP_FALLBACK;
    }

    match mode {
        ZoneMode::Away => named_temp(record, "TempAway"),
        ZoneMode::Holiday => named_temp(record, "TempHoliday"),
        ZoneMode::Profile => day_schedule_temp(record, inputs.weekday, inputs.minutes),
        other => {
            warn!(zone = %zone_id, mode = %other, "unhandled mode, using fallback");
            TEMP_FALLBACK
        }
    }
}

/// Looks up today's day schedule and returns the temperature of the first
/// period containing `minutes`, or the fallback when nothing matches.
fn day_schedule_temp(record: &ProfileRecord, weekday: u32, minutes: u32) -> f64 {
    let key = format!("Day{weekday}");
    let Some(raw) = record.field(&key) else {
        warn!(topic = %record.topic(), key = %key, "day schedule missing");
        return TEMP_FALLBACK;
    };

    let periods: Vec<SchedulePeriod> = match serde_json::from_str(raw) {
        Ok(periods) => periods,
        Err(e) => {
            warn!(topic = %record.topic(), key = %key, error = %e, "malformed day schedule");
            return TEMP_FALLBACK;
        }
    };

    for period in &periods {
        let (Some(start), Some(end)) = (parse_clock(&period.from), parse_clock(&period.to)) else {
            continue;
        };
        if in_window(minutes, start, end) {
            return reference_temp(record, period.temp_id);
        }
    }

    debug!(topic = %record.topic(), key = %key, minutes, "no matching period");
    TEMP_FALLBACK
}

/// Maps a period's temperature selector to an actual value:
/// 0 = fallback, 1-4 = the numbered reference temperature, 5 = 0.0.
fn reference_temp(record: &ProfileRecord, temp_id: u8) -> f64 {
    match temp_id {
        0 => TEMP_FALLBACK,
        1..=4 => named_temp(record, &format!("Temp{temp_id}")),
        5 => TEMP_OFF,
        other => {
            warn!(topic = %record.topic(), temp_id = other, "unknown temperature selector");
            TEMP_FALLBACK
        }
    }
}

fn named_temp(record: &ProfileRecord, key: &str) -> f64 {
    match record.field(key).and_then(|v| v.trim().parse::<f64>().ok()) {
        Some(temp) => temp,
        None => {
            warn!(topic = %record.topic(), key = %key, "temperature missing or invalid");
            TEMP_FALLBACK
        }
    }
}

/// Parses "HH:MM" into minutes since midnight. Malformed input is `None`
/// (treated as no-match by the caller).
fn parse_clock(s: &str) -> Option<u32> {
    let (hours, mins) = s.split_once(':')?;
    let hours: u32 = hours.trim().parse().ok()?;
    let mins: u32 = mins.trim().parse().ok()?;
    if hours > 24 || mins > 59 {
        return None;
    }
    Some(hours * 60 + mins)
}

/// `[start, end)` containment; `end < start` wraps past midnight.
fn in_window(current: u32, start: u32, end: u32) -> bool {
    if end < start {
        current >= start || current < end
    } else {
        start <= current && current < end
    }
}
