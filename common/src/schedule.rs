// Schedule parsing and calculation module
//
// Turns a task's `schedule_type` + `schedule_config` pair into a typed
// `Schedule` and computes fire times for cron, interval and once schedules.

use crate::errors::ScheduleError;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Raw, type-specific schedule parameters as stored in the catalog
pub type ScheduleConfig = Map<String, Value>;

const CRON_FIELDS: [&str; 7] = [
    "second",
    "minute",
    "hour",
    "day",
    "month",
    "day_of_week",
    "year",
];
const INTERVAL_UNITS: [&str; 5] = ["seconds", "minutes", "hours", "days", "weeks"];
const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
const WEEKDAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleType::Cron => write!(f, "cron"),
            ScheduleType::Interval => write!(f, "interval"),
            ScheduleType::Once => write!(f, "once"),
        }
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(ScheduleType::Cron),
            "interval" => Ok(ScheduleType::Interval),
            "once" => Ok(ScheduleType::Once),
            _ => Err(format!("Invalid schedule type: {}", s)),
        }
    }
}

/// What the daemon does with a fire time that already lies in the past
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedFirePolicy {
    /// Jump to the next occurrence after now; missed fires are dropped
    #[default]
    Skip,
    /// Run once for the most recent missed occurrence, then resume normally
    FireOnce,
}

/// A validated schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Cron {
        /// Seven-field expression: sec min hour day month dow year
        expression: String,
        timezone: Tz,
    },
    Interval {
        every: Duration,
    },
    Once {
        run_at: DateTime<Utc>,
    },
}

/// ScheduleTrigger defines how fire times are derived from a reference time
pub trait ScheduleTrigger {
    /// Soonest fire strictly after `reference`, or `None` once exhausted
    fn next_fire_after(
        &self,
        reference: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError>;

    /// Whether no fire remains after `reference`
    fn is_exhausted(&self, reference: DateTime<Utc>) -> bool {
        matches!(self.next_fire_after(reference), Ok(None))
    }
}

impl ScheduleTrigger for Schedule {
    fn next_fire_after(
        &self,
        reference: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Schedule::Cron {
                expression,
                timezone,
            } => calculate_cron_next_fire(expression, *timezone, reference),

            Schedule::Interval { every } => reference
                .checked_add_signed(*every)
                .map(Some)
                .ok_or_else(|| {
                    ScheduleError::CalculationFailed(format!(
                        "interval of {}s overflows from {}",
                        every.num_seconds(),
                        reference
                    ))
                }),

            Schedule::Once { run_at } => Ok((*run_at > reference).then_some(*run_at)),
        }
    }
}

impl Schedule {
    /// Parse and validate a stored schedule configuration
    pub fn from_config(
        schedule_type: ScheduleType,
        config: &ScheduleConfig,
    ) -> Result<Self, ScheduleError> {
        match schedule_type {
            ScheduleType::Cron => parse_cron_config(config),
            ScheduleType::Interval => parse_interval_config(config),
            ScheduleType::Once => parse_once_config(config),
        }
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Schedule::Cron { .. } => ScheduleType::Cron,
            Schedule::Interval { .. } => ScheduleType::Interval,
            Schedule::Once { .. } => ScheduleType::Once,
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron {
                expression,
                timezone,
            } => write!(f, "cron '{}' ({})", expression, timezone),
            Schedule::Interval { every } => write!(f, "every {}s", every.num_seconds()),
            Schedule::Once { run_at } => write!(f, "once at {}", run_at.to_rfc3339()),
        }
    }
}

/// Resolve the fire time the daemon should wait for.
///
/// `reference` is the entry's reference time (later of creation and last run).
/// When the derived fire is already due at `now`, the missed-fire policy decides:
/// `Skip` moves to the first occurrence after `now` (intervals stay on their
/// original grid), `FireOnce` keeps the latest occurrence at or before `now` so
/// the backlog collapses into a single run.
pub fn resolve_next_fire(
    schedule: &Schedule,
    reference: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: MissedFirePolicy,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let Some(next) = schedule.next_fire_after(reference)? else {
        return Ok(None);
    };
    if next > now {
        return Ok(Some(next));
    }

    match (schedule, policy) {
        (Schedule::Once { .. }, MissedFirePolicy::Skip) => Ok(None),
        (Schedule::Once { .. }, MissedFirePolicy::FireOnce) => Ok(Some(next)),

        (Schedule::Interval { every }, policy) => {
            let step_ms = every.num_milliseconds();
            if step_ms <= 0 {
                return Err(ScheduleError::CalculationFailed(
                    "interval must be positive".to_string(),
                ));
            }
            let behind_ms = (now - next).num_milliseconds();
            let steps = match policy {
                MissedFirePolicy::Skip => behind_ms / step_ms + 1,
                MissedFirePolicy::FireOnce => behind_ms / step_ms,
            };
            step_ms
                .checked_mul(steps)
                .and_then(|offset| next.checked_add_signed(Duration::milliseconds(offset)))
                .map(Some)
                .ok_or_else(|| {
                    ScheduleError::CalculationFailed(format!(
                        "cannot advance interval schedule past {}",
                        now
                    ))
                })
        }

        (Schedule::Cron { .. }, MissedFirePolicy::Skip) => schedule.next_fire_after(now),
        (
            Schedule::Cron {
                expression,
                timezone,
            },
            MissedFirePolicy::FireOnce,
        ) => {
            let parsed = parse_cron_expression(expression)?;
            let latest = parsed
                .after(&next.with_timezone(timezone))
                .map(|candidate| candidate.with_timezone(&Utc))
                .take_while(|candidate| *candidate <= now)
                .last()
                .unwrap_or(next);
            Ok(Some(latest))
        }
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

fn calculate_cron_next_fire(
    expression: &str,
    timezone: Tz,
    reference: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(expression)?;
    let reference_in_tz = reference.with_timezone(&timezone);

    Ok(schedule
        .after(&reference_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc)))
}

fn parse_timezone(config: &ScheduleConfig) -> Result<Tz, ScheduleError> {
    match config.get("timezone") {
        None | Some(Value::Null) => Ok(Tz::UTC),
        Some(Value::String(name)) => {
            Tz::from_str(name.trim()).map_err(|_| ScheduleError::InvalidTimezone(name.clone()))
        }
        Some(other) => Err(ScheduleError::InvalidTimezone(other.to_string())),
    }
}

fn reject_unknown_keys(
    config: &ScheduleConfig,
    allowed: &[&str],
    schedule_type: ScheduleType,
) -> Result<(), ScheduleError> {
    if let Some(key) = config
        .keys()
        .find(|key| key.as_str() != "timezone" && !allowed.contains(&key.as_str()))
    {
        return Err(ScheduleError::InvalidConfiguration(format!(
            "unknown {} field '{}'",
            schedule_type, key
        )));
    }
    Ok(())
}

fn cron_field(config: &ScheduleConfig, name: &str) -> Result<String, ScheduleError> {
    let default = if name == "second" { "0" } else { "*" };
    let raw = match config.get(name) {
        None | Some(Value::Null) => return Ok(default.to_string()),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(ScheduleError::InvalidConfiguration(format!(
                "cron field '{}' must be a number or string, got {}",
                name, other
            )))
        }
    };
    if raw.is_empty() {
        return Err(ScheduleError::InvalidConfiguration(format!(
            "cron field '{}' is empty",
            name
        )));
    }
    if raw.contains(char::is_whitespace) {
        return Err(ScheduleError::InvalidConfiguration(format!(
            "cron field '{}' must not contain whitespace: '{}'",
            name, raw
        )));
    }
    if name == "day_of_week" {
        return translate_day_of_week(&raw);
    }
    Ok(raw)
}

/// Weekday index where Monday is 0, accepting digits or English names
fn weekday_index(token: &str) -> Result<usize, ScheduleError> {
    let lowered = token.to_ascii_lowercase();
    if let Ok(n) = lowered.parse::<usize>() {
        return if n < WEEKDAYS.len() {
            Ok(n)
        } else {
            Err(ScheduleError::InvalidConfiguration(format!(
                "day_of_week {} out of range 0 (mon) - 6 (sun)",
                n
            )))
        };
    }
    WEEKDAY_NAMES
        .iter()
        .position(|full| lowered == *full || lowered == full[..3])
        .ok_or_else(|| {
            ScheduleError::InvalidConfiguration(format!("unknown weekday '{}'", token))
        })
}

/// Rewrite a Monday-first day_of_week expression into explicit weekday names.
///
/// Ranges and steps are expanded so that ranges crossing the weekend
/// (e.g. `5-6`, `sat-sun`) keep their Monday-first meaning.
fn translate_day_of_week(raw: &str) -> Result<String, ScheduleError> {
    if raw == "*" || raw == "?" {
        return Ok("*".to_string());
    }

    let mut days: Vec<usize> = Vec::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step.parse::<usize>().ok().filter(|s| *s > 0).ok_or_else(|| {
                    ScheduleError::InvalidConfiguration(format!(
                        "invalid day_of_week step in '{}'",
                        part
                    ))
                })?;
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (0, WEEKDAYS.len() - 1)
        } else if let Some((from, to)) = range.split_once('-') {
            (weekday_index(from)?, weekday_index(to)?)
        } else {
            let day = weekday_index(range)?;
            let end = if step > 1 { WEEKDAYS.len() - 1 } else { day };
            (day, end)
        };

        if start > end {
            return Err(ScheduleError::InvalidConfiguration(format!(
                "day_of_week range '{}' runs backwards",
                range
            )));
        }
        days.extend((start..=end).step_by(step));
    }

    days.sort_unstable();
    days.dedup();
    Ok(days
        .iter()
        .map(|d| WEEKDAYS[*d])
        .collect::<Vec<_>>()
        .join(","))
}

fn parse_cron_config(config: &ScheduleConfig) -> Result<Schedule, ScheduleError> {
    reject_unknown_keys(config, &CRON_FIELDS, ScheduleType::Cron)?;
    let timezone = parse_timezone(config)?;

    let fields = CRON_FIELDS
        .iter()
        .map(|name| cron_field(config, name))
        .collect::<Result<Vec<_>, _>>()?;
    let expression = fields.join(" ");
    let parsed = parse_cron_expression(&expression)?;

    // Impossible combinations (e.g. 31 February) never produce an occurrence
    let epoch = DateTime::<Utc>::UNIX_EPOCH.with_timezone(&timezone);
    if parsed.after(&epoch).next().is_none() {
        return Err(ScheduleError::NoNextExecution {
            schedule_type: ScheduleType::Cron.to_string(),
        });
    }

    Ok(Schedule::Cron {
        expression,
        timezone,
    })
}

fn parse_interval_config(config: &ScheduleConfig) -> Result<Schedule, ScheduleError> {
    reject_unknown_keys(config, &INTERVAL_UNITS, ScheduleType::Interval)?;
    if config.contains_key("timezone") {
        return Err(ScheduleError::InvalidConfiguration(
            "interval schedules do not take a timezone".to_string(),
        ));
    }

    let mut units = config.iter();
    let (unit, value) = match (units.next(), units.next()) {
        (Some(entry), None) => entry,
        (None, _) => {
            return Err(ScheduleError::InvalidConfiguration(
                "interval requires one of seconds, minutes, hours, days, weeks".to_string(),
            ))
        }
        (Some(_), Some(_)) => {
            return Err(ScheduleError::InvalidConfiguration(
                "interval must use exactly one duration unit".to_string(),
            ))
        }
    };

    let amount = value
        .as_i64()
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            ScheduleError::InvalidConfiguration(format!(
                "interval {} must be a positive integer, got {}",
                unit, value
            ))
        })?;

    let every = match unit.as_str() {
        "seconds" => Duration::try_seconds(amount),
        "minutes" => Duration::try_minutes(amount),
        "hours" => Duration::try_hours(amount),
        "days" => Duration::try_days(amount),
        "weeks" => Duration::try_weeks(amount),
        _ => None,
    }
    .ok_or_else(|| {
        ScheduleError::InvalidConfiguration(format!("interval of {} {} is too large", amount, unit))
    })?;

    Ok(Schedule::Interval { every })
}

fn parse_once_config(config: &ScheduleConfig) -> Result<Schedule, ScheduleError> {
    reject_unknown_keys(config, &["run_date"], ScheduleType::Once)?;
    let timezone = parse_timezone(config)?;

    let raw = match config.get("run_date") {
        Some(Value::String(s)) => s.trim(),
        Some(other) => {
            return Err(ScheduleError::InvalidConfiguration(format!(
                "run_date must be a timestamp string, got {}",
                other
            )))
        }
        None => {
            return Err(ScheduleError::InvalidConfiguration(
                "once schedule requires run_date".to_string(),
            ))
        }
    };

    Ok(Schedule::Once {
        run_at: parse_run_date(raw, timezone)?,
    })
}

fn parse_run_date(raw: &str, timezone: Tz) -> Result<DateTime<Utc>, ScheduleError> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }

    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| {
            ScheduleError::InvalidConfiguration(format!("unparsable run_date '{}'", raw))
        })?;

    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            ScheduleError::InvalidConfiguration(format!(
                "run_date '{}' does not exist in {}",
                raw, timezone
            ))
        })
}
