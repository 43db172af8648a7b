use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, Duration, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset, Weekday};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScheduleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("schedule {0} not found")]
    NotFound(ScheduleId),
    #[error("alarm registration failed for schedule {schedule_id}: {reason}")]
    Alarm {
        schedule_id: ScheduleId,
        #[source]
        reason: AlarmError,
    },
    #[error("worker error: {0}")]
    Worker(String),
    #[error("worker pool is shut down")]
    Shutdown,
}

impl ScheduleError {
    /// Wraps a store failure, keeping the full context chain in the message.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn store(err: anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AlarmError {
    #[error("alarm scheduling denied: {0}")]
    Denied(String),
    #[error("alarm facility unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScheduleId(pub i64);

impl Display for ScheduleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MedicationId(pub Ulid);

impl MedicationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MedicationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MedicationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A wall-clock reminder time with minute precision, serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(Time);

impl TryFrom<String> for TimeOfDay {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
            .ok_or_else(|| ScheduleError::Validation(format!("invalid time of day: {value}")))
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

impl TimeOfDay {
    /// Returns `None` unless `hour` is in `0..=23` and `minute` in `0..=59`.
    #[must_use]
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        Time::from_hms(hour, minute, 0).ok().map(Self)
    }

    /// Parses a single `H:MM` / `HH:MM` entry.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (hour_raw, minute_raw) = value.trim().split_once(':')?;
        if minute_raw.contains(':') {
            return None;
        }
        let hour: u8 = hour_raw.parse().ok()?;
        let minute: u8 = minute_raw.parse().ok()?;
        Self::new(hour, minute)
    }

    #[must_use]
    pub fn hour(self) -> u8 {
        self.0.hour()
    }

    #[must_use]
    pub fn minute(self) -> u8 {
        self.0.minute()
    }

    #[must_use]
    pub fn as_time(self) -> Time {
        self.0
    }
}

impl Display for TimeOfDay {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Ascending, deduplicated set of reminder times.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "Vec<TimeOfDay>")]
pub struct TimesOfDay(Vec<TimeOfDay>);

impl From<Vec<TimeOfDay>> for TimesOfDay {
    fn from(times: Vec<TimeOfDay>) -> Self {
        Self::new(times)
    }
}

impl TimesOfDay {
    #[must_use]
    pub fn new(times: impl IntoIterator<Item = TimeOfDay>) -> Self {
        let mut values: Vec<TimeOfDay> = times.into_iter().collect();
        values.sort_unstable();
        values.dedup();
        Self(values)
    }

    /// Parses a compact `"HH:MM[,HH:MM...]"` list.
    ///
    /// Malformed or out-of-range entries are dropped; an input with no valid
    /// entry yields an empty set.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        Self::new(value.split(',').filter_map(TimeOfDay::parse))
    }

    /// Formats as the compact persisted representation.
    #[must_use]
    pub fn to_compact(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn earliest(&self) -> Option<TimeOfDay> {
        self.0.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = TimeOfDay> + '_ {
        self.0.iter().copied()
    }
}

/// Active weekdays, Monday = `1 << 6` down to Sunday = `1 << 0`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(from = "u8")]
pub struct WeekdayMask(u8);

impl From<u8> for WeekdayMask {
    fn from(bits: u8) -> Self {
        Self::from_bits(bits)
    }
}

impl WeekdayMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self(0b111_1111);

    /// Bits above the seventh are discarded.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[must_use]
    pub fn from_weekdays(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self(
            days.into_iter()
                .fold(0_u8, |bits, day| bits | Self::bit_for(day)),
        )
    }

    #[must_use]
    pub fn bit_for(day: Weekday) -> u8 {
        1 << (6 - day.number_days_from_monday())
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit_for(day) != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn weekdays(self) -> Vec<Weekday> {
        let mut day = Weekday::Monday;
        let mut active = Vec::new();
        for _ in 0..7 {
            if self.contains(day) {
                active.push(day);
            }
            day = day.next();
        }
        active
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CycleType {
    Daily,
    Weekly,
    Monthly,
    EveryNDays,
}

impl CycleType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::EveryNDays => "every_n_days",
        }
    }

    /// Persisted small-integer tag.
    #[must_use]
    pub fn tag(self) -> i64 {
        match self {
            Self::Daily => 0,
            Self::Weekly => 1,
            Self::Monthly => 2,
            Self::EveryNDays => 3,
        }
    }

    #[must_use]
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(Self::Daily),
            1 => Some(Self::Weekly),
            2 => Some(Self::Monthly),
            3 => Some(Self::EveryNDays),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cycle {
    Daily,
    Weekly { days: WeekdayMask },
    /// Days past the end of a month fall back to that month's last day.
    Monthly { day_of_month: u8 },
    /// Counts cycles from `start`; an interval of 0 behaves as 1.
    EveryNDays { interval_days: u32, start: Date },
}

impl Cycle {
    #[must_use]
    pub fn cycle_type(&self) -> CycleType {
        match self {
            Self::Daily => CycleType::Daily,
            Self::Weekly { .. } => CycleType::Weekly,
            Self::Monthly { .. } => CycleType::Monthly,
            Self::EveryNDays { .. } => CycleType::EveryNDays,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRuleInput {
    pub medication_id: MedicationId,
    pub cycle: Cycle,
    pub times_of_day: TimesOfDay,
    pub enabled: bool,
}

impl ScheduleRuleInput {
    /// Checks the rule shape a caller is expected to enforce before create.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Validation`] when the rule could never fire
    /// or carries an out-of-range anchor.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.times_of_day.is_empty() {
            return Err(ScheduleError::Validation(
                "times_of_day MUST contain at least one HH:MM entry".to_string(),
            ));
        }

        match self.cycle {
            Cycle::Daily => {}
            Cycle::Weekly { days } => {
                if days.is_empty() {
                    return Err(ScheduleError::Validation(
                        "weekly schedules MUST select at least one weekday".to_string(),
                    ));
                }
            }
            Cycle::Monthly { day_of_month } => {
                if !(1..=31).contains(&day_of_month) {
                    return Err(ScheduleError::Validation(
                        "day_of_month MUST be in [1, 31]".to_string(),
                    ));
                }
            }
            Cycle::EveryNDays { interval_days, .. } => {
                if interval_days == 0 {
                    return Err(ScheduleError::Validation(
                        "interval_days MUST be >= 1".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Next occurrence of this input, as the store would record it on create.
    #[must_use]
    pub fn compute_next(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        if !self.enabled {
            return None;
        }
        compute_next_for(&self.cycle, &self.times_of_day, now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleRule {
    pub id: ScheduleId,
    pub medication_id: MedicationId,
    pub cycle: Cycle,
    pub times_of_day: TimesOfDay,
    pub next_trigger_at: Option<OffsetDateTime>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ScheduleRule {
    #[must_use]
    pub fn alarm_registration(&self) -> Option<AlarmRegistration> {
        if !self.enabled {
            return None;
        }
        self.next_trigger_at.map(|trigger_at| AlarmRegistration {
            schedule_id: self.id,
            medication_id: self.medication_id,
            trigger_at,
        })
    }
}

/// Computes the next trigger strictly after `now`.
///
/// Returns `None` for disabled rules and rules with no usable time of day.
/// The stored `next_trigger_at` is ignored.
#[must_use]
pub fn compute_next(rule: &ScheduleRule, now: OffsetDateTime) -> Option<OffsetDateTime> {
    if !rule.enabled {
        return None;
    }
    compute_next_for(&rule.cycle, &rule.times_of_day, now)
}

/// Computes the next trigger strictly after `now` for a cycle and time set,
/// regardless of the enabled flag.
///
/// Wall-clock times are interpreted in the UTC offset carried by `now`.
#[must_use]
pub fn compute_next_for(
    cycle: &Cycle,
    times: &TimesOfDay,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    let earliest = times.earliest()?;
    let offset = now.offset();
    let today = now.date();

    match *cycle {
        Cycle::Daily => first_slot_after(today, times, now)
            .or_else(|| Some(slot(today.next_day()?, earliest, offset))),
        Cycle::Weekly { days } => {
            if days.is_empty() {
                return None;
            }

            let mut day = today;
            for _ in 0..7 {
                if days.contains(day.weekday()) {
                    if let Some(found) = first_slot_after(day, times, now) {
                        return Some(found);
                    }
                }
                day = day.next_day()?;
            }

            // Only reachable when today is the sole active weekday and its
            // slots have passed; `day` is now one week out.
            for _ in 0..7 {
                if days.contains(day.weekday()) {
                    return Some(slot(day, earliest, offset));
                }
                day = day.next_day()?;
            }
            None
        }
        Cycle::Monthly { day_of_month } => {
            let anchor = clamped_day_of_month(today.year(), today.month(), day_of_month)?;
            if let Some(found) = first_slot_after(anchor, times, now) {
                return Some(found);
            }

            let (year, month) = following_month(today.year(), today.month())?;
            let next_anchor = clamped_day_of_month(year, month, day_of_month)?;
            Some(slot(next_anchor, earliest, offset))
        }
        Cycle::EveryNDays {
            interval_days,
            start,
        } => {
            let interval = i64::from(interval_days.max(1));
            if today < start {
                return Some(slot(start, earliest, offset));
            }

            let elapsed = i64::from(today.to_julian_day() - start.to_julian_day());
            let current = start.checked_add(Duration::days(elapsed - elapsed % interval))?;
            if let Some(found) = first_slot_after(current, times, now) {
                return Some(found);
            }

            let next_cycle_day = current.checked_add(Duration::days(interval))?;
            Some(slot(next_cycle_day, earliest, offset))
        }
    }
}

fn slot(day: Date, time: TimeOfDay, offset: UtcOffset) -> OffsetDateTime {
    PrimitiveDateTime::new(day, time.as_time()).assume_offset(offset)
}

fn first_slot_after(day: Date, times: &TimesOfDay, now: OffsetDateTime) -> Option<OffsetDateTime> {
    times
        .iter()
        .map(|time| slot(day, time, now.offset()))
        .find(|candidate| *candidate > now)
}

fn clamped_day_of_month(year: i32, month: Month, day_of_month: u8) -> Option<Date> {
    let last = time::util::days_in_year_month(year, month);
    let day = day_of_month.clamp(1, 31).min(last);
    Date::from_calendar_date(year, month, day).ok()
}

fn following_month(year: i32, month: Month) -> Option<(i32, Month)> {
    if month == Month::December {
        Some((year.checked_add(1)?, Month::January))
    } else {
        Some((year, month.next()))
    }
}

/// Durable record of schedule rules.
///
/// Implementations must make each call atomic: a failed call leaves the
/// stored rows unchanged.
pub trait ScheduleStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn insert(
        &self,
        input: &ScheduleRuleInput,
        next_trigger_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> anyhow::Result<ScheduleRule>;

    /// Overwrites every mutable column of an existing rule. Returns `false`
    /// when no rule has `rule.id`.
    #[allow(clippy::missing_errors_doc)]
    fn update(&self, rule: &ScheduleRule) -> anyhow::Result<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, id: ScheduleId) -> anyhow::Result<Option<ScheduleRule>>;

    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, id: ScheduleId) -> anyhow::Result<bool>;

    /// Newest first.
    #[allow(clippy::missing_errors_doc)]
    fn list_for_medication(&self, medication_id: MedicationId)
        -> anyhow::Result<Vec<ScheduleRule>>;

    /// Soonest trigger first; unschedulable rules last.
    #[allow(clippy::missing_errors_doc)]
    fn list_enabled(&self) -> anyhow::Result<Vec<ScheduleRule>>;

    #[allow(clippy::missing_errors_doc)]
    fn set_next_trigger(
        &self,
        id: ScheduleId,
        next_trigger_at: Option<OffsetDateTime>,
        updated_at: OffsetDateTime,
    ) -> anyhow::Result<bool>;

    /// Disabling also clears `next_trigger_at`.
    #[allow(clippy::missing_errors_doc)]
    fn set_enabled(
        &self,
        id: ScheduleId,
        enabled: bool,
        updated_at: OffsetDateTime,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AlarmRegistration {
    pub schedule_id: ScheduleId,
    pub medication_id: MedicationId,
    pub trigger_at: OffsetDateTime,
}

/// Payload delivered when an armed trigger fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct AlarmFired {
    pub schedule_id: ScheduleId,
    pub medication_id: MedicationId,
}

/// Best-effort one-shot wake mechanism. At most one registration per id.
pub trait AlarmPort: Send + Sync {
    /// Registers `registration`, replacing any pending one for the same id.
    ///
    /// # Errors
    /// Returns [`AlarmError`] when the underlying facility refuses the request.
    fn arm(&self, registration: &AlarmRegistration) -> Result<(), AlarmError>;

    /// Removes the pending registration for `schedule_id`, if any.
    ///
    /// # Errors
    /// Returns [`AlarmError`] when the underlying facility is unreachable.
    fn cancel(&self, schedule_id: ScheduleId) -> Result<(), AlarmError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in the local UTC offset, falling back to UTC when the offset
/// cannot be determined.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        match self.now.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: Duration) {
        let current = self.now();
        self.set(current + by);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[must_use]
pub fn to_epoch_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos().div_euclid(1_000_000);
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

/// Decodes epoch milliseconds as a UTC instant.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when the value is outside the
/// representable date range.
pub fn from_epoch_millis(millis: i64) -> Result<OffsetDateTime, ScheduleError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| ScheduleError::Validation(format!("epoch millis out of range: {err}")))
}

/// Encodes an optional trigger; `None` is persisted as `0`.
#[must_use]
pub fn trigger_to_millis(value: Option<OffsetDateTime>) -> i64 {
    value.map_or(0, to_epoch_millis)
}

/// Decodes a persisted trigger; `0` (or any non-positive value) means none.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when the value is out of range.
pub fn trigger_from_millis(millis: i64) -> Result<Option<OffsetDateTime>, ScheduleError> {
    if millis <= 0 {
        return Ok(None);
    }
    from_epoch_millis(millis).map(Some)
}

/// Encodes an anchor date as its midnight in UTC, independent of any local offset.
#[must_use]
pub fn anchor_to_millis(date: Date) -> i64 {
    to_epoch_millis(date.midnight().assume_utc())
}

/// # Errors
/// Returns [`ScheduleError::Validation`] when the value is out of range.
pub fn anchor_from_millis(millis: i64) -> Result<Date, ScheduleError> {
    from_epoch_millis(millis).map(OffsetDateTime::date)
}

/// Parses an RFC3339 timestamp, keeping its offset.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, ScheduleError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ScheduleError::Validation(format!("invalid RFC3339 timestamp: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ScheduleError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ScheduleError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Decodes a [`ScheduleRuleInput`] from JSON and validates it.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when decoding or validation fails.
pub fn input_from_json(value: &Value) -> Result<ScheduleRuleInput, ScheduleError> {
    let input: ScheduleRuleInput = serde_json::from_value(value.clone())
        .map_err(|err| ScheduleError::Validation(format!("invalid schedule JSON payload: {err}")))?;
    input.validate()?;
    Ok(input)
}
