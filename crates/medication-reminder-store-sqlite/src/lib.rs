#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use medication_reminder_core::{
    anchor_from_millis, anchor_to_millis, format_rfc3339, from_epoch_millis, now_utc,
    to_epoch_millis, trigger_from_millis, trigger_to_millis, Cycle, CycleType, MedicationId,
    ScheduleId, ScheduleRule, ScheduleRuleInput, ScheduleStore, TimesOfDay, WeekdayMask,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const SCHEDULE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SCHEDULES_V1: &str = r"
CREATE TABLE IF NOT EXISTS medication_schedules (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  medication_id TEXT NOT NULL,
  cycle_type INTEGER NOT NULL CHECK (cycle_type IN (0, 1, 2, 3)),
  times_of_day TEXT NOT NULL DEFAULT '',
  days_of_week_mask INTEGER NOT NULL DEFAULT 0 CHECK (days_of_week_mask BETWEEN 0 AND 127),
  day_of_month INTEGER NOT NULL DEFAULT 0 CHECK (day_of_month BETWEEN 0 AND 31),
  interval_days INTEGER NOT NULL DEFAULT 0 CHECK (interval_days >= 0),
  start_instant INTEGER NOT NULL DEFAULT 0,
  next_trigger_instant INTEGER NOT NULL DEFAULT 0,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_medication_schedules_medication
  ON medication_schedules(medication_id);
CREATE INDEX IF NOT EXISTS idx_medication_schedules_enabled_next
  ON medication_schedules(enabled, next_trigger_instant);
";

const SELECT_COLUMNS: &str = "id, medication_id, cycle_type, times_of_day, days_of_week_mask,
  day_of_month, interval_days, start_instant, next_trigger_instant, enabled,
  created_at, updated_at";

pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
}

impl SqliteScheduleStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_SCHEDULES_V1)
            .context("failed to apply medication schedule schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEDULE_MIGRATION_VERSION, now],
            )
            .context("failed to register medication schedule migration")?;

        debug!(
            version = SCHEDULE_MIGRATION_VERSION,
            newly_applied = inserted > 0,
            "medication schedule schema ready"
        );
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    fn query_rules(&self, sql: &str, medication_id: Option<MedicationId>) -> Result<Vec<ScheduleRule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rules = match medication_id {
            Some(medication_id) => {
                let rows = stmt.query_map(params![medication_id.to_string()], parse_rule_row)?;
                collect_rows(rows)?
            }
            None => {
                let rows = stmt.query_map([], parse_rule_row)?;
                collect_rows(rows)?
            }
        };
        Ok(rules)
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn insert(
        &self,
        input: &ScheduleRuleInput,
        next_trigger_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<ScheduleRule> {
        let columns = CycleColumns::from_cycle(&input.cycle);
        let now_millis = to_epoch_millis(now);

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to start schedule insert transaction")?;

        tx.execute(
            "INSERT INTO medication_schedules(
                medication_id, cycle_type, times_of_day, days_of_week_mask,
                day_of_month, interval_days, start_instant, next_trigger_instant,
                enabled, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                input.medication_id.to_string(),
                columns.cycle_type.tag(),
                input.times_of_day.to_compact(),
                columns.days_of_week_mask,
                columns.day_of_month,
                columns.interval_days,
                columns.start_instant,
                trigger_to_millis(next_trigger_at),
                bool_to_sql(input.enabled),
                now_millis,
                now_millis,
            ],
        )
        .context("failed to insert medication schedule")?;

        let id = ScheduleId(tx.last_insert_rowid());
        let stored = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM medication_schedules WHERE id = ?1"),
                params![id.0],
                parse_rule_row,
            )
            .context("failed to read back inserted medication schedule")?;
        tx.commit()
            .context("failed to commit schedule insert transaction")?;

        Ok(stored)
    }

    fn update(&self, rule: &ScheduleRule) -> Result<bool> {
        let columns = CycleColumns::from_cycle(&rule.cycle);
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE medication_schedules SET
                   medication_id = ?2,
                   cycle_type = ?3,
                   times_of_day = ?4,
                   days_of_week_mask = ?5,
                   day_of_month = ?6,
                   interval_days = ?7,
                   start_instant = ?8,
                   next_trigger_instant = ?9,
                   enabled = ?10,
                   updated_at = ?11
                 WHERE id = ?1",
                params![
                    rule.id.0,
                    rule.medication_id.to_string(),
                    columns.cycle_type.tag(),
                    rule.times_of_day.to_compact(),
                    columns.days_of_week_mask,
                    columns.day_of_month,
                    columns.interval_days,
                    columns.start_instant,
                    trigger_to_millis(rule.next_trigger_at),
                    bool_to_sql(rule.enabled),
                    to_epoch_millis(rule.updated_at),
                ],
            )
            .with_context(|| format!("failed to update medication schedule {}", rule.id))?;
        Ok(changed > 0)
    }

    fn get(&self, id: ScheduleId) -> Result<Option<ScheduleRule>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM medication_schedules WHERE id = ?1"),
            params![id.0],
            parse_rule_row,
        )
        .optional()
        .with_context(|| format!("failed to load medication schedule {id}"))
    }

    fn delete(&self, id: ScheduleId) -> Result<bool> {
        let conn = self.lock()?;
        let removed = conn
            .execute(
                "DELETE FROM medication_schedules WHERE id = ?1",
                params![id.0],
            )
            .with_context(|| format!("failed to delete medication schedule {id}"))?;
        Ok(removed > 0)
    }

    fn list_for_medication(&self, medication_id: MedicationId) -> Result<Vec<ScheduleRule>> {
        self.query_rules(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM medication_schedules
                 WHERE medication_id = ?1
                 ORDER BY created_at DESC, id DESC"
            ),
            Some(medication_id),
        )
        .with_context(|| format!("failed to list schedules for medication {medication_id}"))
    }

    fn list_enabled(&self) -> Result<Vec<ScheduleRule>> {
        self.query_rules(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM medication_schedules
                 WHERE enabled = 1
                 ORDER BY next_trigger_instant = 0 ASC, next_trigger_instant ASC, id ASC"
            ),
            None,
        )
        .context("failed to list enabled medication schedules")
    }

    fn set_next_trigger(
        &self,
        id: ScheduleId,
        next_trigger_at: Option<OffsetDateTime>,
        updated_at: OffsetDateTime,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE medication_schedules
                 SET next_trigger_instant = ?2, updated_at = ?3
                 WHERE id = ?1",
                params![
                    id.0,
                    trigger_to_millis(next_trigger_at),
                    to_epoch_millis(updated_at)
                ],
            )
            .with_context(|| format!("failed to set next trigger for schedule {id}"))?;
        Ok(changed > 0)
    }

    fn set_enabled(&self, id: ScheduleId, enabled: bool, updated_at: OffsetDateTime) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE medication_schedules
                 SET enabled = ?2,
                     next_trigger_instant = CASE WHEN ?2 = 0 THEN 0 ELSE next_trigger_instant END,
                     updated_at = ?3
                 WHERE id = ?1",
                params![id.0, bool_to_sql(enabled), to_epoch_millis(updated_at)],
            )
            .with_context(|| format!("failed to set enabled={enabled} for schedule {id}"))?;
        Ok(changed > 0)
    }
}

/// Flat column encoding of a [`Cycle`]; fields a variant does not use are 0.
struct CycleColumns {
    cycle_type: CycleType,
    days_of_week_mask: i64,
    day_of_month: i64,
    interval_days: i64,
    start_instant: i64,
}

impl CycleColumns {
    fn from_cycle(cycle: &Cycle) -> Self {
        let mut columns = Self {
            cycle_type: cycle.cycle_type(),
            days_of_week_mask: 0,
            day_of_month: 0,
            interval_days: 0,
            start_instant: 0,
        };
        match *cycle {
            Cycle::Daily => {}
            Cycle::Weekly { days } => columns.days_of_week_mask = i64::from(days.bits()),
            Cycle::Monthly { day_of_month } => {
                columns.day_of_month = i64::from(day_of_month.clamp(1, 31));
            }
            Cycle::EveryNDays {
                interval_days,
                start,
            } => {
                columns.interval_days = i64::from(interval_days);
                columns.start_instant = anchor_to_millis(start);
            }
        }
        columns
    }
}

fn parse_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRule> {
    let id: i64 = row.get(0)?;
    let medication_id_raw: String = row.get(1)?;
    let cycle_tag: i64 = row.get(2)?;
    let times_raw: String = row.get(3)?;
    let mask_raw: i64 = row.get(4)?;
    let day_of_month_raw: i64 = row.get(5)?;
    let interval_raw: i64 = row.get(6)?;
    let start_raw: i64 = row.get(7)?;
    let next_raw: i64 = row.get(8)?;
    let enabled_raw: i64 = row.get(9)?;
    let created_raw: i64 = row.get(10)?;
    let updated_raw: i64 = row.get(11)?;

    let medication_id = Ulid::from_string(&medication_id_raw)
        .map(MedicationId)
        .map_err(|err| {
            invalid_column(1, Type::Text, format!("invalid medication_id {medication_id_raw}: {err}"))
        })?;

    let cycle_type = CycleType::from_tag(cycle_tag).ok_or_else(|| {
        invalid_column(2, Type::Integer, format!("unknown cycle_type tag: {cycle_tag}"))
    })?;

    let cycle = match cycle_type {
        CycleType::Daily => Cycle::Daily,
        CycleType::Weekly => {
            let bits = u8::try_from(mask_raw).map_err(|_| {
                invalid_column(4, Type::Integer, format!("invalid days_of_week_mask: {mask_raw}"))
            })?;
            Cycle::Weekly {
                days: WeekdayMask::from_bits(bits),
            }
        }
        CycleType::Monthly => {
            let day_of_month = u8::try_from(day_of_month_raw).map_err(|_| {
                invalid_column(5, Type::Integer, format!("invalid day_of_month: {day_of_month_raw}"))
            })?;
            Cycle::Monthly { day_of_month }
        }
        CycleType::EveryNDays => {
            let interval_days = u32::try_from(interval_raw).map_err(|_| {
                invalid_column(6, Type::Integer, format!("invalid interval_days: {interval_raw}"))
            })?;
            let start = anchor_from_millis(start_raw)
                .map_err(|err| invalid_column(7, Type::Integer, err.to_string()))?;
            Cycle::EveryNDays {
                interval_days,
                start,
            }
        }
    };

    let next_trigger_at = trigger_from_millis(next_raw)
        .map_err(|err| invalid_column(8, Type::Integer, err.to_string()))?;
    let created_at = from_epoch_millis(created_raw)
        .map_err(|err| invalid_column(10, Type::Integer, err.to_string()))?;
    let updated_at = from_epoch_millis(updated_raw)
        .map_err(|err| invalid_column(11, Type::Integer, err.to_string()))?;

    Ok(ScheduleRule {
        id: ScheduleId(id),
        medication_id,
        cycle,
        times_of_day: TimesOfDay::parse_lenient(&times_raw),
        next_trigger_at,
        enabled: enabled_raw != 0,
        created_at,
        updated_at,
    })
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
