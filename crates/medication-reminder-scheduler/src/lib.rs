mod alarm;
mod config;
mod memory;
mod pool;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use medication_reminder_core::{
    compute_next, AlarmFired, AlarmPort, AlarmRegistration, Clock, MedicationId, ScheduleError,
    ScheduleId, ScheduleRule, ScheduleRuleInput, ScheduleStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

pub use alarm::{AlarmCall, RecordingAlarmPort, TimerAlarmPort};
pub use config::{SchedulerConfig, MAX_IN_FLIGHT_ENV, SNOOZE_MINUTES_ENV};
pub use memory::InMemoryScheduleStore;
pub use pool::WorkerPool;

/// Outcome of [`ScheduleManager::rearm_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RearmReport {
    /// Enabled rules handed to the alarm port.
    pub armed: usize,
    /// Enabled rules with no future occurrence.
    pub unschedulable: usize,
    /// Rules the alarm port refused; their stored trigger is still current.
    pub alarm_failures: Vec<ScheduleId>,
}

/// Owns the lifecycle of schedule rules: persist first, then mirror the
/// result into the alarm port.
///
/// Every operation runs on the injected [`WorkerPool`]. Operations on the same
/// schedule id are applied in submission order.
pub struct ScheduleManager {
    lifecycle: Arc<Lifecycle>,
    pool: WorkerPool,
    locks: IdLocks,
}

impl ScheduleManager {
    /// # Errors
    /// Returns [`ScheduleError::Configuration`] when `config` is invalid.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        alarms: Arc<dyn AlarmPort>,
        clock: Arc<dyn Clock>,
        pool: WorkerPool,
        config: SchedulerConfig,
    ) -> Result<Self, ScheduleError> {
        config.validate()?;
        Ok(Self {
            lifecycle: Arc::new(Lifecycle {
                store,
                alarms,
                clock,
                config,
            }),
            pool,
            locks: IdLocks::default(),
        })
    }

    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        self.lifecycle.config
    }

    /// Persists a new rule and arms its first occurrence.
    ///
    /// # Errors
    /// [`ScheduleError::Store`] when the insert fails, [`ScheduleError::Alarm`]
    /// (carrying the new id) when arming fails after the insert.
    pub async fn create(&self, input: ScheduleRuleInput) -> Result<ScheduleId, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.pool.run(move || lifecycle.create(&input)).await
    }

    /// Replaces a rule's definition and recomputes its next occurrence from now.
    ///
    /// # Errors
    /// [`ScheduleError::NotFound`] when `rule.id` does not exist, otherwise as
    /// [`ScheduleManager::create`].
    pub async fn update(&self, rule: ScheduleRule) -> Result<ScheduleId, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(rule.id, move || lifecycle.update(rule)).await
    }

    /// Disables a rule and cancels its alarm. Unknown ids are ignored.
    ///
    /// # Errors
    /// [`ScheduleError::Store`] or [`ScheduleError::Alarm`].
    pub async fn disable(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(id, move || lifecycle.disable(id)).await
    }

    /// Re-enables a rule and arms its next occurrence from now.
    ///
    /// # Errors
    /// [`ScheduleError::NotFound`] for unknown ids, otherwise as
    /// [`ScheduleManager::create`].
    pub async fn enable(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(id, move || lifecycle.enable(id)).await
    }

    /// Removes a rule and its alarm. Unknown ids are ignored.
    ///
    /// # Errors
    /// [`ScheduleError::Store`] or [`ScheduleError::Alarm`].
    pub async fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(id, move || lifecycle.delete(id)).await
    }

    /// Pushes the next trigger to now plus the configured snooze interval.
    /// Disabled rules are left untouched and yield `None`.
    ///
    /// # Errors
    /// [`ScheduleError::NotFound`] for unknown ids, otherwise as
    /// [`ScheduleManager::create`].
    pub async fn snooze(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(id, move || lifecycle.snooze(id)).await
    }

    /// Moves a rule to its following occurrence after a trigger fired or a
    /// dose was taken.
    ///
    /// # Errors
    /// [`ScheduleError::NotFound`] for unknown ids, otherwise as
    /// [`ScheduleManager::create`].
    pub async fn advance(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.run_locked(id, move || lifecycle.advance(id)).await
    }

    /// Handles a delivered alarm by advancing its rule. A rule deleted while
    /// the alarm was in flight is ignored.
    ///
    /// # Errors
    /// As [`ScheduleManager::advance`], except for [`ScheduleError::NotFound`].
    pub async fn on_alarm_fired(
        &self,
        fired: AlarmFired,
    ) -> Result<Option<OffsetDateTime>, ScheduleError> {
        info!(
            schedule_id = %fired.schedule_id,
            medication_id = %fired.medication_id,
            "reminder fired"
        );
        match self.advance(fired.schedule_id).await {
            Err(ScheduleError::NotFound(id)) => {
                debug!(schedule_id = %id, "fired alarm for deleted schedule");
                Ok(None)
            }
            other => other,
        }
    }

    /// Recomputes every enabled rule from now and re-registers its alarm.
    /// Used after restart, when pending alarms may have been lost.
    ///
    /// Each rule is reloaded under its id lock, so an operation that lands
    /// while the sweep runs is never overwritten by the listed snapshot.
    ///
    /// # Errors
    /// [`ScheduleError::Store`] when listing or writing fails. Alarm failures
    /// are collected in the report instead.
    pub async fn rearm_all(&self) -> Result<RearmReport, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        let ids: Vec<ScheduleId> = self
            .pool
            .run(move || lifecycle.store.list_enabled().map_err(ScheduleError::store))
            .await?
            .iter()
            .map(|rule| rule.id)
            .collect();

        let mut report = RearmReport::default();
        for id in ids {
            let lifecycle = Arc::clone(&self.lifecycle);
            match self.run_locked(id, move || lifecycle.rearm(id)).await? {
                Rearmed::Armed => report.armed += 1,
                Rearmed::Unschedulable => report.unschedulable += 1,
                Rearmed::AlarmFailed { scheduled } => {
                    if scheduled {
                        report.armed += 1;
                    } else {
                        report.unschedulable += 1;
                    }
                    report.alarm_failures.push(id);
                }
                Rearmed::Skipped => {}
            }
        }

        info!(
            armed = report.armed,
            unschedulable = report.unschedulable,
            alarm_failures = report.alarm_failures.len(),
            "schedules re-armed"
        );
        Ok(report)
    }

    /// # Errors
    /// [`ScheduleError::Store`] when the read fails.
    pub async fn get(&self, id: ScheduleId) -> Result<Option<ScheduleRule>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.pool
            .run(move || lifecycle.store.get(id).map_err(ScheduleError::store))
            .await
    }

    /// # Errors
    /// [`ScheduleError::Store`] when the read fails.
    pub async fn list_for_medication(
        &self,
        medication_id: MedicationId,
    ) -> Result<Vec<ScheduleRule>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.pool
            .run(move || {
                lifecycle
                    .store
                    .list_for_medication(medication_id)
                    .map_err(ScheduleError::store)
            })
            .await
    }

    /// # Errors
    /// [`ScheduleError::Store`] when the read fails.
    pub async fn list_enabled(&self) -> Result<Vec<ScheduleRule>, ScheduleError> {
        let lifecycle = Arc::clone(&self.lifecycle);
        self.pool
            .run(move || lifecycle.store.list_enabled().map_err(ScheduleError::store))
            .await
    }

    /// Stops accepting work; later calls fail with [`ScheduleError::Shutdown`].
    pub fn shutdown(&self) {
        info!("schedule manager shutting down");
        self.pool.shutdown();
    }

    /// Runs `job` on the pool while holding the lock for `id`. The guard moves
    /// into the job, so a dropped caller cannot release it early.
    async fn run_locked<F, T>(&self, id: ScheduleId, job: F) -> Result<T, ScheduleError>
    where
        F: FnOnce() -> Result<T, ScheduleError> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.locks.acquire(id).await;
        let result = self
            .pool
            .run(move || {
                let _guard = guard;
                job()
            })
            .await;
        self.locks.release(id);
        result
    }
}

// ── Blocking lifecycle steps ──────────────────────────────────

enum Rearmed {
    Armed,
    Unschedulable,
    AlarmFailed { scheduled: bool },
    Skipped,
}

struct Lifecycle {
    store: Arc<dyn ScheduleStore>,
    alarms: Arc<dyn AlarmPort>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Lifecycle {
    fn create(&self, input: &ScheduleRuleInput) -> Result<ScheduleId, ScheduleError> {
        let now = self.clock.now();
        let next = input.compute_next(now);
        debug!(medication_id = %input.medication_id, now = %now, next_trigger_at = ?next, "computed first occurrence");

        let rule = self
            .store
            .insert(input, next, now)
            .map_err(ScheduleError::store)?;
        info!(
            schedule_id = %rule.id,
            medication_id = %rule.medication_id,
            cycle = rule.cycle.cycle_type().as_str(),
            next_trigger_at = ?rule.next_trigger_at,
            "schedule created"
        );

        if let Some(registration) = rule.alarm_registration() {
            self.arm(&registration)?;
        }
        Ok(rule.id)
    }

    fn update(&self, mut rule: ScheduleRule) -> Result<ScheduleId, ScheduleError> {
        let now = self.clock.now();
        let existing = self
            .store
            .get(rule.id)
            .map_err(ScheduleError::store)?
            .ok_or(ScheduleError::NotFound(rule.id))?;

        rule.created_at = existing.created_at;
        rule.updated_at = now;
        rule.next_trigger_at = compute_next(&rule, now);
        if !self.store.update(&rule).map_err(ScheduleError::store)? {
            return Err(ScheduleError::NotFound(rule.id));
        }
        info!(
            schedule_id = %rule.id,
            medication_id = %rule.medication_id,
            enabled = rule.enabled,
            next_trigger_at = ?rule.next_trigger_at,
            "schedule updated"
        );

        self.sync_alarm(&rule)?;
        Ok(rule.id)
    }

    fn disable(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let changed = self
            .store
            .set_enabled(id, false, self.clock.now())
            .map_err(ScheduleError::store)?;
        info!(schedule_id = %id, existed = changed, "schedule disabled");
        self.cancel(id)
    }

    fn enable(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let now = self.clock.now();
        let mut rule = self.load(id)?;
        rule.enabled = true;
        rule.updated_at = now;
        rule.next_trigger_at = compute_next(&rule, now);
        if !self.store.update(&rule).map_err(ScheduleError::store)? {
            return Err(ScheduleError::NotFound(id));
        }
        info!(schedule_id = %id, next_trigger_at = ?rule.next_trigger_at, "schedule enabled");

        self.sync_alarm(&rule)?;
        Ok(rule.next_trigger_at)
    }

    fn delete(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        let removed = self.store.delete(id).map_err(ScheduleError::store)?;
        info!(schedule_id = %id, existed = removed, "schedule deleted");
        self.cancel(id)
    }

    fn snooze(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let now = self.clock.now();
        let mut rule = self.load(id)?;
        if !rule.enabled {
            debug!(schedule_id = %id, "snooze ignored for disabled schedule");
            return Ok(None);
        }

        let next = now + self.config.snooze_duration();
        if !self
            .store
            .set_next_trigger(id, Some(next), now)
            .map_err(ScheduleError::store)?
        {
            return Err(ScheduleError::NotFound(id));
        }
        rule.next_trigger_at = Some(next);
        info!(
            schedule_id = %id,
            snooze_minutes = self.config.snooze_minutes,
            next_trigger_at = %next,
            "schedule snoozed"
        );

        self.sync_alarm(&rule)?;
        Ok(Some(next))
    }

    fn advance(&self, id: ScheduleId) -> Result<Option<OffsetDateTime>, ScheduleError> {
        let now = self.clock.now();
        let mut rule = self.load(id)?;
        if !rule.enabled {
            return Ok(None);
        }

        let next = compute_next(&rule, now);
        if !self
            .store
            .set_next_trigger(id, next, now)
            .map_err(ScheduleError::store)?
        {
            return Err(ScheduleError::NotFound(id));
        }
        rule.next_trigger_at = next;
        info!(schedule_id = %id, next_trigger_at = ?next, "schedule advanced");

        self.sync_alarm(&rule)?;
        Ok(next)
    }

    fn rearm(&self, id: ScheduleId) -> Result<Rearmed, ScheduleError> {
        let now = self.clock.now();
        let Some(mut rule) = self.store.get(id).map_err(ScheduleError::store)? else {
            debug!(schedule_id = %id, "rearm skipped deleted schedule");
            return Ok(Rearmed::Skipped);
        };
        if !rule.enabled {
            debug!(schedule_id = %id, "rearm skipped disabled schedule");
            return Ok(Rearmed::Skipped);
        }

        let next = compute_next(&rule, now);
        if next != rule.next_trigger_at {
            self.store
                .set_next_trigger(id, next, now)
                .map_err(ScheduleError::store)?;
            rule.next_trigger_at = next;
        }

        match self.sync_alarm(&rule) {
            Ok(()) if next.is_some() => Ok(Rearmed::Armed),
            Ok(()) => Ok(Rearmed::Unschedulable),
            Err(ScheduleError::Alarm { .. }) => Ok(Rearmed::AlarmFailed {
                scheduled: next.is_some(),
            }),
            Err(err) => Err(err),
        }
    }

    fn load(&self, id: ScheduleId) -> Result<ScheduleRule, ScheduleError> {
        self.store
            .get(id)
            .map_err(ScheduleError::store)?
            .ok_or(ScheduleError::NotFound(id))
    }

    /// Arms the rule's next occurrence, or cancels when it has none.
    fn sync_alarm(&self, rule: &ScheduleRule) -> Result<(), ScheduleError> {
        match rule.alarm_registration() {
            Some(registration) => self.arm(&registration),
            None => self.cancel(rule.id),
        }
    }

    fn arm(&self, registration: &AlarmRegistration) -> Result<(), ScheduleError> {
        self.alarms.arm(registration).map_err(|reason| {
            warn!(
                schedule_id = %registration.schedule_id,
                medication_id = %registration.medication_id,
                trigger_at = %registration.trigger_at,
                error = %reason,
                "alarm registration failed"
            );
            ScheduleError::Alarm {
                schedule_id: registration.schedule_id,
                reason,
            }
        })
    }

    fn cancel(&self, id: ScheduleId) -> Result<(), ScheduleError> {
        self.alarms.cancel(id).map_err(|reason| {
            warn!(schedule_id = %id, error = %reason, "alarm cancellation failed");
            ScheduleError::Alarm {
                schedule_id: id,
                reason,
            }
        })
    }
}

// ── Per-id ordering ───────────────────────────────────────────

/// FIFO lock per schedule id; `tokio::sync::Mutex` wakes waiters in order.
#[derive(Default)]
struct IdLocks {
    locks: Mutex<HashMap<ScheduleId, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdLocks {
    async fn acquire(&self, id: ScheduleId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Drops the entry for `id` when no operation holds or awaits it.
    fn release(&self, id: ScheduleId) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if locks
            .get(&id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medication_reminder_core::{
        parse_rfc3339, Cycle, FixedClock, TimesOfDay, WeekdayMask,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;
    use time::{Duration, Weekday};

    struct Harness {
        manager: ScheduleManager,
        store: Arc<InMemoryScheduleStore>,
        alarms: Arc<RecordingAlarmPort>,
        clock: Arc<FixedClock>,
    }

    fn at(value: &str) -> OffsetDateTime {
        match parse_rfc3339(value) {
            Ok(parsed) => parsed,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must<T>(result: Result<T, ScheduleError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn harness() -> Harness {
        harness_with(SchedulerConfig::v1())
    }

    fn harness_with(config: SchedulerConfig) -> Harness {
        let store = Arc::new(InMemoryScheduleStore::new());
        let alarms = Arc::new(RecordingAlarmPort::new());
        let clock = Arc::new(FixedClock::new(at("2026-03-03T08:30:00Z")));
        let pool = must(WorkerPool::current(config.max_in_flight));
        let manager = must(ScheduleManager::new(
            Arc::clone(&store) as Arc<dyn ScheduleStore>,
            Arc::clone(&alarms) as Arc<dyn AlarmPort>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            pool,
            config,
        ));
        Harness {
            manager,
            store,
            alarms,
            clock,
        }
    }

    /// Wraps the in-memory store with blocking delays on `list_enabled` and
    /// `set_enabled`, and records the peak number of overlapping calls.
    struct SlowStore {
        inner: InMemoryScheduleStore,
        list_delay: StdDuration,
        set_enabled_delay: StdDuration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowStore {
        fn new(list_delay: StdDuration, set_enabled_delay: StdDuration) -> Self {
            Self {
                inner: InMemoryScheduleStore::new(),
                list_delay,
                set_enabled_delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn tracked<T>(&self, delay: StdDuration, call: impl FnOnce() -> T) -> T {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            std::thread::sleep(delay);
            let result = call();
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl ScheduleStore for SlowStore {
        fn insert(
            &self,
            input: &ScheduleRuleInput,
            next_trigger_at: Option<OffsetDateTime>,
            now: OffsetDateTime,
        ) -> anyhow::Result<ScheduleRule> {
            self.inner.insert(input, next_trigger_at, now)
        }

        fn update(&self, rule: &ScheduleRule) -> anyhow::Result<bool> {
            self.tracked(StdDuration::ZERO, || self.inner.update(rule))
        }

        fn get(&self, id: ScheduleId) -> anyhow::Result<Option<ScheduleRule>> {
            self.tracked(StdDuration::ZERO, || self.inner.get(id))
        }

        fn delete(&self, id: ScheduleId) -> anyhow::Result<bool> {
            self.inner.delete(id)
        }

        fn list_for_medication(
            &self,
            medication_id: MedicationId,
        ) -> anyhow::Result<Vec<ScheduleRule>> {
            self.inner.list_for_medication(medication_id)
        }

        fn list_enabled(&self) -> anyhow::Result<Vec<ScheduleRule>> {
            self.tracked(self.list_delay, || self.inner.list_enabled())
        }

        fn set_next_trigger(
            &self,
            id: ScheduleId,
            next_trigger_at: Option<OffsetDateTime>,
            updated_at: OffsetDateTime,
        ) -> anyhow::Result<bool> {
            self.inner.set_next_trigger(id, next_trigger_at, updated_at)
        }

        fn set_enabled(
            &self,
            id: ScheduleId,
            enabled: bool,
            updated_at: OffsetDateTime,
        ) -> anyhow::Result<bool> {
            self.tracked(self.set_enabled_delay, || {
                self.inner.set_enabled(id, enabled, updated_at)
            })
        }
    }

    fn slow_manager(
        store: &Arc<SlowStore>,
        alarms: &Arc<RecordingAlarmPort>,
        clock: &Arc<FixedClock>,
    ) -> ScheduleManager {
        let config = SchedulerConfig::v1();
        must(ScheduleManager::new(
            Arc::clone(store) as Arc<dyn ScheduleStore>,
            Arc::clone(alarms) as Arc<dyn AlarmPort>,
            Arc::clone(clock) as Arc<dyn Clock>,
            must(WorkerPool::current(config.max_in_flight)),
            config,
        ))
    }

    fn daily_input(times: &str) -> ScheduleRuleInput {
        ScheduleRuleInput {
            medication_id: MedicationId::new(),
            cycle: Cycle::Daily,
            times_of_day: TimesOfDay::parse_lenient(times),
            enabled: true,
        }
    }

    async fn stored(harness: &Harness, id: ScheduleId) -> ScheduleRule {
        must_some(must(harness.manager.get(id).await))
    }

    #[tokio::test]
    async fn create_persists_and_arms_first_occurrence() {
        let h = harness();
        let input = daily_input("08:00,20:00");
        let id = must(h.manager.create(input.clone()).await);

        let rule = stored(&h, id).await;
        assert_eq!(rule.next_trigger_at, Some(at("2026-03-03T20:00:00Z")));
        assert_eq!(rule.created_at, at("2026-03-03T08:30:00Z"));
        assert_eq!(
            h.alarms.registrations(),
            vec![AlarmRegistration {
                schedule_id: id,
                medication_id: input.medication_id,
                trigger_at: at("2026-03-03T20:00:00Z"),
            }]
        );
    }

    #[tokio::test]
    async fn unschedulable_rule_is_stored_without_alarm() {
        let h = harness();
        let id = must(h.manager.create(daily_input("bad,99:99")).await);

        assert_eq!(stored(&h, id).await.next_trigger_at, None);
        assert!(h.alarms.calls().is_empty());
    }

    #[tokio::test]
    async fn update_recomputes_instead_of_trusting_stored_trigger() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00,20:00")).await);

        let mut edited = stored(&h, id).await;
        edited.times_of_day = TimesOfDay::parse_lenient("21:00");
        edited.next_trigger_at = Some(at("2020-01-01T00:00:00Z"));
        h.clock.set(at("2026-03-03T09:00:00Z"));
        assert_eq!(must(h.manager.update(edited).await), id);

        let rule = stored(&h, id).await;
        assert_eq!(rule.next_trigger_at, Some(at("2026-03-03T21:00:00Z")));
        assert_eq!(rule.updated_at, at("2026-03-03T09:00:00Z"));
        assert_eq!(rule.created_at, at("2026-03-03T08:30:00Z"));

        let registrations = h.alarms.registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].trigger_at, at("2026-03-03T21:00:00Z"));
    }

    #[tokio::test]
    async fn update_to_weekly_moves_alarm_to_next_active_day() {
        let h = harness();
        let id = must(h.manager.create(daily_input("09:00")).await);

        let mut edited = stored(&h, id).await;
        edited.cycle = Cycle::Weekly {
            days: WeekdayMask::from_weekdays([Weekday::Monday, Weekday::Wednesday]),
        };
        h.clock.set(at("2026-03-03T10:00:00Z"));
        must(h.manager.update(edited).await);

        assert_eq!(
            h.alarms.registration(id).map(|registration| registration.trigger_at),
            Some(at("2026-03-04T09:00:00Z"))
        );
    }

    #[tokio::test]
    async fn update_of_unknown_rule_is_not_found() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00")).await);
        let mut ghost = stored(&h, id).await;
        ghost.id = ScheduleId(404);

        assert_eq!(
            h.manager.update(ghost).await,
            Err(ScheduleError::NotFound(ScheduleId(404)))
        );
    }

    #[tokio::test]
    async fn update_to_disabled_cancels_alarm() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);
        let mut edited = stored(&h, id).await;
        edited.enabled = false;
        must(h.manager.update(edited).await);

        let rule = stored(&h, id).await;
        assert!(!rule.enabled);
        assert_eq!(rule.next_trigger_at, None);
        assert!(h.alarms.registrations().is_empty());
    }

    #[tokio::test]
    async fn disable_is_idempotent_and_ignores_unknown_ids() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);

        must(h.manager.disable(id).await);
        must(h.manager.disable(id).await);
        must(h.manager.disable(ScheduleId(777)).await);

        let rule = stored(&h, id).await;
        assert!(!rule.enabled);
        assert_eq!(rule.next_trigger_at, None);
        assert!(h.alarms.registrations().is_empty());
        assert!(must(h.manager.list_enabled().await).is_empty());
    }

    #[tokio::test]
    async fn enable_recomputes_from_current_time() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00,20:00")).await);
        must(h.manager.disable(id).await);

        h.clock.set(at("2026-03-03T21:00:00Z"));
        let next = must(h.manager.enable(id).await);
        assert_eq!(next, Some(at("2026-03-04T08:00:00Z")));
        assert_eq!(stored(&h, id).await.next_trigger_at, next);
        assert_eq!(
            h.alarms.registration(id).map(|registration| registration.trigger_at),
            next
        );

        assert_eq!(
            h.manager.enable(ScheduleId(12)).await,
            Err(ScheduleError::NotFound(ScheduleId(12)))
        );
    }

    #[tokio::test]
    async fn delete_removes_rule_and_alarm() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);

        must(h.manager.delete(id).await);
        must(h.manager.delete(id).await);
        assert_eq!(must(h.manager.get(id).await), None);
        assert!(h.alarms.registrations().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn snooze_pushes_trigger_past_now() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00,20:00")).await);

        h.clock.set(at("2026-03-03T20:00:00Z"));
        let next = must(h.manager.snooze(id).await);
        assert_eq!(next, Some(at("2026-03-03T20:10:00Z")));
        assert_eq!(stored(&h, id).await.next_trigger_at, next);
        assert_eq!(
            h.alarms.registration(id).map(|registration| registration.trigger_at),
            next
        );
    }

    #[tokio::test]
    async fn snooze_uses_configured_interval_and_skips_disabled_rules() {
        let mut config = SchedulerConfig::v1();
        config.snooze_minutes = 25;
        let h = harness_with(config);
        let id = must(h.manager.create(daily_input("20:00")).await);
        assert_eq!(
            must(h.manager.snooze(id).await),
            Some(h.clock.now() + Duration::minutes(25))
        );

        must(h.manager.disable(id).await);
        h.alarms.clear_calls();
        assert_eq!(must(h.manager.snooze(id).await), None);
        assert!(h.alarms.calls().is_empty());
        assert_eq!(stored(&h, id).await.next_trigger_at, None);
    }

    #[tokio::test]
    async fn advance_moves_to_following_occurrence() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00,20:00")).await);

        h.clock.set(at("2026-03-03T20:00:00Z"));
        let next = must(h.manager.advance(id).await);
        assert_eq!(next, Some(at("2026-03-04T08:00:00Z")));
        assert_eq!(stored(&h, id).await.next_trigger_at, next);
        assert_eq!(h.alarms.registrations().len(), 1);
    }

    #[tokio::test]
    async fn fired_alarm_for_deleted_rule_is_ignored() {
        let h = harness();
        let input = daily_input("20:00");
        let medication_id = input.medication_id;
        let id = must(h.manager.create(input).await);
        must(h.manager.delete(id).await);

        let outcome = h
            .manager
            .on_alarm_fired(AlarmFired {
                schedule_id: id,
                medication_id,
            })
            .await;
        assert_eq!(outcome, Ok(None));
    }

    #[tokio::test]
    async fn rearm_all_restores_alarms_from_store() {
        let h = harness();
        let now = h.clock.now();
        let stale = must_some(daily_input("08:00").compute_next(at("2026-03-01T00:00:00Z")));
        for (input, next) in [
            (daily_input("08:00"), Some(stale)),
            (daily_input("20:00"), None),
            (daily_input("garbage"), None),
        ] {
            if let Err(err) = h.store.insert(&input, next, now) {
                panic!("failed to seed store: {err:#}");
            }
        }
        let mut disabled = daily_input("09:00");
        disabled.enabled = false;
        if let Err(err) = h.store.insert(&disabled, None, now) {
            panic!("failed to seed store: {err:#}");
        }

        let report = must(h.manager.rearm_all().await);
        assert_eq!(
            report,
            RearmReport {
                armed: 2,
                unschedulable: 1,
                alarm_failures: Vec::new(),
            }
        );

        let triggers: Vec<OffsetDateTime> = h
            .alarms
            .registrations()
            .iter()
            .map(|registration| registration.trigger_at)
            .collect();
        assert_eq!(
            triggers,
            vec![at("2026-03-04T08:00:00Z"), at("2026-03-03T20:00:00Z")]
        );
        let enabled = must(h.manager.list_enabled().await);
        assert_eq!(enabled[0].next_trigger_at, Some(at("2026-03-03T20:00:00Z")));
    }

    #[tokio::test]
    async fn store_failure_leaves_alarms_untouched() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);
        let mut edited = stored(&h, id).await;
        edited.times_of_day = TimesOfDay::parse_lenient("21:00");
        let before = h.alarms.registrations();
        h.alarms.clear_calls();

        h.store.set_unavailable(true);
        assert!(matches!(
            h.manager.update(edited).await,
            Err(ScheduleError::Store(_))
        ));
        assert!(matches!(
            h.manager.disable(id).await,
            Err(ScheduleError::Store(_))
        ));
        assert!(matches!(
            h.manager.create(daily_input("08:00")).await,
            Err(ScheduleError::Store(_))
        ));

        assert!(h.alarms.calls().is_empty());
        assert_eq!(h.alarms.registrations(), before);
    }

    #[tokio::test]
    async fn alarm_failure_keeps_stored_rule_and_rearm_repairs_it() {
        let h = harness();
        h.alarms.set_denying(true);

        let result = h.manager.create(daily_input("20:00")).await;
        let Err(ScheduleError::Alarm { schedule_id, .. }) = result else {
            panic!("expected alarm failure, got {result:?}");
        };
        let rule = stored(&h, schedule_id).await;
        assert_eq!(rule.next_trigger_at, Some(at("2026-03-03T20:00:00Z")));

        let report = must(h.manager.rearm_all().await);
        assert_eq!(report.alarm_failures, vec![schedule_id]);

        h.alarms.set_denying(false);
        let report = must(h.manager.rearm_all().await);
        assert_eq!(report.armed, 1);
        assert!(report.alarm_failures.is_empty());
        assert!(h.alarms.registration(schedule_id).is_some());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_operations() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);
        h.manager.shutdown();

        assert_eq!(h.manager.disable(id).await, Err(ScheduleError::Shutdown));
        assert_eq!(
            h.manager.create(daily_input("08:00")).await,
            Err(ScheduleError::Shutdown)
        );
    }

    #[tokio::test]
    async fn same_id_operations_apply_in_submission_order() {
        let h = harness();
        let id = must(h.manager.create(daily_input("08:00")).await);
        let base = stored(&h, id).await;

        let mut first = base.clone();
        first.times_of_day = TimesOfDay::parse_lenient("10:00");
        let mut second = base;
        second.times_of_day = TimesOfDay::parse_lenient("11:00");

        let (first_result, second_result) =
            tokio::join!(h.manager.update(first), h.manager.update(second));
        assert_eq!(first_result, Ok(id));
        assert_eq!(second_result, Ok(id));

        assert_eq!(stored(&h, id).await.times_of_day.to_compact(), "11:00");
        assert_eq!(
            h.alarms.registration(id).map(|registration| registration.trigger_at),
            Some(at("2026-03-03T11:00:00Z"))
        );
    }

    #[tokio::test]
    async fn rearm_all_keeps_update_submitted_during_sweep() {
        let store = Arc::new(SlowStore::new(
            StdDuration::from_millis(300),
            StdDuration::ZERO,
        ));
        let alarms = Arc::new(RecordingAlarmPort::new());
        let clock = Arc::new(FixedClock::new(at("2026-03-03T08:30:00Z")));
        let manager = slow_manager(&store, &alarms, &clock);

        let id = must(manager.create(daily_input("20:00")).await);
        let mut edited = must_some(must(manager.get(id).await));
        edited.times_of_day = TimesOfDay::parse_lenient("21:00");
        clock.set(at("2026-03-03T20:30:00Z"));

        let (report, updated) = tokio::join!(manager.rearm_all(), async {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            manager.update(edited).await
        });
        assert_eq!(updated, Ok(id));
        assert_eq!(must(report).armed, 1);

        let rule = must_some(must(manager.get(id).await));
        assert_eq!(rule.times_of_day.to_compact(), "21:00");
        assert_eq!(rule.next_trigger_at, Some(at("2026-03-03T21:00:00Z")));
        assert_eq!(
            alarms.registration(id).map(|registration| registration.trigger_at),
            Some(at("2026-03-03T21:00:00Z"))
        );
    }

    #[tokio::test]
    async fn id_locks_are_released_after_each_operation() {
        let h = harness();
        let id = must(h.manager.create(daily_input("20:00")).await);

        must(h.manager.disable(ScheduleId(777)).await);
        must(h.manager.snooze(id).await);
        must(h.manager.advance(id).await);
        assert_eq!(
            h.manager.enable(ScheduleId(778)).await,
            Err(ScheduleError::NotFound(ScheduleId(778)))
        );
        must(h.manager.rearm_all().await);
        assert_eq!(h.manager.locks.tracked(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_keeps_id_locked_until_job_finishes() {
        let store = Arc::new(SlowStore::new(
            StdDuration::ZERO,
            StdDuration::from_millis(200),
        ));
        let alarms = Arc::new(RecordingAlarmPort::new());
        let clock = Arc::new(FixedClock::new(at("2026-03-03T08:30:00Z")));
        let manager = slow_manager(&store, &alarms, &clock);

        let id = must(manager.create(daily_input("20:00")).await);
        let rule = must_some(must(manager.get(id).await));
        store.peak.store(0, Ordering::SeqCst);

        let abandoned =
            tokio::time::timeout(StdDuration::from_millis(20), manager.disable(id)).await;
        assert!(abandoned.is_err());

        assert_eq!(manager.update(rule).await, Ok(id));
        assert_eq!(store.peak.load(Ordering::SeqCst), 1);
        assert!(must_some(must(manager.get(id).await)).enabled);
    }

    #[tokio::test]
    async fn list_for_medication_is_newest_first() {
        let h = harness();
        let input = daily_input("08:00");
        let first = must(h.manager.create(input.clone()).await);
        h.clock.advance(Duration::minutes(1));
        let second = must(h.manager.create(input.clone()).await);

        let ids: Vec<ScheduleId> = must(h.manager.list_for_medication(input.medication_id).await)
            .iter()
            .map(|rule| rule.id)
            .collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(runtime) => runtime,
            Err(err) => panic!("failed to build runtime: {err}"),
        };
        let mut config = SchedulerConfig::v1();
        config.snooze_minutes = 0;
        let result = ScheduleManager::new(
            Arc::new(InMemoryScheduleStore::new()),
            Arc::new(RecordingAlarmPort::new()),
            Arc::new(FixedClock::new(at("2026-03-03T08:30:00Z"))),
            WorkerPool::new(runtime.handle().clone(), 1),
            config,
        );
        assert!(matches!(result, Err(ScheduleError::Configuration(_))));
    }
}
