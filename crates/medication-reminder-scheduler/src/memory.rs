use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use medication_reminder_core::{
    MedicationId, ScheduleId, ScheduleRule, ScheduleRuleInput, ScheduleStore,
};
use time::OffsetDateTime;

/// Volatile [`ScheduleStore`] for embedding and tests.
///
/// `set_unavailable(true)` makes every call fail without touching state, which
/// stands in for a broken database.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_id: i64,
    rules: BTreeMap<ScheduleId, ScheduleRule>,
}

impl InMemoryScheduleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map_or(0, |state| state.rules.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("in-memory schedule store is unavailable"));
        }
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory schedule store mutex poisoned"))
    }
}

impl ScheduleStore for InMemoryScheduleStore {
    fn insert(
        &self,
        input: &ScheduleRuleInput,
        next_trigger_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> Result<ScheduleRule> {
        let mut state = self.lock()?;
        state.last_id += 1;
        let rule = ScheduleRule {
            id: ScheduleId(state.last_id),
            medication_id: input.medication_id,
            cycle: input.cycle,
            times_of_day: input.times_of_day.clone(),
            next_trigger_at,
            enabled: input.enabled,
            created_at: now,
            updated_at: now,
        };
        state.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    fn update(&self, rule: &ScheduleRule) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(existing) = state.rules.get_mut(&rule.id) else {
            return Ok(false);
        };
        let created_at = existing.created_at;
        *existing = rule.clone();
        existing.created_at = created_at;
        Ok(true)
    }

    fn get(&self, id: ScheduleId) -> Result<Option<ScheduleRule>> {
        Ok(self.lock()?.rules.get(&id).cloned())
    }

    fn delete(&self, id: ScheduleId) -> Result<bool> {
        Ok(self.lock()?.rules.remove(&id).is_some())
    }

    fn list_for_medication(&self, medication_id: MedicationId) -> Result<Vec<ScheduleRule>> {
        let state = self.lock()?;
        let mut rules: Vec<ScheduleRule> = state
            .rules
            .values()
            .filter(|rule| rule.medication_id == medication_id)
            .cloned()
            .collect();
        rules.sort_by(|lhs, rhs| {
            rhs.created_at
                .cmp(&lhs.created_at)
                .then_with(|| rhs.id.cmp(&lhs.id))
        });
        Ok(rules)
    }

    fn list_enabled(&self) -> Result<Vec<ScheduleRule>> {
        let state = self.lock()?;
        let mut rules: Vec<ScheduleRule> = state
            .rules
            .values()
            .filter(|rule| rule.enabled)
            .cloned()
            .collect();
        rules.sort_by_key(|rule| (rule.next_trigger_at.is_none(), rule.next_trigger_at, rule.id));
        Ok(rules)
    }

    fn set_next_trigger(
        &self,
        id: ScheduleId,
        next_trigger_at: Option<OffsetDateTime>,
        updated_at: OffsetDateTime,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(rule) = state.rules.get_mut(&id) else {
            return Ok(false);
        };
        rule.next_trigger_at = next_trigger_at;
        rule.updated_at = updated_at;
        Ok(true)
    }

    fn set_enabled(&self, id: ScheduleId, enabled: bool, updated_at: OffsetDateTime) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(rule) = state.rules.get_mut(&id) else {
            return Ok(false);
        };
        rule.enabled = enabled;
        if !enabled {
            rule.next_trigger_at = None;
        }
        rule.updated_at = updated_at;
        Ok(true)
    }
}
