use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use medication_reminder_core::{
    AlarmError, AlarmFired, AlarmPort, AlarmRegistration, Clock, ScheduleId,
};
use time::OffsetDateTime;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

// ── Timer-backed port ─────────────────────────────────────────

/// In-process alarm port: one `tokio` sleep task per armed schedule.
///
/// Fired alarms are delivered on the channel returned by [`TimerAlarmPort::new`].
/// Re-arming an id aborts its previous task; a generation counter keeps a
/// timer that already woke up from delivering after it was replaced.
pub struct TimerAlarmPort {
    handle: Handle,
    clock: Arc<dyn Clock>,
    fired: mpsc::UnboundedSender<AlarmFired>,
    pending: Arc<Mutex<HashMap<ScheduleId, PendingTimer>>>,
    generation: AtomicU64,
}

struct PendingTimer {
    generation: u64,
    trigger_at: OffsetDateTime,
    task: AbortHandle,
}

impl TimerAlarmPort {
    #[must_use]
    pub fn new(
        handle: Handle,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<AlarmFired>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        let port = Self {
            handle,
            clock,
            fired,
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        };
        (port, receiver)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    #[must_use]
    pub fn pending_trigger(&self, schedule_id: ScheduleId) -> Option<OffsetDateTime> {
        lock_pending(&self.pending)
            .get(&schedule_id)
            .map(|timer| timer.trigger_at)
    }
}

impl AlarmPort for TimerAlarmPort {
    fn arm(&self, registration: &AlarmRegistration) -> Result<(), AlarmError> {
        if self.fired.is_closed() {
            return Err(AlarmError::Unavailable(
                "alarm receiver has been dropped".to_string(),
            ));
        }

        let remaining = registration.trigger_at - self.clock.now();
        let delay = std::time::Duration::try_from(remaining).unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let schedule_id = registration.schedule_id;
        let payload = AlarmFired {
            schedule_id,
            medication_id: registration.medication_id,
        };

        let mut pending = lock_pending(&self.pending);
        let sender = self.fired.clone();
        let timers = Arc::clone(&self.pending);
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut timers = lock_pending(&timers);
                let current = timers
                    .get(&schedule_id)
                    .is_some_and(|timer| timer.generation == generation);
                if current {
                    timers.remove(&schedule_id);
                }
                current
            };
            if current && sender.send(payload).is_err() {
                debug!(schedule_id = %schedule_id, "alarm fired with no receiver");
            }
        });

        let replaced = pending.insert(
            schedule_id,
            PendingTimer {
                generation,
                trigger_at: registration.trigger_at,
                task: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            previous.task.abort();
        }

        debug!(
            schedule_id = %schedule_id,
            trigger_at = %registration.trigger_at,
            delay = ?delay,
            "timer armed"
        );
        Ok(())
    }

    fn cancel(&self, schedule_id: ScheduleId) -> Result<(), AlarmError> {
        if let Some(timer) = lock_pending(&self.pending).remove(&schedule_id) {
            timer.task.abort();
            debug!(schedule_id = %schedule_id, "timer cancelled");
        }
        Ok(())
    }
}

impl Drop for TimerAlarmPort {
    fn drop(&mut self) {
        for (_, timer) in lock_pending(&self.pending).drain() {
            timer.task.abort();
        }
    }
}

fn lock_pending(
    pending: &Mutex<HashMap<ScheduleId, PendingTimer>>,
) -> MutexGuard<'_, HashMap<ScheduleId, PendingTimer>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Recording fake ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlarmCall {
    Arm(AlarmRegistration),
    Cancel(ScheduleId),
}

/// Alarm port that records every call and the resulting registrations.
#[derive(Debug, Default)]
pub struct RecordingAlarmPort {
    state: Mutex<RecordingState>,
    deny_arm: AtomicBool,
}

#[derive(Debug, Default)]
struct RecordingState {
    calls: Vec<AlarmCall>,
    registrations: BTreeMap<ScheduleId, AlarmRegistration>,
}

impl RecordingAlarmPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A port whose `arm` calls fail with [`AlarmError::Denied`].
    #[must_use]
    pub fn denying() -> Self {
        let port = Self::default();
        port.set_denying(true);
        port
    }

    pub fn set_denying(&self, deny: bool) {
        self.deny_arm.store(deny, Ordering::SeqCst);
    }

    #[must_use]
    pub fn calls(&self) -> Vec<AlarmCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Current registrations, ordered by schedule id.
    #[must_use]
    pub fn registrations(&self) -> Vec<AlarmRegistration> {
        self.lock().registrations.values().copied().collect()
    }

    #[must_use]
    pub fn registration(&self, schedule_id: ScheduleId) -> Option<AlarmRegistration> {
        self.lock().registrations.get(&schedule_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AlarmPort for RecordingAlarmPort {
    fn arm(&self, registration: &AlarmRegistration) -> Result<(), AlarmError> {
        let mut state = self.lock();
        state.calls.push(AlarmCall::Arm(*registration));
        if self.deny_arm.load(Ordering::SeqCst) {
            return Err(AlarmError::Denied(
                "exact alarms are not permitted".to_string(),
            ));
        }
        state
            .registrations
            .insert(registration.schedule_id, *registration);
        Ok(())
    }

    fn cancel(&self, schedule_id: ScheduleId) -> Result<(), AlarmError> {
        let mut state = self.lock();
        state.calls.push(AlarmCall::Cancel(schedule_id));
        state.registrations.remove(&schedule_id);
        Ok(())
    }
}
