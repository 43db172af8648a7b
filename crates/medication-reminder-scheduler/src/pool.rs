use std::sync::Arc;

use medication_reminder_core::ScheduleError;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

/// Bounded executor for blocking lifecycle jobs.
///
/// Jobs run on the runtime's blocking threads; at most `max_in_flight` of them
/// run at once. Cloning shares the same bound.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(handle: Handle, max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Builds a pool on the runtime the caller is running in.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Worker`] outside a tokio runtime.
    pub fn current(max_in_flight: usize) -> Result<Self, ScheduleError> {
        let handle = Handle::try_current()
            .map_err(|err| ScheduleError::Worker(format!("no tokio runtime available: {err}")))?;
        Ok(Self::new(handle, max_in_flight))
    }

    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stops accepting jobs. Jobs already running finish normally.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.permits.is_closed()
    }

    /// Runs `job` once a slot is free and returns its result.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Shutdown`] after [`WorkerPool::shutdown`],
    /// [`ScheduleError::Worker`] when the job panics, or the job's own error.
    pub async fn run<F, T>(&self, job: F) -> Result<T, ScheduleError>
    where
        F: FnOnce() -> Result<T, ScheduleError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ScheduleError::Shutdown)?;

        let joined = self
            .handle
            .spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await;

        match joined {
            Ok(result) => result,
            Err(err) => Err(ScheduleError::Worker(format!(
                "lifecycle job did not complete: {err}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    fn must_pool(max_in_flight: usize) -> WorkerPool {
        match WorkerPool::current(max_in_flight) {
            Ok(pool) => pool,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[tokio::test]
    async fn runs_job_and_returns_its_result() {
        let pool = must_pool(2);
        assert_eq!(pool.run(|| Ok(21 * 2)).await, Ok(42));

        let failed: Result<(), ScheduleError> = pool
            .run(|| Err(ScheduleError::Validation("bad input".to_string())))
            .await;
        assert_eq!(
            failed,
            Err(ScheduleError::Validation("bad input".to_string()))
        );
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn zero_bound_is_raised_to_one() {
        let pool = must_pool(0);
        assert_eq!(pool.max_in_flight(), 1);
        assert_eq!(pool.run(|| Ok("ran")).await, Ok("ran"));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_jobs() {
        let pool = must_pool(4);
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.run(|| Ok(())).await, Err(ScheduleError::Shutdown));
    }

    #[tokio::test]
    async fn panicking_job_surfaces_as_worker_error() {
        let pool = must_pool(1);
        let result: Result<(), ScheduleError> = pool.run(|| panic!("job exploded")).await;
        assert!(matches!(result, Err(ScheduleError::Worker(_))));
        assert_eq!(pool.run(|| Ok(7)).await, Ok(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_jobs_never_exceed_bound() {
        let pool = must_pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut jobs = JoinSet::new();

        for _ in 0..8 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            jobs.spawn(async move {
                pool.run(move || {
                    let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_running, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(result) => assert_eq!(result, Ok(())),
                Err(err) => panic!("job task failed: {err}"),
            }
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }
}
