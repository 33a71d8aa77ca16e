//! A background task of which at most one instance runs at a time.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ServiceError;

pub type TaskResult<T> = Result<T, ServiceError>;

/// What `start` does when an instance is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Cancel the running instance and start a fresh one.
    CancelRestart,
    /// Refuse with `ServiceError::AlreadyRunning`.
    RejectWhileRunning,
}

struct Instance<T> {
    token: CancellationToken,
    handle: JoinHandle<()>,
    result: watch::Receiver<Option<TaskResult<T>>>,
}

pub struct SingleInstanceTask<T> {
    name: &'static str,
    policy: RestartPolicy,
    current: Mutex<Option<Instance<T>>>,
}

impl<T> SingleInstanceTask<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, policy: RestartPolicy) -> Self {
        Self {
            name,
            policy,
            current: Mutex::new(None),
        }
    }

    fn lock_current(&self) -> TaskResult<MutexGuard<'_, Option<Instance<T>>>> {
        self.current
            .lock()
            .map_err(|_| ServiceError::LockPoisoned(self.name))
    }

    /// Spawn a new instance. `make` receives the instance's token; the
    /// future is also dropped at its next await point once the token is
    /// cancelled.
    pub fn start<F, Fut>(&self, make: F) -> TaskResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let mut current = self.lock_current()?;
        if let Some(running) = current.as_ref().filter(|i| !i.handle.is_finished()) {
            match self.policy {
                RestartPolicy::RejectWhileRunning => return Err(ServiceError::AlreadyRunning),
                RestartPolicy::CancelRestart => {
                    debug!(task = self.name, "cancelling running instance before restart");
                    running.token.cancel();
                }
            }
        }
        // the new instance only begins once the old one has wound down
        let previous = current.take().map(|instance| instance.handle);

        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let work = make(token.clone());
        let cancelled = token.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let run = async move {
                if let Some(previous) = previous {
                    if let Err(err) = previous.await {
                        warn!(task = name, error = %err, "replaced instance did not finish cleanly");
                    }
                }
                work.await
            };
            let result = tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(ServiceError::Cancelled),
                result = run => result,
            };
            tx.send_replace(Some(result));
        });
        *current = Some(Instance {
            token,
            handle,
            result: rx,
        });
        Ok(())
    }

    /// Result of the most recently started instance. Waiters on an
    /// instance that gets replaced see `Cancelled`.
    pub async fn wait(&self) -> TaskResult<T> {
        let mut rx = match self.lock_current()?.as_ref() {
            Some(instance) => instance.result.clone(),
            None => return Err(ServiceError::NotStarted),
        };
        let outcome = rx.wait_for(Option::is_some).await.map(|value| (*value).clone());
        match outcome {
            Ok(Some(result)) => result,
            // sender dropped: the instance panicked or was aborted
            Ok(None) | Err(_) => Err(ServiceError::Cancelled),
        }
    }

    pub fn cancel(&self) -> TaskResult<()> {
        if let Some(instance) = self.lock_current()?.as_ref() {
            instance.token.cancel();
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_current()
            .map(|current| current.as_ref().is_some_and(|i| !i.handle.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{RestartPolicy, SingleInstanceTask, TaskResult};
    use crate::error::ServiceError;

    #[tokio::test]
    async fn wait_before_start_is_an_error() {
        let task = SingleInstanceTask::<u32>::new("idle", RestartPolicy::CancelRestart);
        assert_eq!(task.wait().await, Err(ServiceError::NotStarted));
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_reports_already_running() {
        let task = SingleInstanceTask::new("probe", RestartPolicy::RejectWhileRunning);
        task.start(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        })
        .expect("first start");
        assert!(task.is_running());
        let second = task.start(|_| async { Ok(2) });
        assert_eq!(second, Err(ServiceError::AlreadyRunning));
        assert_eq!(task.wait().await, Ok(1));
        task.start(|_| async { Ok(3) }).expect("restart once finished");
        assert_eq!(task.wait().await, Ok(3));
    }

    async fn explode() -> TaskResult<u32> {
        panic!("worker panicked")
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_a_panicked_instance_still_runs() {
        let task = SingleInstanceTask::new("crashy", RestartPolicy::CancelRestart);
        task.start(|_| explode()).expect("first start");
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!task.is_running());
        assert_eq!(task.wait().await, Err(ServiceError::Cancelled));

        task.start(|_| async { Ok(7) }).expect("restart");
        assert_eq!(task.wait().await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_restart_replaces_the_running_instance() {
        let task = std::sync::Arc::new(SingleInstanceTask::new(
            "probe-once",
            RestartPolicy::CancelRestart,
        ));
        task.start(|_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("first")
        })
        .expect("first start");
        let first_waiter = {
            let task = std::sync::Arc::clone(&task);
            tokio::spawn(async move { task.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        task.start(|_| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok("second")
        })
        .expect("restart");
        assert_eq!(task.wait().await, Ok("second"));
        assert_eq!(
            first_waiter.await.expect("waiter joins"),
            Err(ServiceError::Cancelled)
        );
    }

    #[tokio::test]
    async fn explicit_cancel() {
        let task = SingleInstanceTask::<()>::new("listener", RestartPolicy::CancelRestart);
        task.start(|token| async move {
            token.cancelled().await;
            Ok(())
        })
        .expect("start");
        task.cancel().expect("cancel");
        assert_eq!(task.wait().await, Err(ServiceError::Cancelled));
    }
}
