use std::future::Future;
use std::sync::Arc;

use log::debug;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs tasks with at most `limit` of them in flight. All tasks share one
/// child token of the parent; the first failing task cancels it so the others
/// stop at their next cancellation point.
pub struct TaskGroup<E> {
    tasks: JoinSet<Result<(), E>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl<E: Send + 'static> TaskGroup<E> {
    pub fn new(parent: &CancellationToken, limit: usize) -> Self {
        TaskGroup {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(limit.max(1))),
            cancel: parent.child_token(),
        }
    }

    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let res = task(cancel.clone()).await;
            // cancel before the permit goes to the next task
            if res.is_err() {
                cancel.cancel();
            }
            res
        });
    }

    /// Joins every task and returns the error of the first one that failed.
    /// A panicking task is re-raised here.
    pub async fn wait(mut self) -> Result<(), E> {
        let mut first = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.cancel.cancel();
                    if first.is_none() {
                        first = Some(e);
                    } else {
                        debug!("dropping follow-up task error");
                    }
                }
                Err(e) if e.is_panic() => {
                    self.cancel.cancel();
                    std::panic::resume_unwind(e.into_panic());
                }
                Err(e) => debug!("task aborted: {}", e),
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn limit_one_serializes_tasks() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut group: TaskGroup<String> = TaskGroup::new(&CancellationToken::new(), 1);

        for _ in 0..4 {
            let (running, peak) = (running.clone(), peak.clone());
            group.spawn(move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        group.wait().await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_error_cancels_the_rest() {
        let mut group: TaskGroup<String> = TaskGroup::new(&CancellationToken::new(), 1);
        group.spawn(|_| async { Err("boom".to_string()) });
        for _ in 0..3 {
            group.spawn(|token| async move {
                if token.is_cancelled() {
                    return Err("cancelled".to_string());
                }
                Ok(())
            });
        }

        assert_eq!(group.wait().await.unwrap_err(), "boom");
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_tasks() {
        let parent = CancellationToken::new();
        let mut group: TaskGroup<String> = TaskGroup::new(&parent, 2);
        group.spawn(|token| async move {
            token.cancelled().await;
            Err("stopped".to_string())
        });
        parent.cancel();

        assert_eq!(group.wait().await.unwrap_err(), "stopped");
    }
}
