use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one running background poll loop.
#[derive(Default)]
pub struct PollMonitor {
    task: Mutex<Option<MonitorTask>>,
}

impl PollMonitor {
    /// Spawns the loop built by `make_loop` unless one is already running.
    /// Returns whether a new loop was started.
    pub fn start<F, Fut>(&self, make_loop: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            return false;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(make_loop(token.clone()));
        *task = Some(MonitorTask { token, handle });
        true
    }

    /// Signals the loop to stop. An in-flight request still completes; await
    /// the returned handle to wait for it.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let mut task = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        task.take().map(|running| {
            running.token.cancel();
            running.handle
        })
    }

    pub fn is_running(&self) -> bool {
        match self.task.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|running| !running.handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|running| !running.handle.is_finished()),
        }
    }
}

impl Drop for PollMonitor {
    fn drop(&mut self) {
        // Detach: the loop sees the cancelled token and exits on its own.
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::PollMonitor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn second_start_is_a_no_op_while_running() {
        let monitor = PollMonitor::default();
        let starts = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let starts = starts.clone();
            monitor.start(|token| async move {
                starts.fetch_add(1, Ordering::SeqCst);
                token.cancelled().await;
            });
        }
        tokio::task::yield_now().await;
        assert!(monitor.is_running());
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let handle = monitor.stop().expect("running loop");
        handle.await.expect("loop exits on cancel");
        assert!(!monitor.is_running());
        assert!(monitor.stop().is_none());
    }

    #[tokio::test]
    async fn restarts_after_the_loop_finished() {
        let monitor = PollMonitor::default();
        assert!(monitor.start(|_| async {}));
        while monitor.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(monitor.start(|token| async move { token.cancelled().await }));
        assert!(monitor.stop().is_some());
    }
}
