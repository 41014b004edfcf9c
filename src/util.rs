//! Concurrency primitives shared by every long-lived loop
//!
//! Three building blocks: a repeat-forever driver gated by a run flag, a
//! single-flight guard that coalesces concurrent reconnect attempts, and a
//! poll-until-truthy helper with a fixed backoff. Together they define the
//! liveness and cancellation behavior of the transport and client loops.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared advisory run flag.
///
/// Clearing the flag is cooperative: loops observe it at their next
/// iteration boundary, in-flight I/O is not aborted.
#[derive(Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Request shutdown. Takes effect within one loop iteration.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive `step` repeatedly while `flag` is set, yielding to the scheduler
/// once between iterations so sibling loops get serviced.
pub async fn run_loop<F, Fut>(flag: &RunFlag, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    while flag.is_set() {
        step().await;
        tokio::task::yield_now().await;
    }
}

/// Repeatedly await `probe` until it yields a value, sleeping `interval`
/// between attempts. Returns `None` when the flag clears first.
pub async fn poll_until<T, F, Fut>(flag: &RunFlag, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    while flag.is_set() {
        if let Some(value) = probe().await {
            return Some(value);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Coalesces concurrent callers of an idempotent setup operation.
///
/// The first caller runs the closure; callers arriving while it is in
/// flight wait for it to finish and return without re-running the body.
/// The first caller's side effect is authoritative.
pub struct SingleFlight {
    busy: AtomicBool,
    done: Notify,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            done: Notify::new(),
        }
    }

    /// Run `op` unless another caller is already inside; in that case wait
    /// until that caller finishes and return immediately.
    pub async fn run<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            op().await;
            self.busy.store(false, Ordering::Release);
            self.done.notify_waiters();
        } else {
            loop {
                // Register interest before re-checking the flag so a wakeup
                // between the check and the await cannot be lost.
                let notified = self.done.notified();
                if !self.busy.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
        }
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn run_loop_stops_on_cleared_flag() {
        let flag = RunFlag::new();
        let count = AtomicUsize::new(0);
        let f = flag.clone();
        run_loop(&flag, || {
            let n = count.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                f.clear();
            }
            async {}
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_returns_first_value() {
        let flag = RunFlag::new();
        let attempts = AtomicUsize::new(0);
        let value = poll_until(&flag, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { (n == 2).then_some(n) }
        })
        .await;
        assert_eq!(value, Some(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_aborts_when_flag_clears() {
        let flag = RunFlag::new();
        flag.clear();
        let value: Option<()> = poll_until(&flag, Duration::from_millis(1), || async { None }).await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn single_flight_runs_body_once() {
        let guard = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let guard = Arc::clone(&guard);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                guard
                    .run(|| async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // All four callers overlap within the 50ms body; one execution wins.
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_allows_sequential_reruns() {
        let guard = SingleFlight::new();
        let executions = AtomicUsize::new(0);
        for _ in 0..2 {
            guard
                .run(|| async {
                    executions.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
