use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::configuration::{Configuration, Operation, OperationContext};

// Rate limits operations by issuing timestamps indicating when the next
// operation should happen. Uses atomics, can be shared between threads.
struct RateLimiter {
    base: Instant,
    increment_nanos: u64,
    nanos_counter: AtomicU64,
}

impl RateLimiter {
    pub fn new(base: Instant, ops_per_second: f64) -> Self {
        let increment_nanos = (1_000_000_000f64 / ops_per_second) as u64;
        Self {
            base,
            increment_nanos,
            nanos_counter: AtomicU64::new(0),
        }
    }

    pub fn issue_next_start_time(&self) -> Instant {
        let nanos = self
            .nanos_counter
            .fetch_add(self.increment_nanos, Ordering::Relaxed);

        self.base + Duration::from_nanos(nanos)
    }
}

// When an operation ID equal or larger to this value is issued, no more
// operations are admitted. `ask_to_stop` sets the operation counter to this
// value. It is large enough to be unreachable and small enough so that
// issue attempts after `ask_to_stop` do not overflow the counter.
const INVALID_OP_ID_THRESHOLD: u64 = 1u64 << 63u64;

// State shared between the admitting loop and all operation tasks.
struct WorkerContext {
    operation_counter: AtomicU64,
    max_operations: u64,
    operation: Arc<dyn Operation>,

    // One permit per operation allowed in flight. Closed when the run stops,
    // which wakes up the admitting loop if it waits for a slot.
    slots: Arc<Semaphore>,

    rate_limiter: Option<RateLimiter>,

    max_errors: u64,
    error_count: AtomicU64,
    failure: Mutex<Option<anyhow::Error>>,
}

impl WorkerContext {
    pub fn new(config: &Configuration, slots: usize, now: Instant) -> Self {
        Self {
            operation_counter: AtomicU64::new(0),
            max_operations: config.max_operations.unwrap_or(u64::MAX),
            operation: Arc::clone(&config.operation),

            slots: Arc::new(Semaphore::new(slots)),

            rate_limiter: config
                .rate_limit_per_second
                .map(|rate| RateLimiter::new(now, rate)),

            max_errors: config.max_errors,
            error_count: AtomicU64::new(0),
            failure: Mutex::new(None),
        }
    }

    // Prevents more operations from being issued or started
    pub fn ask_to_stop(&self) {
        self.operation_counter
            .store(INVALID_OP_ID_THRESHOLD, Ordering::Relaxed);
        self.slots.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.operation_counter.load(Ordering::Relaxed) >= INVALID_OP_ID_THRESHOLD
    }

    // Issues the next operation id. If the run was asked to stop or
    // the operation budget is used up, it will return `None`.
    fn issue_operation_id(&self) -> Option<u64> {
        let id = self.operation_counter.fetch_add(1, Ordering::Relaxed);
        (id < INVALID_OP_ID_THRESHOLD && id < self.max_operations).then_some(id)
    }

    // Waits for a free slot. Returns `None` once the run is stopped.
    async fn admit(&self) -> Option<(u64, OwnedSemaphorePermit)> {
        if self.is_stopped() {
            return None;
        }
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;
        let op_id = self.issue_operation_id()?;
        Some((op_id, permit))
    }

    // Runs a single operation. The slot is held by `_permit` and is given
    // back when this function returns, whatever the outcome.
    async fn run_operation(&self, operation_id: u64, _permit: OwnedSemaphorePermit) {
        if self.is_stopped() {
            return;
        }

        let scheduled_start_time = match &self.rate_limiter {
            Some(rate_limiter) => {
                let start_time = rate_limiter.issue_next_start_time();
                tokio::time::sleep_until(start_time).await;
                if self.is_stopped() {
                    return;
                }
                start_time
            }
            None => Instant::now(),
        };

        let ctx = OperationContext {
            operation_id,
            scheduled_start_time,
            actual_start_time: Instant::now(),
        };

        // TODO: Allow specifying a strategy for retrying in case of error
        match self.operation.execute(&ctx).await {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => self.ask_to_stop(),
            Err(err) => self.report_failure(err),
        }
    }

    fn report_failure(&self, err: anyhow::Error) {
        let errors = self.error_count.fetch_add(1, Ordering::Relaxed) + 1;
        if errors <= self.max_errors {
            tracing::debug!(error = %err, errors, "tolerating failed operation");
            return;
        }

        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.ask_to_stop();
    }

    fn report_join_error(&self, err: JoinError) {
        // Cancelled tasks are only the result of an abort
        if err.is_panic() {
            self.report_failure(anyhow::anyhow!("operation task panicked: {}", err));
        }
    }

    fn take_result(&self) -> Result<()> {
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Allows to stop a run started with [`run`] from the outside.
pub struct RunController {
    ctx: Arc<WorkerContext>,
    abort: Arc<Notify>,
}

impl RunController {
    /// Stops admitting new operations. In-flight operations are allowed
    /// to finish and the run completes afterwards.
    pub fn ask_to_stop(&self) {
        self.ctx.ask_to_stop();
    }

    /// Stops the run immediately, cancelling in-flight operations.
    pub fn abort(&self) {
        self.ctx.ask_to_stop();
        self.abort.notify_one();
    }
}

/// Starts a run described by the configuration.
///
/// Returns a controller and a future which drives the run; nothing happens
/// until the future is polled. The future resolves when the run is finished,
/// yielding the error which stopped it, if any.
pub fn run(config: Configuration) -> (RunController, impl Future<Output = Result<()>>) {
    let start_time = Instant::now();
    let slots = usize::try_from(config.concurrency)
        .unwrap_or(Semaphore::MAX_PERMITS)
        .min(Semaphore::MAX_PERMITS);
    let ctx = Arc::new(WorkerContext::new(&config, slots, start_time));
    let abort = Arc::new(Notify::new());

    let controller = RunController {
        ctx: Arc::clone(&ctx),
        abort: Arc::clone(&abort),
    };

    let fut = async move {
        anyhow::ensure!(config.concurrency > 0, "concurrency must not be zero");

        // If there is a time limit, spawn a task which will ask_to_stop
        // after the run period has elapsed
        let stopper = config.max_duration.map(|duration| {
            let ctx = Arc::clone(&ctx);
            tokio::task::spawn(async move {
                tokio::time::sleep_until(start_time + duration).await;
                ctx.ask_to_stop();
            })
        });

        let result = drive(&ctx, &abort).await;

        if let Some(stopper) = stopper {
            stopper.abort();
        }
        result
    };

    (controller, fut)
}

async fn drive(ctx: &Arc<WorkerContext>, abort: &Notify) -> Result<()> {
    let mut in_flight = JoinSet::new();

    loop {
        // Reap finished tasks so that the set does not grow without bound
        while let Some(res) = in_flight.try_join_next() {
            if let Err(err) = res {
                ctx.report_join_error(err);
            }
        }

        let admitted = tokio::select! {
            admitted = ctx.admit() => Some(admitted),
            _ = abort.notified() => None,
        };
        let (op_id, permit) = match admitted {
            Some(Some(admitted)) => admitted,
            Some(None) => break,
            None => return aborted(in_flight).await,
        };

        let ctx = Arc::clone(ctx);
        in_flight.spawn(async move { ctx.run_operation(op_id, permit).await });
    }

    // Drain the operations which are still running
    loop {
        let joined = tokio::select! {
            res = in_flight.join_next() => Some(res),
            _ = abort.notified() => None,
        };
        match joined {
            Some(Some(Ok(()))) => {}
            Some(Some(Err(err))) => ctx.report_join_error(err),
            Some(None) => break,
            None => return aborted(in_flight).await,
        }
    }

    ctx.take_result()
}

async fn aborted(mut in_flight: JoinSet<()>) -> Result<()> {
    in_flight.shutdown().await;
    Err(anyhow::anyhow!("The run was aborted"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;
    use crate::configuration::{Configuration, Operation, OperationContext};

    #[test]
    fn test_rate_limiter() {
        let count_in_period = |ops: f64, period: Duration| -> usize {
            let start = Instant::now();
            let end = start + period;
            let limiter = RateLimiter::new(start, ops);

            let mut count = 0;
            while limiter.issue_next_start_time() < end {
                count += 1;
            }
            count
        };

        let sec = Duration::from_secs(1);

        assert_eq!(count_in_period(1.0, 10 * sec), 10);
        assert_eq!(count_in_period(0.5, 10 * sec), 5);
        assert_eq!(count_in_period(0.1, 10 * sec), 1);
        assert_eq!(count_in_period(2.0, 10 * sec), 20);
    }

    fn make_test_cfg(op: impl Operation + 'static) -> Configuration {
        Configuration {
            max_duration: None,
            max_operations: None,
            concurrency: 10,
            rate_limit_per_second: None,
            max_errors: 0,
            operation: Arc::new(op),
        }
    }

    async fn run_to_end(cfg: Configuration) -> Result<()> {
        let (_ctrl, fut) = run(cfg);
        tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("the run did not finish in time")
    }

    // Tracks how many executions overlap in time.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl InFlight {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct SleepingOp {
        in_flight: Arc<InFlight>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Operation for SleepingOp {
        async fn execute(&self, _ctx: &OperationContext) -> Result<ControlFlow<()>> {
            self.in_flight.enter();
            tokio::time::sleep(self.delay).await;
            self.in_flight.leave();
            if self.fail {
                return Err(anyhow::anyhow!("failure"));
            }
            Ok(ControlFlow::Continue(()))
        }
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let counter = Arc::new(AtomicU64::new(0));

        struct Op(Arc<AtomicU64>);

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
                self.0.fetch_add(ctx.operation_id, Ordering::SeqCst);
                Ok(ControlFlow::Continue(()))
            }
        }

        let mut cfg = make_test_cfg(Op(counter.clone()));
        cfg.max_operations = Some(1000);

        run_to_end(cfg).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 499500);
    }

    #[tokio::test]
    async fn test_run_to_break() {
        let counter = Arc::new(AtomicU64::new(0));

        struct Op(Arc<AtomicU64>);

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
                if ctx.operation_id >= 100 {
                    return Ok(ControlFlow::Break(()));
                }
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(ControlFlow::Continue(()))
            }
        }

        run_to_end(make_test_cfg(Op(counter.clone()))).await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 90);
    }

    #[tokio::test]
    async fn test_run_to_error() {
        let counter = Arc::new(AtomicU64::new(0));
        let calls_after_failure = Arc::new(AtomicU64::new(0));

        struct Op {
            counter: Arc<AtomicU64>,
            failed: AtomicBool,
            calls_after_failure: Arc<AtomicU64>,
        }

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
                if self.failed.load(Ordering::SeqCst) {
                    self.calls_after_failure.fetch_add(1, Ordering::SeqCst);
                }
                if ctx.operation_id == 500 {
                    self.failed.store(true, Ordering::SeqCst);
                    return Err(anyhow::anyhow!("failure at {}", ctx.operation_id));
                }
                self.counter.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Ok(ControlFlow::Continue(()))
            }
        }

        let cfg = make_test_cfg(Op {
            counter: counter.clone(),
            failed: AtomicBool::new(false),
            calls_after_failure: calls_after_failure.clone(),
        });

        let err = run_to_end(cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "failure at 500");

        // Operations admitted before the failure may still be running,
        // but there are never more of them than the pool allows
        assert!(counter.load(Ordering::SeqCst) >= 490);
        assert!(calls_after_failure.load(Ordering::SeqCst) < 10);
    }

    #[tokio::test]
    async fn test_first_error_is_returned() {
        struct Op;

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
                // Later failures must not replace the one which stopped the run
                tokio::time::sleep(Duration::from_millis(ctx.operation_id * 5)).await;
                Err(anyhow::anyhow!("failure {}", ctx.operation_id))
            }
        }

        let mut cfg = make_test_cfg(Op);
        cfg.concurrency = 4;

        let err = run_to_end(cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "failure 0");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(InFlight::default());
        let mut cfg = make_test_cfg(SleepingOp {
            in_flight: Arc::clone(&in_flight),
            delay: Duration::from_millis(2),
            fail: false,
        });
        cfg.concurrency = 4;
        cfg.max_operations = Some(200);

        run_to_end(cfg).await.unwrap();
        assert_eq!(in_flight.finished.load(Ordering::SeqCst), 200);
        assert!(in_flight.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(in_flight.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_operations_do_not_leak_slots() {
        let in_flight = Arc::new(InFlight::default());
        let mut cfg = make_test_cfg(SleepingOp {
            in_flight: Arc::clone(&in_flight),
            delay: Duration::from_millis(5),
            fail: true,
        });
        cfg.concurrency = 3;
        cfg.max_errors = u64::MAX;
        cfg.max_duration = Some(Duration::from_millis(200));

        run_to_end(cfg).await.unwrap();

        // Every operation failed, yet the pool kept being refilled
        assert_eq!(in_flight.peak.load(Ordering::SeqCst), 3);
        assert!(in_flight.finished.load(Ordering::SeqCst) > 3 * 3);
    }

    #[tokio::test]
    async fn test_tolerated_errors() {
        struct Op;

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
                if ctx.operation_id % 10 == 0 {
                    return Err(anyhow::anyhow!("failure {}", ctx.operation_id));
                }
                Ok(ControlFlow::Continue(()))
            }
        }

        let mut cfg = make_test_cfg(Op);
        cfg.concurrency = 1;
        cfg.max_operations = Some(100);
        cfg.max_errors = 10;
        run_to_end(cfg).await.unwrap();

        let mut cfg = make_test_cfg(Op);
        cfg.concurrency = 1;
        cfg.max_operations = Some(100);
        cfg.max_errors = 3;
        let err = run_to_end(cfg).await.unwrap_err();
        assert_eq!(err.to_string(), "failure 30");
    }

    #[tokio::test]
    async fn test_run_to_max_duration() {
        // We can't reliably check the number of `execute` invocations
        // because they are racing with the max duration period.
        // We just check that `run` stops at all.

        struct Op;

        #[async_trait]
        impl Operation for Op {
            async fn execute(&self, _ctx: &OperationContext) -> Result<ControlFlow<()>> {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(ControlFlow::Continue(()))
            }
        }

        let mut cfg = make_test_cfg(Op);
        cfg.max_duration = Some(Duration::from_millis(100));

        run_to_end(cfg).await.unwrap();
    }

    #[tokio::test]
    async fn test_ask_to_stop_and_abort() {
        let in_flight = Arc::new(InFlight::default());
        let cfg = make_test_cfg(SleepingOp {
            in_flight: Arc::clone(&in_flight),
            delay: Duration::from_millis(5),
            fail: false,
        });

        let (ctrl, fut) = run(cfg);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.ask_to_stop();
        handle.await.unwrap().unwrap();
        assert_eq!(in_flight.current.load(Ordering::SeqCst), 0);

        let cfg = make_test_cfg(SleepingOp {
            in_flight: Arc::new(InFlight::default()),
            delay: Duration::from_secs(3600),
            fail: false,
        });
        let (ctrl, fut) = run(cfg);
        let handle = tokio::spawn(fut);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctrl.abort();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let mut cfg = make_test_cfg(SleepingOp {
            in_flight: Arc::new(InFlight::default()),
            delay: Duration::ZERO,
            fail: false,
        });
        cfg.concurrency = 0;
        assert!(run_to_end(cfg).await.is_err());
    }
}
