//! Worker pool runtime
//!
//! One [`Worker`] per named pool: a fixed set of long-lived execution
//! threads, each driving a stateful script handler. Dispatch is a blocking
//! handoff gated by a semaphore sized to the thread budget and bounded by
//! the configured max wait time; if no thread frees up in that window the
//! request is rejected with a timeout instead of queueing indefinitely.
//! Each pool also tracks consecutive execution failures and escalates to a
//! fatal report when the configured threshold is crossed.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{ServerHook, ThreadHook, WorkerSettings};
use crate::context::RequestContext;
use crate::metrics::Metrics;
use crate::runtime::FatalReporter;
use crate::types::{GatehouseError, Result};

/// A unit of work handed to an execution thread. Holding the semaphore
/// permit for the lifetime of the job is what makes one request occupy one
/// thread at a time.
struct Job {
    ctx: Arc<RequestContext>,
    _permit: OwnedSemaphorePermit,
}

/// Runtime handle for one named pool.
pub struct Worker {
    settings: Arc<WorkerSettings>,
    max_wait_time: Option<Duration>,
    slots: Arc<Semaphore>,
    job_tx: Mutex<Option<UnboundedSender<Job>>>,
    consecutive_failures: Arc<AtomicI64>,
    metrics: Arc<dyn Metrics>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Start the pool: spawn its execution threads, each building one script
    /// handler via the pool's factory.
    pub(crate) fn spawn(
        settings: Arc<WorkerSettings>,
        max_wait_time: Option<Duration>,
        metrics: Arc<dyn Metrics>,
        fatal: FatalReporter,
    ) -> Result<Arc<Self>> {
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let consecutive_failures = Arc::new(AtomicI64::new(0));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        info!(
            worker = %settings.name,
            threads = settings.num_threads,
            file = %settings.file.display(),
            "starting worker pool"
        );

        let mut threads = Vec::with_capacity(settings.num_threads);
        for index in 0..settings.num_threads {
            let settings = Arc::clone(&settings);
            let job_rx = Arc::clone(&job_rx);
            let failures = Arc::clone(&consecutive_failures);
            let metrics = Arc::clone(&metrics);
            let fatal = fatal.clone();
            let ready_tx = ready_tx.clone();

            let handle = std::thread::Builder::new()
                .name(format!("gatehouse-{}-{}", settings.name, index))
                .spawn(move || {
                    thread_main(index, settings, job_rx, failures, metrics, fatal, ready_tx)
                })
                .map_err(|e| {
                    GatehouseError::Internal(format!("failed to spawn worker thread: {e}"))
                })?;
            threads.push(handle);
        }
        drop(ready_tx);

        // Block until every thread has built its handler and announced
        // readiness, so callers see a fully available pool.
        for _ in 0..settings.num_threads {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    // Release the already-ready threads and surface the
                    // construction failure to the initializer.
                    drop(job_tx);
                    return Err(err);
                }
                Err(_) => {
                    drop(job_tx);
                    return Err(GatehouseError::Internal(format!(
                        "worker pool {:?}: a thread exited before becoming ready",
                        settings.name
                    )));
                }
            }
        }

        Ok(Arc::new(Self {
            slots: Arc::new(Semaphore::new(settings.num_threads)),
            settings,
            max_wait_time,
            job_tx: Mutex::new(Some(job_tx)),
            consecutive_failures,
            metrics,
            threads: Mutex::new(threads),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// The thread budget allocated to this pool.
    pub fn thread_count(&self) -> usize {
        self.settings.num_threads
    }

    pub(crate) fn settings(&self) -> &Arc<WorkerSettings> {
        &self.settings
    }

    pub(crate) fn current_failures(&self) -> i64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Whether this pool claims an unbound request. The resolved script
    /// path must match the pool's configured file exactly; two pools whose
    /// scripts merely share a file name stay distinct.
    pub(crate) fn handles_script(&self, ctx: &RequestContext) -> bool {
        self.settings.file.to_string_lossy() == ctx.script_filename()
    }

    /// Hand the context to a free execution thread and wait for completion.
    /// The timeout-rejection on a saturated pool is the sole backpressure
    /// mechanism under overload.
    pub(crate) async fn dispatch(&self, ctx: Arc<RequestContext>) -> Result<()> {
        let permit = self.acquire_slot(&ctx).await?;
        self.metrics.request_admitted(&self.settings.name);

        let sent = {
            let tx = lock(&self.job_tx);
            match tx.as_ref() {
                Some(tx) => tx
                    .send(Job {
                        ctx: Arc::clone(&ctx),
                        _permit: permit,
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            // No thread will ever see this job; fire the completion signal
            // here so waiters on the context do not hang.
            ctx.close();
            return Err(GatehouseError::Internal(format!(
                "worker pool {:?} is shut down",
                self.settings.name
            )));
        }

        ctx.completed().await;

        match ctx.take_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn acquire_slot(&self, ctx: &RequestContext) -> Result<OwnedSemaphorePermit> {
        let slots = Arc::clone(&self.slots);
        let closed = || {
            GatehouseError::Internal(format!(
                "worker pool {:?} is shut down",
                self.settings.name
            ))
        };

        match self.max_wait_time {
            Some(wait) => match timeout(wait, slots.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(closed()),
                Err(_) => {
                    self.metrics.dispatch_timeout(&self.settings.name);
                    let err = GatehouseError::DispatchTimeout {
                        worker: self.settings.name.clone(),
                        waited: wait,
                    };
                    warn!(worker = %self.settings.name, waited = ?wait, "no free thread, rejecting");
                    ctx.reject(&err);
                    Err(err)
                }
            },
            None => slots.acquire_owned().await.map_err(|_| closed()),
        }
    }

    /// Stop accepting work and retire every thread. In-flight executions run
    /// to completion first.
    pub(crate) fn shutdown(&self) {
        drop(lock(&self.job_tx).take());

        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!(worker = %self.settings.name, "worker thread panicked during shutdown");
            }
        }

        info!(worker = %self.settings.name, "worker pool stopped");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.settings.name)
            .field("threads", &self.settings.num_threads)
            .field("consecutive_failures", &self.current_failures())
            .finish_non_exhaustive()
    }
}

/// Execution thread body: build the handler, announce readiness, then serve
/// jobs until the pool's channel closes.
fn thread_main(
    index: usize,
    settings: Arc<WorkerSettings>,
    job_rx: Arc<Mutex<UnboundedReceiver<Job>>>,
    failures: Arc<AtomicI64>,
    metrics: Arc<dyn Metrics>,
    fatal: FatalReporter,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
) {
    let mut handler = match settings.factory.create(&settings, index) {
        Ok(handler) => handler,
        Err(err) => {
            error!(worker = %settings.name, thread = index, %err, "could not build script handler");
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    if let Some(hook) = &settings.on_thread_ready {
        invoke_thread_hook(hook, index, "thread-ready", &settings.name);
    }
    debug!(worker = %settings.name, thread = index, "worker thread ready");
    let _ = ready_tx.send(Ok(()));
    drop(ready_tx);

    loop {
        // The lock is held only while this thread is the one idle receiver;
        // it is released as soon as a job (or channel closure) arrives.
        let job = lock(&job_rx).blocking_recv();
        let Some(Job { ctx, _permit }) = job else {
            break;
        };

        match handler.handle(&ctx) {
            Ok(output) => {
                if let Some(value) = output {
                    ctx.set_output(value);
                }
                failures.store(0, Ordering::Relaxed);
                metrics.execution_succeeded(&settings.name, ctx.elapsed());
            }
            Err(err) => {
                metrics.execution_failed(&settings.name);
                let count = failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    worker = %settings.name,
                    thread = index,
                    consecutive_failures = count,
                    %err,
                    "script execution failed"
                );

                let max = settings.max_consecutive_failures;
                if max != -1 && count >= i64::from(max) {
                    fatal.report(GatehouseError::Fatal(format!(
                        "worker pool {:?} reached {count} consecutive failures",
                        settings.name
                    )));
                }

                ctx.set_error(err);
            }
        }

        ctx.close();
    }

    if let Some(hook) = &settings.on_thread_shutdown {
        invoke_thread_hook(hook, index, "thread-shutdown", &settings.name);
    }
    debug!(worker = %settings.name, thread = index, "worker thread retired");
}

/// Hook panics are contained; a broken hook must not wedge the pool.
fn invoke_thread_hook(hook: &ThreadHook, index: usize, what: &str, worker: &str) {
    let hook = Arc::clone(hook);
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || hook(index))).is_err() {
        warn!(worker, thread = index, "{what} hook panicked");
    }
}

pub(crate) fn invoke_server_hook(hook: &ServerHook, what: &str, worker: &str) {
    let hook = Arc::clone(hook);
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || hook())).is_err() {
        warn!(worker, "{what} hook panicked");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
