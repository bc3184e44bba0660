//! Initialization, registration, and shutdown
//!
//! Validates the aggregate configuration before any pool is allowed to run:
//! duplicate pool names are a configuration error, and the thread budget is
//! reserved in two phases (ordinary pools first, extension pools last) so a
//! shortfall fails deterministically instead of silently starving a pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::context::RequestContext;
use crate::types::{GatehouseError, Result};
use crate::worker::{invoke_server_hook, Worker};

/// Shared channel carrying the first fatal error observed anywhere in the
/// process. A supervising layer subscribes and translates it into an
/// intentional, abrupt termination; gatehouse itself never aborts.
#[derive(Clone)]
pub(crate) struct FatalReporter(Arc<watch::Sender<Option<GatehouseError>>>);

impl FatalReporter {
    pub(crate) fn report(&self, err: GatehouseError) {
        error!(%err, "fatal condition reported");
        self.0.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                // First fatal wins; later ones are already a consequence.
                false
            }
        });
    }
}

pub(crate) fn fatal_channel() -> (FatalReporter, watch::Receiver<Option<GatehouseError>>) {
    let (tx, rx) = watch::channel(None);
    (FatalReporter(Arc::new(tx)), rx)
}

/// The running system: every configured pool spawned, every extension
/// adapter bound.
pub struct Runtime {
    config: Arc<Config>,
    workers: HashMap<String, Arc<Worker>>,
    fatal_rx: watch::Receiver<Option<GatehouseError>>,
}

impl Runtime {
    /// Validate the configuration and bring every pool up. Fails before any
    /// pool serves traffic on duplicate names or an insufficient thread
    /// budget; an extension-pool shortfall is reported as a fatal error
    /// since it is a deployment mistake the operator must fix.
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let mut seen = HashSet::new();
        for worker in config.workers() {
            if !seen.insert(worker.name().to_string()) {
                return Err(GatehouseError::Config(format!(
                    "two worker pools are registered under the name {:?}",
                    worker.name()
                )));
            }
        }

        reserve_thread_budget(&config)?;

        let (fatal, fatal_rx) = fatal_channel();
        let mut workers = HashMap::new();
        for settings in config.workers() {
            let worker = Worker::spawn(
                Arc::clone(settings),
                config.max_wait_time(),
                Arc::clone(config.metrics()),
                fatal.clone(),
            )?;
            workers.insert(settings.name().to_string(), worker);
        }

        for handle in &config.extension_handles {
            if let Some(worker) = workers.get(handle.name()) {
                handle.bind(Arc::clone(worker), Arc::clone(&config));
            }
        }

        // All pools are ready; announce startup exactly once per pool that
        // asked for it.
        for settings in config.workers() {
            if let Some(hook) = &settings.on_server_startup {
                invoke_server_hook(hook, "server-startup", settings.name());
            }
        }

        info!(
            pools = workers.len(),
            threads = config.num_threads(),
            "gatehouse initialized"
        );

        Ok(Self {
            config,
            workers,
            fatal_rx,
        })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<Worker>> {
        self.workers.get(name)
    }

    /// Run a context through validation and dispatch. The rejection path
    /// always happens before any handoff, so a rejected request never
    /// consumes a worker thread.
    pub async fn serve(&self, ctx: Arc<RequestContext>) -> Result<()> {
        ctx.validate()?;
        self.dispatch(ctx).await
    }

    /// Dispatch an already-validated context to its pool: the explicit
    /// binding when one was set, otherwise the pool claiming the resolved
    /// script path.
    pub async fn dispatch(&self, ctx: Arc<RequestContext>) -> Result<()> {
        let worker = match ctx.worker_name() {
            Some(name) => self.workers.get(name),
            None => self.workers.values().find(|w| w.handles_script(&ctx)),
        };

        match worker {
            Some(worker) => worker.dispatch(ctx).await,
            None => {
                let err = GatehouseError::UnknownWorker(
                    ctx.worker_name().unwrap_or(ctx.script_name()).to_string(),
                );
                ctx.reject(&err);
                Err(err)
            }
        }
    }

    /// The first fatal error reported by any pool, if one has been.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_rx.borrow().as_ref().map(|e| e.to_string())
    }

    /// Subscribe to fatal reports. The supervising layer is expected to
    /// await a change and then terminate the process.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<GatehouseError>> {
        self.fatal_rx.clone()
    }

    /// Tear everything down: server-shutdown hooks first (before any pool
    /// starts retiring threads), then retire every pool. Hook failures are
    /// contained and never prevent shutdown from completing.
    pub fn shutdown(&self) {
        for settings in self.config.workers() {
            if let Some(hook) = &settings.on_server_shutdown {
                invoke_server_hook(hook, "server-shutdown", settings.name());
            }
        }

        for worker in self.workers.values() {
            worker.shutdown();
        }

        info!("gatehouse shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut pools: Vec<_> = self.workers.keys().collect();
        pools.sort();
        f.debug_struct("Runtime")
            .field("pools", &pools)
            .field("threads", &self.config.num_threads())
            .finish_non_exhaustive()
    }
}

/// Two-phase reservation over the shared budget: ordinary pools first, then
/// extension pools, each in registration order. Ordinary shortfall is a
/// configuration error; extension shortfall is fatal.
fn reserve_thread_budget(config: &Config) -> Result<()> {
    let total = config.num_threads();
    let mut remaining = total;

    for worker in config.workers().iter().filter(|w| !w.is_extension()) {
        let wanted = worker.num_threads();
        if wanted > remaining {
            return Err(GatehouseError::Config(format!(
                "insufficient threads: worker pool {:?} requires {wanted} but only {remaining} of {total} remain",
                worker.name()
            )));
        }
        remaining -= wanted;
    }

    for worker in config.workers().iter().filter(|w| w.is_extension()) {
        let wanted = worker.num_threads();
        if wanted > remaining {
            return Err(GatehouseError::Fatal(format!(
                "insufficient threads for extension worker pool {:?}: requires {wanted} but only {remaining} of {total} remain; increase the total thread count",
                worker.name()
            )));
        }
        remaining -= wanted;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WorkerSettings, WorkerSettingsBuilder};
    use crate::handler::{HandlerFactory, ScriptHandler};
    use crate::request::ScriptRequest;
    use crate::sink::BufferSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|_: &WorkerSettings, _: usize| {
            Ok(Box::new(|ctx: &RequestContext| {
                ctx.write_head(200);
                ctx.write_body(b"ok");
                Ok(None)
            }) as Box<dyn ScriptHandler>)
        })
    }

    fn worker(name: &str, file: &str, threads: usize) -> WorkerSettingsBuilder {
        WorkerSettings::builder(name, file, threads, echo_factory())
    }

    #[test]
    fn test_duplicate_pool_names_fail_initialization() {
        let config = Config::builder()
            .worker(worker("app", "a.php", 1).build())
            .worker(worker("app", "b.php", 1).build())
            .build()
            .unwrap();

        let err = Runtime::new(config).unwrap_err();
        assert!(matches!(err, GatehouseError::Config(_)));
        assert!(err.to_string().contains("app"));
    }

    #[test]
    fn test_distinct_names_with_sufficient_budget_succeed() {
        let config = Config::builder()
            .num_threads(4)
            .worker(worker("app", "a.php", 2).build())
            .worker(worker("admin", "b.php", 2).build())
            .build()
            .unwrap();

        let runtime = Runtime::new(config).unwrap();
        assert_eq!(runtime.worker("app").unwrap().thread_count(), 2);
        assert_eq!(runtime.worker("admin").unwrap().thread_count(), 2);
        runtime.shutdown();
    }

    #[test]
    fn test_ordinary_budget_shortfall_is_config_error() {
        let config = Config::builder()
            .num_threads(2)
            .worker(worker("app", "a.php", 3).build())
            .build()
            .unwrap();

        let err = Runtime::new(config).unwrap_err();
        assert!(matches!(err, GatehouseError::Config(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_extension_budget_shortfall_is_fatal() {
        let (builder, _handle) = Config::builder()
            .num_threads(2)
            .worker(worker("app", "a.php", 2).build())
            .extension_worker(worker("ext", "ext.php", 1).build());
        let config = builder.build().unwrap();

        let err = Runtime::new(config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ext"));
    }

    #[test]
    fn test_extension_pools_are_reserved_after_ordinary_ones() {
        // Registration order puts the extension pool first, but the
        // ordinary pool still wins the budget.
        let (builder, _handle) = Config::builder()
            .num_threads(2)
            .extension_worker(worker("ext", "ext.php", 2).build());
        let config = builder.worker(worker("app", "a.php", 2).build()).build().unwrap();

        let err = Runtime::new(config).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("ext"));
    }

    #[tokio::test]
    async fn test_serve_routes_by_script_path() {
        let config = Config::builder()
            .worker(worker("app", "/srv/app.php", 1).build())
            .build()
            .unwrap();
        let runtime = Runtime::new(config).unwrap();

        let sink = BufferSink::new();
        let ctx = Arc::new(
            RequestContext::builder(ScriptRequest::get("/app.php"))
                .document_root("/srv")
                .response_sink(Box::new(sink.clone()))
                .build(runtime.config())
                .unwrap(),
        );

        runtime.serve(ctx).await.unwrap();
        assert_eq!(sink.body_string(), "ok");

        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_serve_does_not_route_by_basename_alone() {
        // A pool only claims a request whose resolved script path matches
        // its configured file exactly; a shared file name in a different
        // directory is a foreign script.
        let config = Config::builder()
            .worker(worker("other", "/completely/different/index.php", 1).build())
            .build()
            .unwrap();
        let runtime = Runtime::new(config).unwrap();

        let sink = BufferSink::new();
        let ctx = Arc::new(
            RequestContext::builder(ScriptRequest::get("/v1/index.php"))
                .document_root("/srv")
                .response_sink(Box::new(sink.clone()))
                .build(runtime.config())
                .unwrap(),
        );

        let err = runtime.serve(ctx).await.unwrap_err();
        assert!(matches!(err, GatehouseError::UnknownWorker(_)));
        assert_eq!(sink.status(), Some(404));

        runtime.shutdown();
    }

    #[tokio::test]
    async fn test_serve_rejects_unroutable_path() {
        let config = Config::builder()
            .worker(worker("app", "/srv/app.php", 1).build())
            .build()
            .unwrap();
        let runtime = Runtime::new(config).unwrap();

        let sink = BufferSink::new();
        let ctx = Arc::new(
            RequestContext::builder(ScriptRequest::get("/other.php"))
                .document_root("/srv")
                .response_sink(Box::new(sink.clone()))
                .build(runtime.config())
                .unwrap(),
        );

        let err = runtime.serve(ctx).await.unwrap_err();
        assert!(matches!(err, GatehouseError::UnknownWorker(_)));
        assert_eq!(sink.status(), Some(404));

        runtime.shutdown();
    }

    #[test]
    fn test_server_hooks_fire_once_and_survive_panics() {
        let startups = Arc::new(AtomicUsize::new(0));
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let startup_count = Arc::clone(&startups);
        let shutdown_count = Arc::clone(&shutdowns);

        let settings = worker("app", "a.php", 1)
            .on_server_startup(move || {
                startup_count.fetch_add(1, Ordering::SeqCst);
            })
            .on_server_shutdown(move || {
                shutdown_count.fetch_add(1, Ordering::SeqCst);
                panic!("shutdown hook misbehaves");
            })
            .build();

        let config = Config::builder().worker(settings).build().unwrap();
        let runtime = Runtime::new(config).unwrap();
        assert_eq!(startups.load(Ordering::SeqCst), 1);

        // The panicking hook must not prevent shutdown from completing.
        runtime.shutdown();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_fatal_error_after_clean_startup() {
        let config = Config::builder()
            .worker(worker("app", "a.php", 1).build())
            .build()
            .unwrap();
        let runtime = Runtime::new(config).unwrap();
        assert!(runtime.fatal_error().is_none());
        runtime.shutdown();
    }
}
