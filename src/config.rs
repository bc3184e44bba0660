//! Configuration for gatehouse
//!
//! Two tiers: global settings (thread budget, wait bound, interpreter ini
//! overrides, metrics sink) and per-pool [`WorkerSettings`]. Both are plain
//! builders with a single validation pass in [`ConfigBuilder::build`];
//! everything is immutable once built.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::extension::ExtensionWorker;
use crate::handler::HandlerFactory;
use crate::metrics::{Metrics, NoopMetrics};
use crate::types::{GatehouseError, Result};

/// Maximum consecutive execution failures before a pool is considered
/// systemically broken, unless overridden per pool. `-1` disables the limit.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: i32 = 6;

/// Hook invoked with the index of the thread that became ready or retired.
pub type ThreadHook = Arc<dyn Fn(usize) + Send + Sync>;
/// Hook invoked once at server startup or shutdown.
pub type ServerHook = Arc<dyn Fn() + Send + Sync>;

/// Immutable per-pool configuration.
pub struct WorkerSettings {
    pub(crate) name: String,
    pub(crate) file: PathBuf,
    pub(crate) num_threads: usize,
    pub(crate) env: HashMap<String, String>,
    pub(crate) watch: Vec<PathBuf>,
    pub(crate) max_consecutive_failures: i32,
    pub(crate) on_thread_ready: Option<ThreadHook>,
    pub(crate) on_thread_shutdown: Option<ThreadHook>,
    pub(crate) on_server_startup: Option<ServerHook>,
    pub(crate) on_server_shutdown: Option<ServerHook>,
    pub(crate) factory: Arc<dyn HandlerFactory>,
    pub(crate) extension: bool,
}

impl WorkerSettings {
    pub fn builder(
        name: impl Into<String>,
        file: impl Into<PathBuf>,
        num_threads: usize,
        factory: Arc<dyn HandlerFactory>,
    ) -> WorkerSettingsBuilder {
        WorkerSettingsBuilder {
            settings: WorkerSettings {
                name: name.into(),
                file: file.into(),
                num_threads,
                env: HashMap::new(),
                watch: Vec::new(),
                max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
                on_thread_ready: None,
                on_thread_shutdown: None,
                on_server_startup: None,
                on_server_shutdown: None,
                factory,
                extension: false,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The script file every thread of this pool runs.
    pub fn file(&self) -> &std::path::Path {
        &self.file
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Per-pool environment overrides, handed to the interpreter as-is.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Filesystem paths that should trigger a pool reload when they change.
    /// Watching itself is the embedder's job.
    pub fn watch(&self) -> &[PathBuf] {
        &self.watch
    }

    pub fn max_consecutive_failures(&self) -> i32 {
        self.max_consecutive_failures
    }

    pub fn is_extension(&self) -> bool {
        self.extension
    }
}

impl std::fmt::Debug for WorkerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSettings")
            .field("name", &self.name)
            .field("file", &self.file)
            .field("num_threads", &self.num_threads)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkerSettings`].
pub struct WorkerSettingsBuilder {
    settings: WorkerSettings,
}

impl WorkerSettingsBuilder {
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.settings.env = env;
        self
    }

    pub fn watch(mut self, paths: Vec<PathBuf>) -> Self {
        self.settings.watch = paths;
        self
    }

    /// `-1` means unlimited tolerance; anything below that is rejected here,
    /// at construction time, not deferred to initialization.
    pub fn max_consecutive_failures(mut self, max_failures: i32) -> Result<Self> {
        if max_failures < -1 {
            return Err(GatehouseError::Config(format!(
                "max consecutive failures must be >= -1, got {max_failures}"
            )));
        }
        self.settings.max_consecutive_failures = max_failures;
        Ok(self)
    }

    /// Called once per thread, after it becomes available to accept work.
    pub fn on_thread_ready(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.settings.on_thread_ready = Some(Arc::new(hook));
        self
    }

    /// Called once per thread as it is retired.
    pub fn on_thread_shutdown(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.settings.on_thread_shutdown = Some(Arc::new(hook));
        self
    }

    /// Called once, after all pools are ready.
    pub fn on_server_startup(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.settings.on_server_startup = Some(Arc::new(hook));
        self
    }

    /// Called once, before any pool begins tearing down.
    pub fn on_server_shutdown(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.settings.on_server_shutdown = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> WorkerSettings {
        self.settings
    }
}

/// Immutable global configuration, validated once by [`ConfigBuilder::build`].
pub struct Config {
    pub(crate) num_threads: usize,
    pub(crate) max_threads: Option<usize>,
    pub(crate) max_wait_time: Option<Duration>,
    pub(crate) env: HashMap<String, String>,
    pub(crate) ini: HashMap<String, String>,
    pub(crate) embedded_app_path: Option<PathBuf>,
    pub(crate) metrics: Arc<dyn Metrics>,
    pub(crate) workers: Vec<Arc<WorkerSettings>>,
    pub(crate) extension_handles: Vec<ExtensionWorker>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Total executable threads across all pools.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Bound on blocking dispatch before timeout-rejection. `None` waits
    /// indefinitely.
    pub fn max_wait_time(&self) -> Option<Duration> {
        self.max_wait_time
    }

    /// Global environment defaults, merged under per-pool overrides by the
    /// interpreter layer.
    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Ini-style key/value runtime settings forwarded to the interpreter.
    pub fn ini(&self) -> &HashMap<String, String> {
        &self.ini
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    pub fn workers(&self) -> &[Arc<WorkerSettings>] {
        &self.workers
    }

    pub fn worker_settings(&self, name: &str) -> Option<&Arc<WorkerSettings>> {
        self.workers.iter().find(|w| w.name == name)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("num_threads", &self.num_threads)
            .field("max_threads", &self.max_threads)
            .field("max_wait_time", &self.max_wait_time)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    num_threads: Option<usize>,
    max_threads: Option<usize>,
    max_wait_time: Option<Duration>,
    env: HashMap<String, String>,
    ini: HashMap<String, String>,
    embedded_app_path: Option<PathBuf>,
    metrics: Arc<dyn Metrics>,
    workers: Vec<Arc<WorkerSettings>>,
    extension_handles: Vec<ExtensionWorker>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            num_threads: None,
            max_threads: None,
            max_wait_time: None,
            env: HashMap::new(),
            ini: HashMap::new(),
            embedded_app_path: None,
            metrics: Arc::new(NoopMetrics),
            workers: Vec::new(),
            extension_handles: Vec::new(),
        }
    }
}

impl ConfigBuilder {
    /// Total threads to split across pools. Defaults to the sum of the
    /// declared pool sizes.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Hard upper bound on the thread count.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = Some(max_threads);
        self
    }

    /// Max time a request may stall waiting for a free thread.
    pub fn max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = Some(max_wait_time);
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn ini(mut self, overrides: HashMap<String, String>) -> Self {
        self.ini = overrides;
        self
    }

    /// Default document root for contexts that don't set one. Falls back to
    /// the process working directory when unset.
    pub fn embedded_app_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.embedded_app_path = Some(path.into());
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Declare an ordinary named pool. Name uniqueness is enforced at
    /// initialization, never by silent overwrite.
    pub fn worker(mut self, settings: WorkerSettings) -> Self {
        self.workers.push(Arc::new(settings));
        self
    }

    /// Declare an extension pool and get back its (still unbound) adapter
    /// handle. Extension pools draw from the same thread budget but are
    /// satisfied last.
    pub fn extension_worker(mut self, mut settings: WorkerSettings) -> (Self, ExtensionWorker) {
        settings.extension = true;
        let handle = ExtensionWorker::unbound(&settings.name);
        self.extension_handles.push(handle.clone());
        self.workers.push(Arc::new(settings));
        (self, handle)
    }

    /// Validate the aggregate configuration and freeze it.
    pub fn build(self) -> Result<Config> {
        let declared: usize = self.workers.iter().map(|w| w.num_threads).sum();
        let num_threads = self.num_threads.unwrap_or_else(|| declared.max(1));

        if num_threads == 0 {
            return Err(GatehouseError::Config(
                "thread count must be at least 1".into(),
            ));
        }

        if let Some(max) = self.max_threads {
            if num_threads > max {
                return Err(GatehouseError::Config(format!(
                    "{num_threads} threads requested but max threads is {max}"
                )));
            }
        }

        for worker in &self.workers {
            if worker.num_threads == 0 {
                return Err(GatehouseError::Config(format!(
                    "worker pool {:?} must have at least 1 thread",
                    worker.name
                )));
            }
        }

        Ok(Config {
            num_threads,
            max_threads: self.max_threads,
            max_wait_time: self.max_wait_time,
            env: self.env,
            ini: self.ini,
            embedded_app_path: self.embedded_app_path,
            metrics: self.metrics,
            workers: self.workers,
            extension_handles: self.extension_handles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ScriptHandler;

    fn noop_factory() -> Arc<dyn HandlerFactory> {
        Arc::new(|_: &WorkerSettings, _: usize| {
            Ok(Box::new(|_: &crate::context::RequestContext| Ok(None)) as Box<dyn ScriptHandler>)
        })
    }

    #[test]
    fn test_max_failures_rejects_below_minus_one() {
        let result = WorkerSettings::builder("app", "app.php", 1, noop_factory())
            .max_consecutive_failures(-2);
        assert!(result.is_err());
    }

    #[test]
    fn test_max_failures_accepts_sentinel_and_non_negative() {
        for value in [-1, 0, 1, 100] {
            let settings = WorkerSettings::builder("app", "app.php", 1, noop_factory())
                .max_consecutive_failures(value)
                .unwrap()
                .build();
            assert_eq!(settings.max_consecutive_failures(), value);
        }
    }

    #[test]
    fn test_default_max_failures() {
        let settings = WorkerSettings::builder("app", "app.php", 1, noop_factory()).build();
        assert_eq!(
            settings.max_consecutive_failures(),
            DEFAULT_MAX_CONSECUTIVE_FAILURES
        );
    }

    #[test]
    fn test_num_threads_defaults_to_declared_sum() {
        let config = Config::builder()
            .worker(WorkerSettings::builder("a", "a.php", 2, noop_factory()).build())
            .worker(WorkerSettings::builder("b", "b.php", 3, noop_factory()).build())
            .build()
            .unwrap();
        assert_eq!(config.num_threads(), 5);
    }

    #[test]
    fn test_max_threads_caps_num_threads() {
        let result = Config::builder().num_threads(8).max_threads(4).build();
        assert!(matches!(result, Err(GatehouseError::Config(_))));
    }

    #[test]
    fn test_config_is_debug_formattable() {
        let config = Config::builder()
            .worker(WorkerSettings::builder("a", "a.php", 2, noop_factory()).build())
            .build()
            .unwrap();
        let rendered = format!("{config:?}");
        assert!(rendered.contains("num_threads"));
        assert!(rendered.contains("\"a\""));
    }

    #[test]
    fn test_extension_worker_returns_unbound_handle() {
        let (builder, handle) = Config::builder().extension_worker(
            WorkerSettings::builder("ext", "ext.php", 1, noop_factory()).build(),
        );
        let config = builder.build().unwrap();
        assert!(config.worker_settings("ext").unwrap().is_extension());
        assert!(handle.num_threads().is_err());
    }
}
