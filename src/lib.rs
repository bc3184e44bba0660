//! Gatehouse - admission and dispatch layer for script worker pools
//!
//! Sits between inbound requests (HTTP-shaped or programmatic messages) and
//! a fixed budget of long-lived script-execution threads, split across named
//! worker pools. Per-request validation, bounded-wait backpressure, and
//! failure containment keep a misbehaving script from taking the whole
//! process down; the script interpreter itself is an external collaborator
//! plugged in through the [`handler`] seam.
//!
//! ## Pieces
//!
//! - **RequestContext**: per-call state with a validate/reject/complete
//!   lifecycle and an exactly-once completion signal
//! - **Config**: thread budget, per-pool settings, failure thresholds,
//!   lifecycle hooks
//! - **Worker**: one named pool of execution threads with consecutive-failure
//!   containment
//! - **ExtensionWorker**: adapter letting embedding code drive a pool
//!   directly with request/response or message/response semantics
//! - **Runtime**: registration validation, two-phase thread-budget
//!   reservation, startup/shutdown orchestration

pub mod config;
pub mod context;
pub mod extension;
pub mod handler;
pub mod metrics;
pub mod request;
pub mod runtime;
pub mod signal;
pub mod sink;
pub mod types;
pub mod worker;

pub use config::{Config, ConfigBuilder, WorkerSettings, WorkerSettingsBuilder};
pub use context::{ContextBuilder, RequestContext};
pub use extension::ExtensionWorker;
pub use handler::{HandlerFactory, ScriptHandler};
pub use metrics::{Metrics, NoopMetrics};
pub use request::ScriptRequest;
pub use runtime::Runtime;
pub use signal::Signal;
pub use sink::{BufferSink, ResponseSink};
pub use types::{GatehouseError, Result};
