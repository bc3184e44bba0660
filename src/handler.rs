//! Script handler seam
//!
//! The script interpreter is an external collaborator: it receives a fully
//! prepared [`RequestContext`] and returns a result or an error. A handler
//! instance is long-lived and stateful; each execution thread builds exactly
//! one via the pool's [`HandlerFactory`] and drives every request on that
//! thread through it.

use serde_json::Value;

use crate::config::WorkerSettings;
use crate::context::RequestContext;
use crate::types::Result;

/// A long-lived, stateful script handler bound to one execution thread.
pub trait ScriptHandler: Send {
    /// Handle one request. HTTP-shaped output goes through the context's
    /// response sink; an optional return value carries the payload for
    /// message-style exchanges.
    fn handle(&mut self, ctx: &RequestContext) -> Result<Option<Value>>;
}

/// Builds one [`ScriptHandler`] per execution thread at pool start.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, worker: &WorkerSettings, thread_index: usize) -> Result<Box<dyn ScriptHandler>>;
}

impl<F> ScriptHandler for F
where
    F: FnMut(&RequestContext) -> Result<Option<Value>> + Send,
{
    fn handle(&mut self, ctx: &RequestContext) -> Result<Option<Value>> {
        self(ctx)
    }
}

impl<F> HandlerFactory for F
where
    F: Fn(&WorkerSettings, usize) -> Result<Box<dyn ScriptHandler>> + Send + Sync,
{
    fn create(&self, worker: &WorkerSettings, thread_index: usize) -> Result<Box<dyn ScriptHandler>> {
        self(worker, thread_index)
    }
}
