//! Extension worker adapter
//!
//! A caller-facing facade over one worker pool, for embedding code that
//! drives workers outside the HTTP path. The handle is created before
//! initialization so callers can hold a reference, and is bound to its
//! backing [`Worker`](crate::worker::Worker) only once initialization
//! succeeds. It owns no thread-budget state of its own.

use std::sync::{Arc, OnceLock};

use serde_json::Value;

use crate::config::Config;
use crate::context::RequestContext;
use crate::request::ScriptRequest;
use crate::sink::ResponseSink;
use crate::types::{GatehouseError, Result};
use crate::worker::Worker;

pub(crate) struct Bound {
    pub(crate) worker: Arc<Worker>,
    pub(crate) config: Arc<Config>,
}

/// Long-lived handle to an extension-registered worker pool.
#[derive(Clone)]
pub struct ExtensionWorker {
    name: String,
    inner: Arc<OnceLock<Bound>>,
}

impl ExtensionWorker {
    pub(crate) fn unbound(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn bind(&self, worker: Arc<Worker>, config: Arc<Config>) {
        let _ = self.inner.set(Bound { worker, config });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn bound(&self) -> Result<&Bound> {
        self.inner.get().ok_or_else(|| {
            GatehouseError::Internal(format!(
                "extension worker {:?} is not initialized yet",
                self.name
            ))
        })
    }

    /// Send an HTTP-shaped request through the pool: same
    /// validate -> dispatch -> execute -> complete path as an ordinary
    /// request. The response is written to the given sink.
    pub async fn send_request(
        &self,
        sink: Box<dyn ResponseSink>,
        request: ScriptRequest,
    ) -> Result<()> {
        let bound = self.bound()?;

        let ctx = Arc::new(
            RequestContext::builder(request.clone())
                .original_request(request)
                .worker_name(&self.name)
                .response_sink(sink)
                .build(&bound.config)?,
        );

        ctx.validate()?;

        bound.worker.dispatch(ctx).await
    }

    /// Exchange an opaque value with the pool, bypassing HTTP validation.
    /// Returns whatever payload the worker produced.
    pub async fn send_message(
        &self,
        payload: Value,
        sink: Option<Box<dyn ResponseSink>>,
    ) -> Result<Option<Value>> {
        let bound = self.bound()?;

        let mut builder = RequestContext::message_builder(payload).worker_name(&self.name);
        if let Some(sink) = sink {
            builder = builder.response_sink(sink);
        }
        let ctx = Arc::new(builder.build(&bound.config)?);

        bound.worker.dispatch(Arc::clone(&ctx)).await?;

        Ok(ctx.take_output())
    }

    /// Thread budget of the backing pool. Valid only after initialization
    /// has bound this handle.
    pub fn num_threads(&self) -> Result<usize> {
        Ok(self.bound()?.worker.thread_count())
    }
}

impl std::fmt::Debug for ExtensionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionWorker")
            .field("name", &self.name)
            .field("bound", &self.inner.get().is_some())
            .finish()
    }
}
