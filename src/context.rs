//! Per-request context and its lifecycle
//!
//! A [`RequestContext`] carries one in-flight unit of work from admission to
//! completion: Created -> Validating -> {Rejected | Bound} -> Executing ->
//! Completed. Both terminal states converge on exactly one firing of the
//! completion signal.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::request::ScriptRequest;
use crate::signal::Signal;
use crate::sink::ResponseSink;
use crate::types::{GatehouseError, Result};

/// Per-request state container.
pub struct RequestContext {
    request: Option<ScriptRequest>,
    original_request: Option<ScriptRequest>,
    document_root: String,
    doc_uri: String,
    path_info: String,
    script_name: String,
    script_filename: String,
    worker_name: Option<String>,
    message: Option<Value>,
    output: Mutex<Option<Value>>,
    error: Mutex<Option<GatehouseError>>,
    sink: Mutex<Option<Box<dyn ResponseSink>>>,
    client_closed: Option<Arc<Signal>>,
    metrics: Arc<dyn Metrics>,
    started_at: Instant,
    done: Signal,
}

impl RequestContext {
    /// Start building a context for an HTTP-shaped request.
    pub fn builder(request: ScriptRequest) -> ContextBuilder {
        ContextBuilder::new(Some(request))
    }

    /// Start building a context for an opaque message exchange. Message
    /// contexts bypass HTTP validation and must be bound to a worker.
    pub fn message_builder(payload: Value) -> ContextBuilder {
        let mut builder = ContextBuilder::new(None);
        builder.message = Some(payload);
        builder
    }

    /// Check whether the request should be outright rejected. Runs on the
    /// caller's own task, before any handoff, so rejected requests never
    /// consume a worker thread. Returns an error only when a rejection was
    /// written; callers must not continue dispatch on error.
    pub fn validate(&self) -> Result<()> {
        let Some(request) = &self.request else {
            return Ok(());
        };

        if request.path.contains('\0') {
            self.reject(&GatehouseError::InvalidRequestPath);
            return Err(GatehouseError::InvalidRequestPath);
        }

        if let Some(raw) = request.header("Content-Length").filter(|v| !v.is_empty()) {
            let valid = raw.parse::<i64>().map(|v| v >= 0).unwrap_or(false);
            if !valid {
                let err = GatehouseError::InvalidContentLength(raw.to_string());
                self.reject(&err);
                return Err(err);
            }
        }

        Ok(())
    }

    /// Write a rejection response and close the context. No-op when the
    /// context is already completed.
    ///
    /// # Panics
    ///
    /// Panics when the error does not classify as a rejection; that is a
    /// contract violation by the caller and must not be swallowed.
    pub fn reject(&self, err: &GatehouseError) {
        if self.is_done() {
            return;
        }

        let Some(status) = err.rejection_status() else {
            panic!("only rejection errors can be passed to reject, got: {err}");
        };

        debug!(status = status.as_u16(), error = %err, "rejecting request");
        self.metrics.request_rejected(status.as_u16());

        if let Some(sink) = lock(&self.sink).as_mut() {
            sink.write_head(status.as_u16());
            sink.write_body(err.to_string().as_bytes());
            sink.flush();
        }

        self.close();
    }

    /// Fire the completion signal. Idempotent; the second and later calls
    /// are silent no-ops, safe from whichever thread observes terminal
    /// state first.
    pub fn close(&self) {
        self.done.fire();
    }

    pub fn is_done(&self) -> bool {
        self.done.is_fired()
    }

    /// Wait until the context reaches a terminal state.
    pub async fn completed(&self) {
        self.done.wait().await;
    }

    /// Non-blocking poll of the caller's cancellation signal. Cooperative
    /// only; nothing interrupts an executing thread.
    pub fn client_has_closed(&self) -> bool {
        self.client_closed.as_ref().is_some_and(|s| s.is_fired())
    }

    pub fn request(&self) -> Option<&ScriptRequest> {
        self.request.as_ref()
    }

    /// The outer request, when this context wraps another call re-entering
    /// the system.
    pub fn original_request(&self) -> Option<&ScriptRequest> {
        self.original_request.as_ref()
    }

    pub fn document_root(&self) -> &str {
        &self.document_root
    }

    pub fn doc_uri(&self) -> &str {
        &self.doc_uri
    }

    pub fn path_info(&self) -> &str {
        &self.path_info
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// Resolved script path; immutable once the context is bound.
    pub fn script_filename(&self) -> &str {
        &self.script_filename
    }

    pub fn worker_name(&self) -> Option<&str> {
        self.worker_name.as_deref()
    }

    /// Input payload for message-style exchanges.
    pub fn message(&self) -> Option<&Value> {
        self.message.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Write the status line through the response sink, if one is attached.
    pub fn write_head(&self, status: u16) {
        if let Some(sink) = lock(&self.sink).as_mut() {
            sink.write_head(status);
        }
    }

    /// Append body bytes through the response sink, if one is attached.
    pub fn write_body(&self, data: &[u8]) {
        if let Some(sink) = lock(&self.sink).as_mut() {
            sink.write_body(data);
        }
    }

    pub fn flush_response(&self) {
        if let Some(sink) = lock(&self.sink).as_mut() {
            sink.flush();
        }
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }

    pub(crate) fn set_output(&self, value: Value) {
        *lock(&self.output) = Some(value);
    }

    pub(crate) fn take_output(&self) -> Option<Value> {
        lock(&self.output).take()
    }

    pub(crate) fn set_error(&self, err: GatehouseError) {
        *lock(&self.error) = Some(err);
    }

    pub(crate) fn take_error(&self) -> Option<GatehouseError> {
        lock(&self.error).take()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("worker_name", &self.worker_name)
            .field("script_filename", &self.script_filename)
            .field("doc_uri", &self.doc_uri)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RequestContext`].
pub struct ContextBuilder {
    request: Option<ScriptRequest>,
    original_request: Option<ScriptRequest>,
    document_root: Option<String>,
    worker_name: Option<String>,
    sink: Option<Box<dyn ResponseSink>>,
    client_signal: Option<Arc<Signal>>,
    message: Option<Value>,
}

impl ContextBuilder {
    fn new(request: Option<ScriptRequest>) -> Self {
        Self {
            request,
            original_request: None,
            document_root: None,
            worker_name: None,
            sink: None,
            client_signal: None,
            message: None,
        }
    }

    /// Bind the context to a named worker pool. The script path then comes
    /// from that pool's configured file and CGI path splitting is skipped.
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = Some(name.into());
        self
    }

    /// Attach the outer request for traceability when one call wraps
    /// another.
    pub fn original_request(mut self, request: ScriptRequest) -> Self {
        self.original_request = Some(request);
        self
    }

    pub fn document_root(mut self, root: impl Into<String>) -> Self {
        self.document_root = Some(root.into());
        self
    }

    pub fn response_sink(mut self, sink: Box<dyn ResponseSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Signal fired when the underlying caller disconnects.
    pub fn client_signal(mut self, signal: Arc<Signal>) -> Self {
        self.client_signal = Some(signal);
        self
    }

    pub fn message(mut self, payload: Value) -> Self {
        self.message = Some(payload);
        self
    }

    /// Apply defaults and freeze the context.
    pub fn build(self, config: &Config) -> Result<RequestContext> {
        let mut document_root = self.document_root.unwrap_or_default();
        if document_root.is_empty() && self.request.is_some() {
            document_root = match &config.embedded_app_path {
                Some(path) => path.to_string_lossy().into_owned(),
                None => std::env::current_dir()?.to_string_lossy().into_owned(),
            };
        }

        if self.request.is_none() && self.worker_name.is_none() {
            return Err(GatehouseError::Config(
                "a message context must be bound to a worker pool".into(),
            ));
        }

        let mut doc_uri = String::new();
        let mut path_info = String::new();
        let mut script_name = String::new();
        let script_filename;

        if let Some(name) = &self.worker_name {
            // Explicit binding: the script path comes straight from the
            // worker's configured file.
            let settings = config
                .worker_settings(name)
                .ok_or_else(|| GatehouseError::UnknownWorker(name.clone()))?;
            script_filename = settings.file.to_string_lossy().into_owned();
        } else if let Some(request) = &self.request {
            // No binding yet: split into CGI path variables now, because a
            // worker may still claim the request based on the path.
            let split = split_cgi_path(&request.path);
            script_filename = join_document_root(&document_root, &split.script_name);
            doc_uri = split.doc_uri;
            path_info = split.path_info;
            script_name = split.script_name;
        } else {
            script_filename = String::new();
        }

        Ok(RequestContext {
            request: self.request,
            original_request: self.original_request,
            document_root,
            doc_uri,
            path_info,
            script_name,
            script_filename,
            worker_name: self.worker_name,
            message: self.message,
            output: Mutex::new(None),
            error: Mutex::new(None),
            sink: Mutex::new(self.sink),
            client_closed: self.client_signal,
            metrics: Arc::clone(config.metrics()),
            started_at: Instant::now(),
            done: Signal::new(),
        })
    }
}

struct CgiPath {
    doc_uri: String,
    script_name: String,
    path_info: String,
}

/// Split a request path into the traditional CGI variables: the script name
/// ends at the first path segment containing a dot; whatever follows is path
/// info. The query string is not part of any of them.
fn split_cgi_path(path: &str) -> CgiPath {
    let path = path.split('?').next().unwrap_or_default();

    let mut script_end = path.len();
    let mut offset = 0;
    for segment in path.split('/') {
        let end = offset + segment.len();
        if !segment.is_empty() && segment.contains('.') {
            script_end = end;
            break;
        }
        offset = end + 1;
    }

    let (script_name, path_info) = path.split_at(script_end.min(path.len()));

    CgiPath {
        doc_uri: path.to_string(),
        script_name: script_name.to_string(),
        path_info: path_info.to_string(),
    }
}

fn join_document_root(document_root: &str, script_name: &str) -> String {
    format!(
        "{}/{}",
        document_root.trim_end_matches('/'),
        script_name.trim_start_matches('/')
    )
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
