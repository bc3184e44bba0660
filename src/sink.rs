//! Response sink abstraction
//!
//! The HTTP transport is not this crate's concern; callers hand in whatever
//! writes bytes back to their client. `BufferSink` is the in-memory recorder
//! used by tests and by embedders that only want the bytes.

use std::sync::{Arc, Mutex, PoisonError};

/// Where a response (or a rejection) gets written.
pub trait ResponseSink: Send {
    /// Write the status line. Called at most once, before any body bytes.
    fn write_head(&mut self, status: u16);

    /// Append body bytes.
    fn write_body(&mut self, data: &[u8]);

    /// Flush incrementally, for sinks that support it. Default is a no-op.
    fn flush(&mut self) {}
}

#[derive(Debug, Default)]
struct Recorded {
    status: Option<u16>,
    body: Vec<u8>,
    flushed: bool,
}

/// In-memory sink recording status and body. Cloning yields a handle to the
/// same buffer, so a test can keep one half while handing the other into a
/// request context.
#[derive(Debug, Clone, Default)]
pub struct BufferSink {
    inner: Arc<Mutex<Recorded>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<u16> {
        self.lock().status
    }

    pub fn body(&self) -> Vec<u8> {
        self.lock().body.clone()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.lock().body).into_owned()
    }

    pub fn flushed(&self) -> bool {
        self.lock().flushed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResponseSink for BufferSink {
    fn write_head(&mut self, status: u16) {
        self.lock().status = Some(status);
    }

    fn write_body(&mut self, data: &[u8]) {
        self.lock().body.extend_from_slice(data);
    }

    fn flush(&mut self) {
        self.lock().flushed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_records_status_and_body() {
        let sink = BufferSink::new();
        let mut writer = sink.clone();

        writer.write_head(200);
        writer.write_body(b"hello ");
        writer.write_body(b"world");
        writer.flush();

        assert_eq!(sink.status(), Some(200));
        assert_eq!(sink.body_string(), "hello world");
        assert!(sink.flushed());
    }

    #[test]
    fn test_buffer_sink_starts_empty() {
        let sink = BufferSink::new();
        assert_eq!(sink.status(), None);
        assert!(sink.body().is_empty());
        assert!(!sink.flushed());
    }
}
