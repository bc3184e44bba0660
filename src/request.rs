//! HTTP-shaped request value
//!
//! The minimal request shape the admission layer needs: a path for
//! validation and CGI splitting, headers for Content-Length, and the body as
//! an opaque blob. The actual HTTP transport lives outside this crate.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// An inbound request as seen by the admission layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRequest {
    pub method: String,
    /// Request path, possibly with a query string.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ScriptRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Shorthand for a GET request to the given path.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First header value matching the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
