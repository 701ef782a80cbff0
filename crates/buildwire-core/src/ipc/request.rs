//! Request and response value types.
//!
//! A [`Request`] is built once per inbound message and never mutated. It
//! carries a [`ServerLink`] so handlers can push `progress` and `message`
//! notifications tied to the in-flight request without a server reference.

use super::event_loop::ConnectionId;
use super::server::ServerLink;
use crate::build::Reporter;
use crate::config::WireKeys;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Instant;

/// Per-request debugging switches taken from the `debug` object.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub show_stats: bool,
    pub dump_to_file: Option<PathBuf>,
    pub(crate) started: Instant,
}

impl DebugInfo {
    /// Read the `debug` object of a request. Unknown or mistyped fields are
    /// treated as unset.
    pub fn from_value(value: &Value) -> Self {
        let show_stats = value
            .get(WireKeys::SHOW_STATS)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let dump_to_file = value
            .get(WireKeys::DUMP_TO_FILE)
            .and_then(Value::as_str)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        Self {
            show_stats,
            dump_to_file,
            started: Instant::now(),
        }
    }
}

/// One inbound message after parsing.
pub struct Request {
    request_type: String,
    cookie: String,
    data: Value,
    connection: ConnectionId,
    link: ServerLink,
}

impl Request {
    pub fn new(
        link: ServerLink,
        connection: ConnectionId,
        request_type: impl Into<String>,
        cookie: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            request_type: request_type.into(),
            cookie: cookie.into(),
            data,
            connection,
            link,
        }
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// The full request object, envelope fields included.
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Field of the request object, `None` when absent or null.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|value| !value.is_null())
    }

    /// String field, empty when absent or not a string.
    pub fn string_field(&self, key: &str) -> String {
        self.field(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Write path of the server that received this request.
    pub fn link(&self) -> &ServerLink {
        &self.link
    }

    /// Successful response carrying `data`.
    ///
    /// Degrades to an error if `data` carries the reserved envelope fields.
    pub fn reply(&self, data: Value) -> Response {
        let mut response = Response::new(self);
        response.set_data(data);
        response
    }

    pub fn report_error(&self, message: impl Into<String>) -> Response {
        let mut response = Response::new(self);
        response.set_error(message);
        response
    }

    /// Push a `progress` notification for this request.
    ///
    /// # Panics
    ///
    /// If `current` lies outside `[min, max]` or `message` is empty.
    pub fn report_progress(&self, min: i64, current: i64, max: i64, message: &str) {
        self.link.write_progress(self, min, current, max, message);
    }

    /// Push a `message` notification for this request. Empty messages are
    /// dropped.
    pub fn report_message(&self, message: &str, title: &str) {
        self.link.write_message(self, message, title);
    }
}

impl Reporter for Request {
    fn progress(&self, message: &str, fraction: f32) {
        if !(0.0..=1.0).contains(&fraction) || message.is_empty() {
            return;
        }
        let current = (fraction * 1000.0).round() as i64;
        self.report_progress(0, current, 1000, message);
    }

    fn message(&self, message: &str, title: &str) {
        self.report_message(message, title);
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Unknown,
    Data(Value),
    Error(String),
}

/// Outcome of a request: exactly one of data or error, assigned once.
#[derive(Debug, Clone)]
pub struct Response {
    request_type: String,
    cookie: String,
    payload: Payload,
}

impl Response {
    pub fn new(request: &Request) -> Self {
        Self {
            request_type: request.request_type.clone(),
            cookie: request.cookie.clone(),
            payload: Payload::Unknown,
        }
    }

    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Complete with `data`, which must be an object or null.
    ///
    /// # Panics
    ///
    /// If the response was already completed.
    pub fn set_data(&mut self, data: Value) {
        assert!(
            matches!(self.payload, Payload::Unknown),
            "response completed twice"
        );
        assert!(
            data.is_object() || data.is_null(),
            "response data must be an object"
        );

        let reserved = data.get(WireKeys::COOKIE).is_some() || data.get(WireKeys::TYPE).is_some();
        if reserved {
            self.set_error("Response contains cookie or type field.");
            return;
        }
        self.payload = Payload::Data(data);
    }

    /// Complete with an error message.
    ///
    /// # Panics
    ///
    /// If the response was already completed.
    pub fn set_error(&mut self, message: impl Into<String>) {
        assert!(
            matches!(self.payload, Payload::Unknown),
            "response completed twice"
        );
        self.payload = Payload::Error(message.into());
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.payload, Payload::Unknown)
    }

    pub fn is_error(&self) -> bool {
        assert!(self.is_complete(), "response is not complete");
        matches!(self.payload, Payload::Error(_))
    }

    /// Error text; empty for a successful response.
    pub fn error_message(&self) -> &str {
        match &self.payload {
            Payload::Unknown => panic!("response is not complete"),
            Payload::Error(message) => message,
            Payload::Data(_) => "",
        }
    }

    /// Payload of a successful response; null for an error.
    pub fn data(&self) -> &Value {
        match &self.payload {
            Payload::Unknown => panic!("response is not complete"),
            Payload::Data(data) => data,
            Payload::Error(_) => &Value::Null,
        }
    }
}
