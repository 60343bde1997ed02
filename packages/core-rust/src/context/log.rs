use std::time::{Instant, SystemTime, UNIX_EPOCH};

use http::Method;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Error;
use crate::future::Promise;

/// The terminal record of one request, produced exactly once per [`RequestLog`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestLogRecord {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    /// Milliseconds since the Unix epoch at which the request started.
    pub start_time_millis: u64,
    pub request_length: u64,
    pub response_length: u64,
    pub request_duration_ms: Option<u64>,
    pub total_duration_ms: u64,
    /// `None` on success.
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct Progress {
    host: Option<String>,
    request_length: u64,
    response_length: u64,
    request_end: Option<Instant>,
    ended: bool,
}

/// Append-only request log builder owned by one context.
#[derive(Debug)]
pub struct RequestLog {
    method: Method,
    path: String,
    started_at: Instant,
    start_time_millis: u64,
    progress: Mutex<Progress>,
    completion: Promise<RequestLogRecord>,
}

impl RequestLog {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            method,
            path: path.into(),
            started_at: Instant::now(),
            start_time_millis,
            progress: Mutex::new(Progress::default()),
            completion: Promise::new(),
        }
    }

    /// Records the authority the request was addressed to.
    pub fn start_request(&self, host: impl Into<String>) {
        let mut progress = self.progress.lock();
        if !progress.ended {
            progress.host = Some(host.into());
        }
    }

    pub fn increase_request_length(&self, delta: u64) {
        let mut progress = self.progress.lock();
        progress.request_length = progress.request_length.saturating_add(delta);
    }

    /// Marks the request side as fully received.
    pub fn end_request(&self) {
        let mut progress = self.progress.lock();
        if progress.request_end.is_none() {
            progress.request_end = Some(Instant::now());
        }
    }

    pub fn increase_response_length(&self, delta: u64) {
        let mut progress = self.progress.lock();
        progress.response_length = progress.response_length.saturating_add(delta);
    }

    /// Produces the terminal record. Only the first call has an effect.
    ///
    /// Returns `true` if this call produced the record.
    pub fn end_response(&self, outcome: Result<(), &Error>) -> bool {
        let record = {
            let mut progress = self.progress.lock();
            if progress.ended {
                return false;
            }
            progress.ended = true;
            let millis = |d: std::time::Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
            RequestLogRecord {
                method: self.method.to_string(),
                path: self.path.clone(),
                host: progress.host.clone(),
                start_time_millis: self.start_time_millis,
                request_length: progress.request_length,
                response_length: progress.response_length,
                request_duration_ms: progress
                    .request_end
                    .map(|end| millis(end.duration_since(self.started_at))),
                total_duration_ms: millis(self.started_at.elapsed()),
                error: outcome.err().map(ToString::to_string),
            }
        };
        self.completion.complete(record)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completion.is_done()
    }

    /// Resolves with the terminal record once [`end_response`](Self::end_response) ran.
    #[must_use]
    pub fn when_complete(&self) -> Promise<RequestLogRecord> {
        self.completion.clone()
    }
}
