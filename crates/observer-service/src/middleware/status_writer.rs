//! Status-capturing response writer and its object pool.
//!
//! [`StatusWriter`] sits between the tracing/metrics middleware and the real
//! sink. It forwards every call unchanged and remembers the first status the
//! handler committed, so the middleware can label the span and metrics with
//! the status the client actually received.
//!
//! # First write wins
//!
//! A single `written` flag is checked before every intercepted call:
//! - `write_header(code)` first: records `code`.
//! - `write(bytes)` first: records nothing, status stays `200 OK`.
//! - Anything after the first call: forwarded, not recorded.
//!
//! # Pooling
//!
//! The recorded state is checked out of a [`WriterPool`] on acquire and
//! returned on release. Acquire hands out the boxed state by value and release
//! consumes the writer, so a state can never be shared by two requests or
//! returned twice. [`FreshWriters`] allocates per request and is observably
//! identical; tests swap between the two.

use super::sink::ResponseSink;
use axum::http::{HeaderMap, StatusCode};
use std::fmt;
use std::io;
use std::sync::{Mutex, PoisonError};

/// Default number of idle states a [`SharedWriterPool`] keeps around.
pub const DEFAULT_MAX_IDLE_WRITERS: usize = 1024;

/// Per-request recording state held by a [`StatusWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturedStatus {
    written: bool,
    status: StatusCode,
}

impl Default for CapturedStatus {
    fn default() -> Self {
        Self {
            written: false,
            status: StatusCode::OK,
        }
    }
}

impl CapturedStatus {
    /// Clear the state back to "nothing written, 200 OK".
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn written(&self) -> bool {
        self.written
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Source of [`CapturedStatus`] states.
///
/// Implementations must be safe for concurrent `take`/`put_back` from many
/// request workers at once.
pub trait WriterPool: Send + Sync + fmt::Debug {
    /// Check out a reset state. Ownership moves to the caller.
    fn take(&self) -> Box<CapturedStatus>;

    /// Return a state after the request is done with it.
    fn put_back(&self, state: Box<CapturedStatus>);
}

/// Mutex-guarded free list of recording states.
#[derive(Debug)]
pub struct SharedWriterPool {
    idle: Mutex<Vec<Box<CapturedStatus>>>,
    max_idle: usize,
}

impl Default for SharedWriterPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_WRITERS)
    }
}

impl SharedWriterPool {
    /// Create a pool that keeps at most `max_idle` states between requests.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Number of states currently parked in the pool.
    pub fn idle_len(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl WriterPool for SharedWriterPool {
    fn take(&self) -> Box<CapturedStatus> {
        let recycled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();

        match recycled {
            Some(mut state) => {
                state.reset();
                state
            }
            None => Box::default(),
        }
    }

    fn put_back(&self, mut state: Box<CapturedStatus>) {
        state.reset();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(state);
        }
    }
}

/// Allocates a fresh state for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct FreshWriters;

impl WriterPool for FreshWriters {
    fn take(&self) -> Box<CapturedStatus> {
        Box::default()
    }

    fn put_back(&self, _state: Box<CapturedStatus>) {}
}

/// Response sink wrapper that records the first committed status.
pub struct StatusWriter<'a> {
    sink: &'a mut dyn ResponseSink,
    state: Option<Box<CapturedStatus>>,
    pool: &'a dyn WriterPool,
}

impl<'a> StatusWriter<'a> {
    /// Check out a reset recording state from `pool` and bind it to `sink`.
    pub fn acquire(pool: &'a dyn WriterPool, sink: &'a mut dyn ResponseSink) -> Self {
        Self {
            sink,
            state: Some(pool.take()),
            pool,
        }
    }

    /// Unbind the sink and hand the recording state back to the pool.
    ///
    /// Dropping the writer does the same; this spells it out at call sites.
    pub fn release(self) {
        drop(self);
    }

    /// Whether any header commit or body write has happened.
    pub fn written(&self) -> bool {
        self.state.as_deref().is_some_and(CapturedStatus::written)
    }

    /// The first committed status, or `200 OK` when nothing committed one.
    pub fn status(&self) -> StatusCode {
        self.state
            .as_deref()
            .map_or(StatusCode::OK, CapturedStatus::status)
    }

    fn record(&mut self, status: Option<StatusCode>) {
        if let Some(state) = self.state.as_deref_mut() {
            if !state.written {
                state.written = true;
                if let Some(code) = status {
                    state.status = code;
                }
            }
        }
    }
}

impl ResponseSink for StatusWriter<'_> {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.sink.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.record(Some(status));
        self.sink.write_header(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.record(None);
        self.sink.write(buf)
    }
}

impl Drop for StatusWriter<'_> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.put_back(state);
        }
    }
}

impl fmt::Debug for StatusWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusWriter")
            .field("written", &self.written())
            .field("status", &self.status())
            .finish()
    }
}
