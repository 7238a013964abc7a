//! Asynchronous outcome delivery for get and set operations.

use std::{
    collections::VecDeque,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{error, warn};

use crate::{
    connection::{Connection, ConnectionInner},
    data_type::Value,
    envelope::ValueEnvelope,
    error::{Error, Result},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Get,
    Set,
}

/// One outcome reported for a [`Request`]
#[derive(Clone)]
pub struct Response {
    source: Weak<ConnectionInner>,
    source_name: String,
    success: bool,
    error: Option<Error>,
    tag: Option<Value>,
    last: bool,
    poop: Option<ValueEnvelope>,
}

impl Response {
    pub(crate) fn from_source(
        source: Weak<ConnectionInner>,
        source_name: &str,
        outcome: Result<Option<ValueEnvelope>>,
        tag: Option<Value>,
    ) -> Response {
        let (success, error, poop) = match outcome {
            Ok(poop) => (true, None, poop),
            Err(e) => (false, Some(e), None),
        };
        Response {
            source,
            source_name: source_name.to_owned(),
            success,
            error,
            tag,
            last: true,
            poop,
        }
    }

    /// A successful, terminal response
    pub fn success(source: &Connection, poop: Option<ValueEnvelope>, tag: Option<Value>) -> Self {
        Response::from_source(source.downgrade(), source.name(), Ok(poop), tag)
    }

    /// A failed, terminal response
    pub fn failure(source: &Connection, error: Error, tag: Option<Value>) -> Self {
        Response::from_source(source.downgrade(), source.name(), Err(error), tag)
    }

    /// Mark whether more responses are to follow this one
    #[must_use]
    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    pub fn source(&self) -> Option<Connection> {
        self.source.upgrade().map(Connection::from_inner)
    }
    pub fn source_name(&self) -> &str {
        &self.source_name
    }
    pub fn is_success(&self) -> bool {
        self.success
    }
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }
    /// For set requests, the value that was written
    pub fn tag(&self) -> Option<&Value> {
        self.tag.as_ref()
    }
    /// Is this the final response of its request?
    pub fn is_last(&self) -> bool {
        self.last
    }
    pub fn poop(&self) -> Option<&ValueEnvelope> {
        self.poop.as_ref()
    }
    pub fn value(&self) -> Option<&Value> {
        self.poop.as_ref().map(ValueEnvelope::value)
    }

    /// The envelope of a successful response, or its error
    pub fn into_result(self) -> Result<Option<ValueEnvelope>> {
        match (self.success, self.error) {
            (true, _) => Ok(self.poop),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::RemoteOperation {
                name: self.source_name,
                reason: "unspecified failure".into(),
            }),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("source", &self.source_name)
            .field("success", &self.success)
            .field("error", &self.error)
            .field("tag", &self.tag)
            .field("last", &self.last)
            .field("poop", &self.poop)
            .finish()
    }
}

/// Receives each [`Response`] added to a [`Request`]
///
/// Called on whichever thread added the response. For requests made through a
/// [`Connection`] this is the connection's dispatch task, so implementations
/// should return quickly.
pub trait ResponseListener: Send + Sync {
    fn response_received(&self, request: &Request, response: &Response);
}

impl<F> ResponseListener for F
where
    F: Fn(&Request, &Response) + Send + Sync,
{
    fn response_received(&self, request: &Request, response: &Response) {
        self(request, response)
    }
}

pub(crate) struct RequestInner {
    kind: RequestKind,
    connection: Weak<ConnectionInner>,
    name: String,
    capacity: usize,
    listener: Option<Arc<dyn ResponseListener>>,
    responses: Mutex<VecDeque<Response>>,
    done: Condvar,
    /// A terminal response was delivered through [`Request::finish`]
    finished: AtomicBool,
}

/// A pending get or set on one [`Connection`], collecting its [`Response`]s
///
/// Only the most recent `capacity` responses are retained. The request is
/// complete when the most recent response is terminal.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub fn new(
        connection: &Connection,
        kind: RequestKind,
        capacity: usize,
        listener: Option<Arc<dyn ResponseListener>>,
    ) -> Request {
        Request {
            inner: Arc::new(RequestInner {
                kind,
                connection: connection.downgrade(),
                name: connection.name().to_owned(),
                capacity: capacity.max(1),
                listener,
                responses: Mutex::new(VecDeque::new()),
                done: Condvar::new(),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
    /// Name of the connection this request is bound to
    pub fn name(&self) -> &str {
        &self.inner.name
    }
    pub(crate) fn has_listener(&self) -> bool {
        self.inner.listener.is_some()
    }
    pub fn connection(&self) -> Option<Connection> {
        self.inner.connection.upgrade().map(Connection::from_inner)
    }

    /// Record a response, then pass it to the listener
    ///
    /// Responses from a connection other than the one this request is bound to
    /// are rejected. Beyond the retention capacity, the oldest response is
    /// dropped.
    pub fn add_response(&self, response: Response) -> Result<()> {
        if !Weak::ptr_eq(&self.inner.connection, &response.source) {
            return Err(Error::ForeignResponse {
                request: self.inner.name.clone(),
                response: response.source_name,
            });
        }
        let last = response.is_last();
        {
            let mut responses = self.inner.responses.lock().unwrap();
            responses.push_back(response.clone());
            while responses.len() > self.inner.capacity {
                responses.pop_front();
            }
        }
        if let Some(listener) = &self.inner.listener
            && catch_unwind(AssertUnwindSafe(|| listener.response_received(self, &response)))
                .is_err()
        {
            error!("Response listener for '{}' panicked", self.inner.name);
        }
        if last {
            self.inner.done.notify_all();
        }
        Ok(())
    }

    /// Deliver a terminal response, unless one was already delivered this way
    pub(crate) fn finish(&self, response: Response) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.add_response(response.with_last(true)) {
            warn!("Dropping response: {e}");
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RequestInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<RequestInner>) -> Option<Request> {
        weak.upgrade().map(|inner| Request { inner })
    }

    /// Is the most recently retained response terminal?
    pub fn is_completed(&self) -> bool {
        self.inner
            .responses
            .lock()
            .unwrap()
            .back()
            .is_some_and(Response::is_last)
    }

    pub fn responses(&self) -> Vec<Response> {
        self.inner.responses.lock().unwrap().iter().cloned().collect()
    }

    /// The oldest retained response
    pub fn first_response(&self) -> Option<Response> {
        self.inner.responses.lock().unwrap().front().cloned()
    }

    pub fn last_response(&self) -> Option<Response> {
        self.inner.responses.lock().unwrap().back().cloned()
    }

    /// Block until a terminal response arrives, and return it
    pub fn wait_until_done(&self) -> Response {
        let responses = self.inner.responses.lock().unwrap();
        let responses = self
            .inner
            .done
            .wait_while(responses, |r| !r.back().is_some_and(Response::is_last))
            .unwrap();
        // The wait only ends with a terminal response at the back
        responses.back().cloned().unwrap()
    }

    /// Block up to `timeout` for a terminal response
    pub fn wait_until_done_for(&self, timeout: Duration) -> Option<Response> {
        let responses = self.inner.responses.lock().unwrap();
        let (responses, _) = self
            .inner
            .done
            .wait_timeout_while(responses, timeout, |r| {
                !r.back().is_some_and(Response::is_last)
            })
            .unwrap();
        responses.back().filter(|r| r.is_last()).cloned()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("capacity", &self.inner.capacity)
            .field("completed", &self.is_completed())
            .finish()
    }
}
