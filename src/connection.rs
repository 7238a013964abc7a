//! Per-name connection state machine and push subscription management
//!
//! Provider callbacks arrive on arbitrary threads. They never touch connection
//! state directly: each is turned into a [`ChannelEvent`] and queued for the
//! connection's dispatch task, which applies state changes and calls property
//! listeners in arrival order. Synchronous gets and puts complete straight from
//! the provider callback, so they may be used from inside a listener.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc as sync_mpsc,
    },
    time::Duration,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError};
use tracing::{Instrument, debug, debug_span, error, trace, warn};

use crate::{
    connector::ConnectorInner,
    data_type::{DataType, Value},
    dbr::{Dbr, DbrCategory, DbrType},
    envelope::ValueEnvelope,
    error::{Error, Result},
    marshal::{from_wire, metadata_from, to_wire},
    metadata::MetaData,
    providers::{Channel, ChannelState, MonitorCallback, MonitorId, ProviderError, StateCallback},
    request::{Request, RequestKind, Response, ResponseListener},
    scheduler::ScheduledTask,
    status::{State, Status},
    timestamp::Timestamp,
};

/// Observable aspects of a [`Connection`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Property {
    /// The converted value of every pushed update
    Value,
    /// The full envelope of every pushed update
    Poop,
    /// Merged connectivity and alarm status
    Status,
    MetaData,
    /// Alarm bits only
    Alarm,
}

/// A change delivered to a [`PropertyChangeListener`]
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyChange {
    Value { old: Option<Value>, new: Value },
    Poop(ValueEnvelope),
    Status { old: Status, new: Status },
    Alarm { old: Status, new: Status },
    MetaData(MetaData),
}

impl PropertyChange {
    pub fn property(&self) -> Property {
        match self {
            PropertyChange::Value { .. } => Property::Value,
            PropertyChange::Poop(_) => Property::Poop,
            PropertyChange::Status { .. } => Property::Status,
            PropertyChange::Alarm { .. } => Property::Alarm,
            PropertyChange::MetaData(_) => Property::MetaData,
        }
    }
}

/// Receives property changes of a [`Connection`]
///
/// Always called from the connection's dispatch task, one change at a time.
pub trait PropertyChangeListener: Send + Sync {
    fn property_changed(&self, connection: &Connection, change: &PropertyChange);
}

impl<F> PropertyChangeListener for F
where
    F: Fn(&Connection, &PropertyChange) + Send + Sync,
{
    fn property_changed(&self, connection: &Connection, change: &PropertyChange) {
        self(connection, change)
    }
}

/// Registration handle returned by [`Connection::add_property_change_listener`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type MetaWaiter = Box<dyn FnOnce(MetaData) + Send>;

/// Everything the dispatch task is asked to handle
pub(crate) enum ChannelEvent {
    State(ChannelState),
    Update(Result<Dbr, ProviderError>),
    Completed(Request, Response),
    MetaData(Result<Dbr, ProviderError>),
    ConnectTimeout,
    Notify(Vec<PropertyChange>),
    /// Acknowledged once every event queued before it has been handled
    Barrier(sync_mpsc::Sender<()>),
}

struct ConnectionState {
    connectivity: State,
    alarm: Status,
    meta: Option<MetaData>,
    meta_waiters: Vec<MetaWaiter>,
    meta_fetching: bool,
    poop: Option<ValueEnvelope>,
    listeners: Vec<(ListenerId, Property, Arc<dyn PropertyChangeListener>)>,
    next_listener: u64,
    monitor: Option<MonitorId>,
    guard: Option<ScheduledTask>,
}

impl ConnectionState {
    fn status(&self) -> Status {
        Status::of(self.connectivity).merge(self.alarm)
    }
    fn wants_monitor(&self) -> bool {
        self.listeners
            .iter()
            .any(|(_, p, _)| matches!(p, Property::Value | Property::Poop))
    }
}

pub(crate) struct ConnectionInner {
    me: Weak<ConnectionInner>,
    name: String,
    data_type: DataType,
    connector: Weak<ConnectorInner>,
    read_only: bool,
    timeout: Duration,
    capacity: usize,
    channel: OnceLock<Arc<dyn Channel>>,
    events: UnboundedSender<ChannelEvent>,
    state: Mutex<ConnectionState>,
    changed: Condvar,
    destroyed: AtomicBool,
}

/// A handle onto one named channel
///
/// Handles are cheap to clone and all refer to the same connection. The
/// connection is destroyed explicitly with [`Connection::destroy`], when its
/// connector shuts down, or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

async fn dispatch_events(
    connection: Weak<ConnectionInner>,
    mut events: UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        inner.handle(event);
    }
    trace!("Event dispatch finished");
}

impl ConnectionInner {
    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap()
    }

    fn handle_for(&self) -> Option<Connection> {
        self.me.upgrade().map(Connection::from_inner)
    }

    fn send(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            trace!("Event queue for {} is closed", self.name);
        }
    }

    /// Ask the provider to send whatever it has buffered
    fn flush(&self) {
        if let Some(connector) = self.connector.upgrade() {
            connector.provider().flush();
        }
    }

    /// Wait until every event queued so far has been dispatched
    pub(crate) fn drain(&self, timeout: Duration) {
        let (done, finished) = sync_mpsc::channel();
        if self.events.send(ChannelEvent::Barrier(done)).is_err() {
            return;
        }
        if finished.recv_timeout(timeout).is_err() {
            warn!("Events for {} still pending after {timeout:?}", self.name);
        }
    }

    /// The metadata to use when none could be fetched
    fn fallback_meta(&self) -> MetaData {
        self.connector
            .upgrade()
            .and_then(|c| c.default_metadata(&self.name))
            .unwrap_or_else(|| MetaData::invalid(&self.name, self.data_type))
    }

    fn wire_type(&self, category: DbrCategory) -> Option<DbrType> {
        let channel = self.channel.get()?;
        Some(DbrType::new(
            self.data_type.wire_type(channel.native_type()),
            category,
        ))
    }

    fn handle(&self, event: ChannelEvent) {
        let destroyed = self.destroyed.load(Ordering::SeqCst);
        match event {
            ChannelEvent::Notify(changes) => self.notify(&changes),
            ChannelEvent::Completed(request, response) => request.finish(response),
            ChannelEvent::Barrier(done) => {
                let _ = done.send(());
            }
            _ if destroyed => trace!("Ignoring event on destroyed connection {}", self.name),
            ChannelEvent::State(state) => self.on_state(state),
            ChannelEvent::ConnectTimeout => self.on_connect_timeout(),
            ChannelEvent::Update(Ok(dbr)) => self.on_update(dbr),
            ChannelEvent::Update(Err(e)) => warn!("Update for {} failed: {e}", self.name),
            ChannelEvent::MetaData(result) => self.on_metadata(result),
        }
    }

    fn on_state(&self, state: ChannelState) {
        if state == ChannelState::Closed {
            debug!("Channel {} closed remotely", self.name);
            self.destroy();
            return;
        }
        let (old, new) = {
            let mut st = self.lock();
            let old = st.status();
            match (state, st.connectivity) {
                (_, State::Closed) => return,
                (ChannelState::Connected, _) => {
                    st.connectivity = State::Connected;
                    if let Some(guard) = st.guard.take() {
                        guard.cancel();
                    }
                    self.ensure_monitor(&mut st);
                    if !st.meta_waiters.is_empty() {
                        self.start_meta_fetch(&mut st);
                    }
                }
                (ChannelState::Disconnected, State::Connected) => {
                    st.connectivity = State::Lost;
                }
                _ => return,
            }
            (old, st.status())
        };
        debug!("{}: {} -> {}", self.name, old.connectivity(), new.connectivity());
        self.changed.notify_all();
        if old != new {
            self.notify(&[PropertyChange::Status { old, new }]);
        }
    }

    fn on_connect_timeout(&self) {
        let (old, new, waiters) = {
            let mut st = self.lock();
            if st.connectivity != State::Initial {
                return;
            }
            let old = st.status();
            st.connectivity = State::Failed;
            st.guard = None;
            (old, st.status(), std::mem::take(&mut st.meta_waiters))
        };
        warn!("{} did not connect in time", self.name);
        self.changed.notify_all();
        self.notify(&[PropertyChange::Status { old, new }]);
        let fallback = self.fallback_meta();
        for waiter in waiters {
            waiter(fallback.clone());
        }
    }

    /// Convert a pushed payload and record it as the latest observation
    fn on_update(&self, dbr: Dbr) {
        let value = match from_wire(dbr.value(), self.data_type) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping update for {}: {e}", self.name);
                return;
            }
        };
        let alarm = Status::of(State::from_severity(
            dbr.status().map(|s| s.severity).unwrap_or(0),
        ));
        let timestamp = dbr.timestamp().map(Timestamp::from);
        let mut changes = Vec::with_capacity(4);
        {
            let mut st = self.lock();
            if st.connectivity == State::Closed {
                return;
            }
            let old_status = st.status();
            let old_alarm = st.alarm;
            st.alarm = alarm;
            let meta = st.meta.clone().unwrap_or_else(|| self.fallback_meta());
            let poop = ValueEnvelope::new(value.clone(), timestamp, meta, st.status(), Some(dbr));
            let old_value = st.poop.replace(poop.clone()).map(ValueEnvelope::into_value);
            if old_status != st.status() {
                changes.push(PropertyChange::Status {
                    old: old_status,
                    new: st.status(),
                });
            }
            if old_alarm != alarm {
                changes.push(PropertyChange::Alarm {
                    old: old_alarm,
                    new: alarm,
                });
            }
            changes.push(PropertyChange::Value {
                old: old_value,
                new: value,
            });
            changes.push(PropertyChange::Poop(poop));
        }
        trace!("{} updated", self.name);
        self.notify(&changes);
    }

    fn on_metadata(&self, result: Result<Dbr, ProviderError>) {
        let (meta, waiters) = {
            let mut st = self.lock();
            st.meta_fetching = false;
            let waiters = std::mem::take(&mut st.meta_waiters);
            match result {
                Ok(dbr) => {
                    let meta = self.build_meta(&dbr);
                    st.meta = Some(meta.clone());
                    (Ok(meta), waiters)
                }
                Err(e) => (Err(e), waiters),
            }
        };
        let meta = match meta {
            Ok(meta) => {
                self.notify(&[PropertyChange::MetaData(meta.clone())]);
                meta
            }
            Err(e) => {
                warn!("Metadata fetch for {} failed: {e}", self.name);
                self.fallback_meta()
            }
        };
        for waiter in waiters {
            waiter(meta.clone());
        }
    }

    fn build_meta(&self, dbr: &Dbr) -> MetaData {
        let meta = metadata_from(&self.name, self.data_type, dbr);
        let Some(channel) = self.channel.get() else {
            return meta;
        };
        // The payload arrives in the requested type, not the channel's own
        let mut builder = meta
            .to_builder()
            .access(channel.access())
            .element_count(channel.element_count());
        if let Some(native) = channel.native_type() {
            builder = builder.remote_type(native);
        }
        if let Some(host) = channel.host_name() {
            builder = builder.host(&host);
        }
        builder.build()
    }

    /// Subscribe if value listeners exist and the channel is connected
    fn ensure_monitor(&self, st: &mut ConnectionState) {
        if st.monitor.is_some() || st.connectivity != State::Connected || !st.wants_monitor() {
            return;
        }
        let (Some(channel), Some(data_type)) =
            (self.channel.get(), self.wire_type(DbrCategory::Time))
        else {
            return;
        };
        let events = self.events.clone();
        let callback: MonitorCallback = Arc::new(move |update| {
            let _ = events.send(ChannelEvent::Update(update));
        });
        match channel.subscribe(data_type, 0, callback) {
            Ok(id) => {
                debug!("Subscribed to {}", self.name);
                st.monitor = Some(id);
                self.flush();
            }
            Err(e) => warn!("Could not subscribe to {}: {e}", self.name),
        }
    }

    fn start_meta_fetch(&self, st: &mut ConnectionState) {
        if st.meta_fetching || st.connectivity != State::Connected {
            return;
        }
        let (Some(channel), Some(data_type)) =
            (self.channel.get(), self.wire_type(DbrCategory::Control))
        else {
            return;
        };
        st.meta_fetching = true;
        let events = self.events.clone();
        channel.get(
            data_type,
            0,
            Box::new(move |result| {
                let _ = events.send(ChannelEvent::MetaData(result));
            }),
        );
        self.flush();
    }

    fn notify(&self, changes: &[PropertyChange]) {
        let Some(connection) = self.handle_for() else {
            return;
        };
        let listeners = self.lock().listeners.clone();
        for change in changes {
            let property = change.property();
            for (_, _, listener) in listeners.iter().filter(|(_, p, _)| *p == property) {
                if catch_unwind(AssertUnwindSafe(|| {
                    listener.property_changed(&connection, change)
                }))
                .is_err()
                {
                    error!("{property:?} listener on {} panicked", self.name);
                }
            }
        }
    }

    /// Build an envelope for a value read on demand
    fn envelope(&self, dbr: Dbr) -> Result<ValueEnvelope> {
        let value = from_wire(dbr.value(), self.data_type)?;
        let alarm = Status::of(State::from_severity(
            dbr.status().map(|s| s.severity).unwrap_or(0),
        ));
        let timestamp = dbr.timestamp().map(Timestamp::from);
        let (status, meta) = {
            let st = self.lock();
            (Status::of(st.connectivity).merge(alarm), st.meta.clone())
        };
        let meta = meta.unwrap_or_else(|| self.fallback_meta());
        Ok(ValueEnvelope::new(value, timestamp, meta, status, Some(dbr)))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (old, new, monitor, waiters) = {
            let mut st = self.lock();
            let old = st.status();
            st.connectivity = State::Closed;
            st.alarm = Status::EMPTY;
            if let Some(guard) = st.guard.take() {
                guard.cancel();
            }
            (
                old,
                st.status(),
                st.monitor.take(),
                std::mem::take(&mut st.meta_waiters),
            )
        };
        self.changed.notify_all();
        if let Some(channel) = self.channel.get() {
            if let Some(monitor) = monitor {
                channel.unsubscribe(monitor);
            }
            channel.destroy();
        }
        debug!("Destroyed connection {}", self.name);
        if old != new {
            self.send(ChannelEvent::Notify(vec![PropertyChange::Status { old, new }]));
        }
        let fallback = self.fallback_meta();
        for waiter in waiters {
            waiter(fallback.clone());
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if *self.destroyed.get_mut() {
            return;
        }
        let st = self.state.get_mut().unwrap();
        if let Some(guard) = st.guard.take() {
            guard.cancel();
        }
        let monitor = st.monitor.take();
        if let Some(channel) = self.channel.get() {
            if let Some(monitor) = monitor {
                channel.unsubscribe(monitor);
            }
            channel.destroy();
        }
    }
}

/// Route an asynchronous completion through the connection's dispatch task
///
/// Falls back to completing directly when the connection is gone.
fn complete_async(connection: &Weak<ConnectionInner>, request: Request, response: Response) {
    let Some(inner) = connection.upgrade() else {
        request.finish(response);
        return;
    };
    if let Err(SendError(ChannelEvent::Completed(request, response))) =
        inner.events.send(ChannelEvent::Completed(request, response))
    {
        request.finish(response);
    }
}

impl Connection {
    /// Open a connection on behalf of a connector
    pub(crate) fn open(
        connector: &Arc<ConnectorInner>,
        name: &str,
        data_type: DataType,
    ) -> Result<Connection> {
        let dispatch = connector.dispatch_handle()?;
        let settings = connector.settings();
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|me| ConnectionInner {
            me: me.clone(),
            name: name.to_owned(),
            data_type,
            connector: Arc::downgrade(connector),
            read_only: settings.read_only,
            timeout: settings.timeout,
            capacity: settings.request_capacity,
            channel: OnceLock::new(),
            events,
            state: Mutex::new(ConnectionState {
                connectivity: State::Initial,
                alarm: Status::EMPTY,
                meta: None,
                meta_waiters: Vec::new(),
                meta_fetching: false,
                poop: None,
                listeners: Vec::new(),
                next_listener: 0,
                monitor: None,
                guard: None,
            }),
            changed: Condvar::new(),
            destroyed: AtomicBool::new(false),
        });

        let state_events = inner.events.clone();
        let on_state: StateCallback = Box::new(move |state| {
            let _ = state_events.send(ChannelEvent::State(state));
        });
        match connector.provider().create_channel(name, on_state) {
            Ok(channel) => {
                let _ = inner.channel.set(channel);
                let weak = Arc::downgrade(&inner);
                let guard = connector.schedule(
                    move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.send(ChannelEvent::ConnectTimeout);
                        }
                    },
                    settings.connection_timeout,
                    None,
                )?;
                inner.lock().guard = Some(guard);
            }
            Err(e) => {
                warn!("Could not create channel {name}: {e}");
                inner.lock().connectivity = State::Failed;
            }
        }
        dispatch.spawn(
            dispatch_events(Arc::downgrade(&inner), receiver)
                .instrument(debug_span!("connection", name = name)),
        );
        connector.register(&inner);
        debug!("Opened connection {name} as {data_type}");
        Ok(Connection { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Connection {
        Connection { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn data_type(&self) -> DataType {
        self.inner.data_type
    }

    pub fn status(&self) -> Status {
        self.inner.lock().status()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connectivity == State::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Connected, with valid metadata already fetched
    pub fn is_ready(&self) -> bool {
        let st = self.inner.lock();
        st.connectivity == State::Connected && st.meta.as_ref().is_some_and(MetaData::is_valid)
    }

    /// Does the latest update carry a warning, alarm or invalid severity?
    pub fn is_alarm_set(&self) -> bool {
        let alarm = self.inner.lock().alarm;
        [State::Warning, State::Alarm, State::Invalid]
            .into_iter()
            .any(|s| alarm.is_set(s))
    }

    /// The most recent pushed update, if any
    pub fn last_poop(&self) -> Option<ValueEnvelope> {
        self.inner.lock().poop.clone()
    }

    /// Listeners currently interested in pushed values
    pub fn value_listener_count(&self) -> usize {
        self.inner
            .lock()
            .listeners
            .iter()
            .filter(|(_, p, _)| matches!(p, Property::Value | Property::Poop))
            .count()
    }

    pub fn has_subscription(&self) -> bool {
        self.inner.lock().monitor.is_some()
    }

    /// Do both handles refer to the same connection?
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register interest in one property
    ///
    /// Registering the first [`Property::Value`] or [`Property::Poop`] listener
    /// on a connected channel starts a push subscription.
    pub fn add_property_change_listener<L>(&self, property: Property, listener: L) -> ListenerId
    where
        L: PropertyChangeListener + 'static,
    {
        let mut st = self.inner.lock();
        let id = ListenerId(st.next_listener);
        st.next_listener += 1;
        let listener: Arc<dyn PropertyChangeListener> = Arc::new(listener);
        st.listeners.push((id, property, listener));
        if !self.is_destroyed() {
            self.inner.ensure_monitor(&mut st);
        }
        id
    }

    /// Unregister a listener. Removing the last value listener ends the
    /// subscription. Returns false for an unknown id.
    pub fn remove_property_change_listener(&self, id: ListenerId) -> bool {
        let monitor = {
            let mut st = self.inner.lock();
            let before = st.listeners.len();
            st.listeners.retain(|(lid, _, _)| *lid != id);
            if st.listeners.len() == before {
                return false;
            }
            if st.wants_monitor() {
                None
            } else {
                st.monitor.take()
            }
        };
        if let (Some(monitor), Some(channel)) = (monitor, self.inner.channel.get()) {
            debug!("Unsubscribing from {}", self.inner.name);
            channel.unsubscribe(monitor);
        }
        true
    }

    /// Block until connected, up to the connector timeout
    pub fn wait_till_connected(&self) -> bool {
        self.wait_till_connected_for(self.inner.timeout)
    }

    /// Block until connected or the wait can no longer succeed
    ///
    /// Returns early once the connection has failed or closed.
    pub fn wait_till_connected_for(&self, timeout: Duration) -> bool {
        let st = self.inner.lock();
        let (st, _) = self
            .inner
            .changed
            .wait_timeout_while(st, timeout, |st| {
                matches!(st.connectivity, State::Initial | State::Lost)
            })
            .unwrap();
        st.connectivity == State::Connected
    }

    fn connected_channel(&self) -> Result<Arc<dyn Channel>> {
        if self.is_destroyed() {
            return Err(Error::LifecycleViolation(format!(
                "connection {} has been destroyed",
                self.inner.name
            )));
        }
        let connectivity = self.inner.lock().connectivity;
        match self.inner.channel.get() {
            Some(channel) if connectivity == State::Connected => Ok(channel.clone()),
            _ => Err(Error::not_connected(
                &self.inner.name,
                format!("connection is {connectivity}"),
            )),
        }
    }

    /// The channel, after waiting up to the connector timeout for it to connect
    fn wait_for_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_destroyed() {
            self.wait_till_connected();
        }
        self.connected_channel()
    }

    fn read_request(&self, request: &Request, channel: &dyn Channel) {
        let Some(data_type) = self.inner.wire_type(DbrCategory::Time) else {
            return;
        };
        let source = self.downgrade();
        let name = self.inner.name.clone();
        let target = request.clone();
        let asynchronous = request.has_listener();
        channel.get(
            data_type,
            0,
            Box::new(move |result| {
                let outcome = match (result, source.upgrade()) {
                    (Ok(dbr), Some(inner)) => inner.envelope(dbr).map(Some),
                    (Ok(_), None) => Err(Error::not_connected(&name, "connection dropped")),
                    (Err(e), _) => Err(Error::remote(&name, e)),
                };
                let response = Response::from_source(source.clone(), &name, outcome, None);
                if asynchronous {
                    complete_async(&source, target, response);
                } else {
                    target.finish(response);
                }
            }),
        );
        self.inner.flush();
    }

    fn await_response(&self, request: &Request) -> Result<Option<ValueEnvelope>> {
        match request.wait_until_done_for(self.inner.timeout) {
            Some(response) => response.into_result(),
            None => Err(Error::RequestTimeout {
                name: self.inner.name.clone(),
                timeout: self.inner.timeout,
            }),
        }
    }

    /// Read the full envelope
    ///
    /// Waits up to the connector timeout for the connection, then as long again
    /// for the reply.
    pub fn get_poop(&self) -> Result<ValueEnvelope> {
        let channel = self.wait_for_channel()?;
        let request = Request::new(self, RequestKind::Get, 1, None);
        self.read_request(&request, channel.as_ref());
        self.await_response(&request)?.ok_or_else(|| Error::RemoteOperation {
            name: self.inner.name.clone(),
            reason: "reply carried no value".into(),
        })
    }

    /// Read the value, blocking up to the connector timeout
    pub fn get_value(&self) -> Result<Value> {
        self.get_poop().map(ValueEnvelope::into_value)
    }

    fn write_request(&self, request: &Request, channel: &dyn Channel, value: &Value) -> Result<()> {
        let wire = self.inner.data_type.wire_type(channel.native_type());
        let wire_value = to_wire(value, wire)?;
        let source = self.downgrade();
        let name = self.inner.name.clone();
        let target = request.clone();
        let tag = value.clone();
        let asynchronous = request.has_listener();
        channel.put(
            wire_value,
            Box::new(move |result| {
                let outcome = result.map(|_| None).map_err(|e| Error::remote(&name, e));
                let response = Response::from_source(source.clone(), &name, outcome, Some(tag));
                if asynchronous {
                    complete_async(&source, target, response);
                } else {
                    target.finish(response);
                }
            }),
        );
        self.inner.flush();
        Ok(())
    }

    /// Write a value, blocking until acknowledged or the connector timeout
    ///
    /// Succeeds without transmitting anything when the connector is read-only.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if self.inner.read_only {
            debug!("Read-only: not writing {value} to {}", self.inner.name);
            return Ok(());
        }
        let channel = self.wait_for_channel()?;
        let request = Request::new(self, RequestKind::Set, 1, None);
        self.write_request(&request, channel.as_ref(), &value)?;
        self.await_response(&request).map(|_| ())
    }

    fn new_async_request<L>(&self, kind: RequestKind, listener: L) -> Request
    where
        L: ResponseListener + 'static,
    {
        Request::new(self, kind, self.inner.capacity, Some(Arc::new(listener)))
    }

    /// Fail the request with a timeout unless it completes first
    fn arm_timeout(&self, request: &Request) {
        let Some(connector) = self.inner.connector.upgrade() else {
            return;
        };
        let pending = request.downgrade();
        let source = self.downgrade();
        let name = self.inner.name.clone();
        let timeout = self.inner.timeout;
        let armed = connector.schedule(
            move || {
                if let Some(request) = Request::upgrade(&pending) {
                    let response = Response::from_source(
                        source.clone(),
                        &name,
                        Err(Error::RequestTimeout {
                            name: name.clone(),
                            timeout,
                        }),
                        None,
                    );
                    complete_async(&source, request, response);
                }
            },
            timeout,
            None,
        );
        if let Err(e) = armed {
            warn!("No timeout for request on {}: {e}", self.inner.name);
        }
    }

    fn fail_now(&self, request: &Request, error: Error, tag: Option<Value>) {
        request.finish(Response::from_source(
            self.downgrade(),
            &self.inner.name,
            Err(error),
            tag,
        ));
    }

    /// Start a read, reporting the outcome through `listener`
    pub fn get_value_async<L>(&self, listener: L) -> Request
    where
        L: ResponseListener + 'static,
    {
        let request = self.new_async_request(RequestKind::Get, listener);
        match self.connected_channel() {
            Ok(channel) => {
                self.arm_timeout(&request);
                self.read_request(&request, channel.as_ref());
            }
            Err(e) => self.fail_now(&request, e, None),
        }
        request
    }

    /// Start a write, reporting the outcome through `listener`
    pub fn set_value_async<L>(&self, value: impl Into<Value>, listener: L) -> Request
    where
        L: ResponseListener + 'static,
    {
        let value = value.into();
        let request = self.new_async_request(RequestKind::Set, listener);
        if self.inner.read_only {
            complete_async(
                &self.downgrade(),
                request.clone(),
                Response::from_source(self.downgrade(), &self.inner.name, Ok(None), Some(value)),
            );
            return request;
        }
        let written = self
            .connected_channel()
            .and_then(|channel| {
                self.arm_timeout(&request);
                self.write_request(&request, channel.as_ref(), &value)
            });
        if let Err(e) = written {
            self.fail_now(&request, e, Some(value));
        }
        request
    }

    /// The channel metadata, fetched on first use
    ///
    /// Blocks until connected and the fetch returns, each bounded by the
    /// connector timeout. When either fails the connector's registered default
    /// for this name is returned, or [`MetaData::invalid`] without one; neither
    /// is cached.
    pub fn meta_data(&self) -> MetaData {
        if let Some(meta) = self.inner.lock().meta.clone() {
            return meta;
        }
        if !self.wait_till_connected() {
            return self.inner.fallback_meta();
        }
        let (Some(channel), Some(data_type)) = (
            self.inner.channel.get(),
            self.inner.wire_type(DbrCategory::Control),
        ) else {
            return self.inner.fallback_meta();
        };
        let (tx, rx) = sync_mpsc::channel();
        channel.get(
            data_type,
            0,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        self.inner.flush();
        match rx.recv_timeout(self.inner.timeout) {
            Ok(Ok(dbr)) => {
                let meta = self.inner.build_meta(&dbr);
                let meta = {
                    let mut st = self.inner.lock();
                    st.meta.get_or_insert(meta).clone()
                };
                self.inner
                    .send(ChannelEvent::Notify(vec![PropertyChange::MetaData(meta.clone())]));
                meta
            }
            Ok(Err(e)) => {
                warn!("Metadata fetch for {} failed: {e}", self.inner.name);
                self.inner.fallback_meta()
            }
            Err(_) => {
                warn!("Metadata fetch for {} timed out", self.inner.name);
                self.inner.fallback_meta()
            }
        }
    }

    /// Deliver the metadata to `callback` once available
    ///
    /// Called immediately when cached, otherwise from the dispatch task once
    /// the fetch finishes or the connection fails.
    pub fn meta_data_async<F>(&self, callback: F)
    where
        F: FnOnce(MetaData) + Send + 'static,
    {
        let mut st = self.inner.lock();
        if let Some(meta) = st.meta.clone() {
            drop(st);
            callback(meta);
            return;
        }
        if self.is_destroyed() || st.connectivity == State::Failed {
            drop(st);
            callback(self.inner.fallback_meta());
            return;
        }
        st.meta_waiters.push(Box::new(callback));
        self.inner.start_meta_fetch(&mut st);
    }

    /// Close the connection for good. Later calls do nothing.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("data_type", &self.inner.data_type)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, time::SystemTime};

    use super::*;
    use crate::{
        connector::ConnectorBuilder,
        dbr::{AlarmStatus, DbrValue},
        providers::MemoryProvider,
    };

    #[test]
    fn updates_after_destroy_are_dropped() {
        let provider = MemoryProvider::new();
        provider.add_pv("GATE", 1i32).unwrap();
        let connector = ConnectorBuilder::new(provider).build();
        let connection = connector.new_connection("GATE", DataType::Long).unwrap();
        assert!(connection.wait_till_connected());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        connection.add_property_change_listener(
            Property::Value,
            move |_: &Connection, _: &PropertyChange| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        connection.destroy();
        let before = fired.load(Ordering::SeqCst);

        // As if the update had passed the queue check just before destroy
        connection.inner.on_update(Dbr::Time {
            status: AlarmStatus::new(3, 2),
            timestamp: SystemTime::now(),
            value: DbrValue::Long(vec![9]),
        });
        assert_eq!(fired.load(Ordering::SeqCst), before);
        assert!(connection.status() == Status::of(State::Closed));
        assert!(
            connection
                .last_poop()
                .is_none_or(|poop| poop.value() != &Value::Long(9))
        );
    }
}
