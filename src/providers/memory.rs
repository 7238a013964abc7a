//! A provider serving PVs held in process memory.
//!
//! Values are held in their wire encoding, and every read is encoded and decoded
//! again on the way out, so connections see exactly what a network client
//! would. The provider can also be told to drop, restore or close channels and
//! to fail operations, and counts the operations it served.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

use tracing::{debug, trace, warn};

use super::{
    Channel, ChannelProvider, ChannelState, GetCallback, MonitorCallback, MonitorId,
    ProviderError, PutCallback, StateCallback,
};
use crate::{
    dbr::{
        AlarmStatus, Dbr, DbrBasicType, DbrCategory, DbrControl, DbrGraphics, DbrType, DbrValue,
    },
    metadata::Access,
};

#[derive(Debug)]
pub struct PVAlreadyExists;

#[derive(Debug)]
pub struct NoSuchPV;

struct Monitor {
    channel: Weak<MemoryChannel>,
    data_type: DbrType,
    count: usize,
    callback: MonitorCallback,
}

struct PV {
    native: DbrBasicType,
    count: usize,
    /// The value, big-endian encoded as a `DBR_<native>`
    encoded: Vec<u8>,
    status: AlarmStatus,
    timestamp: SystemTime,
    graphics: DbrGraphics,
    control: DbrControl,
    access: Access,
    online: bool,
    fail_gets: Option<String>,
    fail_puts: Option<String>,
    /// Gets and puts are accepted but never called back
    unanswered: bool,
    monitors: HashMap<u64, Monitor>,
}

impl PV {
    fn new(value: DbrValue) -> Self {
        let native = value.get_type();
        let mut pv = PV {
            native,
            count: 0,
            encoded: Vec::new(),
            status: AlarmStatus::default(),
            timestamp: SystemTime::now(),
            graphics: DbrGraphics::default_for(native),
            control: DbrControl::default_for(native),
            access: Access::ReadWrite,
            online: true,
            fail_gets: None,
            fail_puts: None,
            unanswered: false,
            monitors: HashMap::new(),
        };
        pv.encode(&value);
        pv
    }

    fn encode(&mut self, value: &DbrValue) {
        let (count, encoded) = value.to_bytes(None);
        self.count = count;
        self.encoded = encoded;
    }

    pub fn load(&self) -> Result<DbrValue, ProviderError> {
        let basic = DbrType::new(self.native, DbrCategory::Basic);
        Ok(Dbr::from_bytes(basic, self.count, &self.encoded)?.take_value())
    }

    /// Read the value as a requested wire type, passing it through the
    /// wire encoding
    fn read(&self, data_type: DbrType, count: usize) -> Result<Dbr, ProviderError> {
        let value = self.load()?;
        let record = if data_type.category == DbrCategory::Time {
            Dbr::Time {
                status: self.status,
                timestamp: self.timestamp,
                value,
            }
        } else {
            Dbr::Control {
                status: self.status,
                graphics: self.graphics.clone(),
                control: self.control.clone(),
                value,
            }
        };
        let converted = record.convert_to(data_type)?;
        let (sent, bytes) = converted.to_bytes(NonZeroUsize::new(count));
        Ok(Dbr::from_bytes(data_type, sent, &bytes)?)
    }

    /// Store a value, converting to the native type. Strings are parsed.
    fn store(&mut self, value: &DbrValue) -> Result<(), ProviderError> {
        let value = if value.get_type() == DbrBasicType::String {
            value.parse_into(self.native)?
        } else {
            value.convert_to(self.native)?
        };
        self.encode(&value);
        self.timestamp = SystemTime::now();
        Ok(())
    }

    /// Everything needed to notify current monitors, to be run without the lock
    fn pending_updates(&self) -> Vec<(MonitorCallback, Result<Dbr, ProviderError>)> {
        self.monitors
            .values()
            .filter(|m| m.channel.strong_count() > 0)
            .map(|m| (m.callback.clone(), self.read(m.data_type, m.count)))
            .collect()
    }
}

fn deliver(updates: Vec<(MonitorCallback, Result<Dbr, ProviderError>)>) {
    for (callback, update) in updates {
        callback(update);
    }
}

#[derive(Default)]
struct Counters {
    gets: AtomicUsize,
    puts: AtomicUsize,
    subscribed: AtomicUsize,
    unsubscribed: AtomicUsize,
    flushes: AtomicUsize,
    next_monitor: AtomicU64,
}

#[derive(Default)]
struct Registry {
    pvs: HashMap<String, Arc<Mutex<PV>>>,
    /// Every channel opened by name, whether or not the PV exists yet
    channels: HashMap<String, Vec<Weak<MemoryChannel>>>,
    never_connect: Vec<String>,
    connect_delay: HashMap<String, Duration>,
}

impl Registry {
    fn live_channels(&mut self, name: &str) -> Vec<Arc<MemoryChannel>> {
        let Some(list) = self.channels.get_mut(name) else {
            return Vec::new();
        };
        list.retain(|c| c.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Serves PVs stored in memory. Clones share the same PVs.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Counters>,
}

impl MemoryProvider {
    pub fn new() -> MemoryProvider {
        MemoryProvider::default()
    }

    /// Add a PV. Channels already opened for this name connect.
    pub fn add_pv<T>(&self, name: &str, initial_value: T) -> Result<(), PVAlreadyExists>
    where
        DbrValue: From<T>,
    {
        let channels = {
            let mut registry = self.registry.lock().unwrap();
            if registry.pvs.contains_key(name) {
                return Err(PVAlreadyExists);
            }
            let pv = Arc::new(Mutex::new(PV::new(DbrValue::from(initial_value))));
            registry.pvs.insert(name.to_owned(), pv);
            if registry.never_connect.iter().any(|n| n == name) {
                return Ok(());
            }
            registry.live_channels(name)
        };
        debug!("MemoryProvider: added {name}");
        for channel in channels {
            channel.set_state(ChannelState::Connected);
        }
        Ok(())
    }

    /// Add an enumerated PV with state labels
    pub fn add_enum(&self, name: &str, index: u16, labels: &[&str]) -> Result<(), PVAlreadyExists> {
        self.add_pv(name, DbrValue::Enum(index))?;
        let _ = self.with_pv(name, |pv| {
            pv.graphics = DbrGraphics::Enum {
                strings: labels.iter().map(|s| s.to_string()).collect(),
            };
        });
        Ok(())
    }

    fn pv(&self, name: &str) -> Result<Arc<Mutex<PV>>, NoSuchPV> {
        self.registry
            .lock()
            .unwrap()
            .pvs
            .get(name)
            .cloned()
            .ok_or(NoSuchPV)
    }

    fn with_pv<R>(&self, name: &str, f: impl FnOnce(&mut PV) -> R) -> Result<R, NoSuchPV> {
        let pv = self.pv(name)?;
        let mut pv = pv.lock().unwrap();
        Ok(f(&mut pv))
    }

    pub fn load(&self, name: &str) -> Option<DbrValue> {
        self.with_pv(name, |pv| pv.load().ok()).ok().flatten()
    }

    /// Replace a PV value and push it to every monitor
    pub fn store<T>(&self, name: &str, value: T) -> Result<(), ProviderError>
    where
        DbrValue: From<T>,
    {
        let value = DbrValue::from(value);
        let updates = self
            .with_pv(name, |pv| -> Result<_, ProviderError> {
                pv.store(&value)?;
                Ok(if pv.online { pv.pending_updates() } else { Vec::new() })
            })
            .map_err(|_| ProviderError::Failed(format!("No PV named {name}")))??;
        trace!("MemoryProvider: {name} = {value:?}, {} monitors", updates.len());
        deliver(updates);
        Ok(())
    }

    /// Set the alarm severity reported with the value, notifying monitors
    pub fn set_alarm(&self, name: &str, status: i16, severity: i16) -> Result<(), NoSuchPV> {
        let updates = self.with_pv(name, |pv| {
            pv.status = AlarmStatus::new(status, severity);
            pv.timestamp = SystemTime::now();
            pv.pending_updates()
        })?;
        deliver(updates);
        Ok(())
    }

    pub fn set_graphics(&self, name: &str, graphics: DbrGraphics) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.graphics = graphics)
    }

    pub fn set_control(&self, name: &str, control: DbrControl) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.control = control)
    }

    pub fn set_access(&self, name: &str, access: Access) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.access = access)
    }

    /// Make reads fail with `reason`, or succeed again with `None`
    pub fn fail_gets(&self, name: &str, reason: Option<&str>) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.fail_gets = reason.map(str::to_owned))
    }

    /// Make writes fail with `reason`, or succeed again with `None`
    pub fn fail_puts(&self, name: &str, reason: Option<&str>) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.fail_puts = reason.map(str::to_owned))
    }

    /// Accept gets and puts on `name` without ever answering them
    pub fn leave_unanswered(&self, name: &str, unanswered: bool) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.unanswered = unanswered)
    }

    /// Channels for `name` stay unconnected, even if the PV is added
    pub fn never_connect(&self, name: &str) {
        self.registry
            .lock()
            .unwrap()
            .never_connect
            .push(name.to_owned());
    }

    /// Channels for `name` connect only after `delay`, from a separate thread
    pub fn set_connect_delay(&self, name: &str, delay: Duration) {
        self.registry
            .lock()
            .unwrap()
            .connect_delay
            .insert(name.to_owned(), delay);
    }

    fn set_online(&self, name: &str, online: bool) -> Result<(), NoSuchPV> {
        self.with_pv(name, |pv| pv.online = online)?;
        let channels = self.registry.lock().unwrap().live_channels(name);
        let state = if online {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        };
        for channel in channels {
            channel.set_state(state);
        }
        // Resume monitors with the current value
        if online {
            deliver(self.with_pv(name, |pv| pv.pending_updates())?);
        }
        Ok(())
    }

    /// Simulate the server for `name` going away
    pub fn disconnect(&self, name: &str) -> Result<(), NoSuchPV> {
        self.set_online(name, false)
    }

    pub fn reconnect(&self, name: &str) -> Result<(), NoSuchPV> {
        self.set_online(name, true)
    }

    /// Remove a PV, closing every channel open on it
    pub fn close(&self, name: &str) -> Result<(), NoSuchPV> {
        let channels = {
            let mut registry = self.registry.lock().unwrap();
            registry.pvs.remove(name).ok_or(NoSuchPV)?;
            registry.live_channels(name)
        };
        for channel in channels {
            channel.set_state(ChannelState::Closed);
        }
        Ok(())
    }

    /// Number of gets served
    pub fn get_count(&self) -> usize {
        self.counters.gets.load(Ordering::SeqCst)
    }
    /// Number of puts that reached a PV
    pub fn put_count(&self) -> usize {
        self.counters.puts.load(Ordering::SeqCst)
    }
    pub fn subscriptions_created(&self) -> usize {
        self.counters.subscribed.load(Ordering::SeqCst)
    }
    pub fn subscriptions_cancelled(&self) -> usize {
        self.counters.unsubscribed.load(Ordering::SeqCst)
    }
    pub fn flush_count(&self) -> usize {
        self.counters.flushes.load(Ordering::SeqCst)
    }
    /// Monitors currently registered on `name`
    pub fn active_monitors(&self, name: &str) -> usize {
        self.with_pv(name, |pv| pv.monitors.len()).unwrap_or(0)
    }
}

impl ChannelProvider for MemoryProvider {
    fn create_channel(
        &self,
        name: &str,
        on_state: StateCallback,
    ) -> Result<Arc<dyn Channel>, ProviderError> {
        let channel = Arc::new_cyclic(|me| MemoryChannel {
            me: me.clone(),
            name: name.to_owned(),
            provider: self.clone(),
            state: Mutex::new(ChannelState::NeverConnected),
            on_state,
            monitors: Mutex::new(Vec::new()),
        });
        let (connect_now, delay) = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .channels
                .entry(name.to_owned())
                .or_default()
                .push(Arc::downgrade(&channel));
            let blocked = registry.never_connect.iter().any(|n| n == name);
            let online = registry
                .pvs
                .get(name)
                .is_some_and(|pv| pv.lock().unwrap().online);
            (online && !blocked, registry.connect_delay.get(name).copied())
        };
        debug!("MemoryProvider: opened channel {name}");
        match (connect_now, delay) {
            (true, Some(delay)) => {
                let weak = Arc::downgrade(&channel);
                thread::spawn(move || {
                    thread::sleep(delay);
                    if let Some(channel) = weak.upgrade() {
                        channel.set_state(ChannelState::Connected);
                    }
                });
            }
            (true, None) => channel.set_state(ChannelState::Connected),
            (false, _) => (),
        }
        Ok(channel)
    }

    fn flush(&self) {
        self.counters.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A channel onto one named PV of a [`MemoryProvider`]
pub struct MemoryChannel {
    me: Weak<MemoryChannel>,
    name: String,
    provider: MemoryProvider,
    state: Mutex<ChannelState>,
    on_state: StateCallback,
    monitors: Mutex<Vec<u64>>,
}

impl MemoryChannel {
    fn set_state(&self, state: ChannelState) {
        {
            let mut current = self.state.lock().unwrap();
            if *current == state || *current == ChannelState::Closed {
                return;
            }
            *current = state;
        }
        (self.on_state)(state);
    }

    fn connected_pv(&self) -> Result<Arc<Mutex<PV>>, ProviderError> {
        if self.state() != ChannelState::Connected {
            return Err(ProviderError::NotConnected(self.name.clone()));
        }
        self.provider
            .pv(&self.name)
            .map_err(|_| ProviderError::NotConnected(self.name.clone()))
    }

    fn unanswered(&self) -> bool {
        self.provider
            .with_pv(&self.name, |pv| pv.unanswered)
            .unwrap_or(false)
    }

    fn remove_monitor(&self, id: u64) {
        let removed = self
            .provider
            .with_pv(&self.name, |pv| pv.monitors.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            self.provider
                .counters
                .unsubscribed
                .fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    fn native_type(&self) -> Option<DbrBasicType> {
        self.provider.with_pv(&self.name, |pv| pv.native).ok()
    }

    fn element_count(&self) -> usize {
        self.provider.with_pv(&self.name, |pv| pv.count).unwrap_or(0)
    }

    fn access(&self) -> Access {
        self.provider
            .with_pv(&self.name, |pv| pv.access)
            .unwrap_or(Access::None)
    }

    fn host_name(&self) -> Option<String> {
        Some("memory".to_owned())
    }

    fn get(&self, data_type: DbrType, count: usize, callback: GetCallback) {
        if self.unanswered() {
            trace!("MemoryProvider: leaving get on {} unanswered", self.name);
            return;
        }
        let result = self.connected_pv().and_then(|pv| {
            let pv = pv.lock().unwrap();
            if let Some(reason) = &pv.fail_gets {
                return Err(ProviderError::Failed(reason.clone()));
            }
            pv.read(data_type, count)
        });
        self.provider.counters.gets.fetch_add(1, Ordering::SeqCst);
        callback(result);
    }

    fn put(&self, value: DbrValue, callback: PutCallback) {
        if self.unanswered() {
            trace!("MemoryProvider: leaving put on {} unanswered", self.name);
            return;
        }
        let result = self.connected_pv().and_then(|pv| {
            let mut pv = pv.lock().unwrap();
            if !pv.access.can_write() {
                return Err(ProviderError::NoWriteAccess(self.name.clone()));
            }
            if let Some(reason) = &pv.fail_puts {
                return Err(ProviderError::Failed(reason.clone()));
            }
            pv.store(&value)?;
            self.provider.counters.puts.fetch_add(1, Ordering::SeqCst);
            Ok(pv.pending_updates())
        });
        match result {
            Ok(updates) => {
                deliver(updates);
                callback(Ok(()));
            }
            Err(e) => {
                warn!("MemoryProvider: put to {} failed: {e}", self.name);
                callback(Err(e));
            }
        }
    }

    fn subscribe(
        &self,
        data_type: DbrType,
        count: usize,
        callback: MonitorCallback,
    ) -> Result<MonitorId, ProviderError> {
        let pv = self.connected_pv()?;
        let id = self
            .provider
            .counters
            .next_monitor
            .fetch_add(1, Ordering::SeqCst);
        let initial = {
            let mut pv = pv.lock().unwrap();
            let initial = pv.read(data_type, count);
            pv.monitors.insert(
                id,
                Monitor {
                    channel: self.me.clone(),
                    data_type,
                    count,
                    callback: callback.clone(),
                },
            );
            initial
        };
        self.monitors.lock().unwrap().push(id);
        self.provider
            .counters
            .subscribed
            .fetch_add(1, Ordering::SeqCst);
        callback(initial);
        Ok(MonitorId(id))
    }

    fn unsubscribe(&self, id: MonitorId) {
        self.monitors.lock().unwrap().retain(|m| *m != id.0);
        self.remove_monitor(id.0);
    }

    fn destroy(&self) {
        *self.state.lock().unwrap() = ChannelState::Closed;
        let monitors: Vec<u64> = self.monitors.lock().unwrap().drain(..).collect();
        for id in monitors {
            self.remove_monitor(id);
        }
        debug!("MemoryProvider: destroyed channel {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn open(
        provider: &MemoryProvider,
        name: &str,
    ) -> (Arc<dyn Channel>, mpsc::Receiver<ChannelState>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let channel = provider
            .create_channel(
                name,
                Box::new(move |s| {
                    let _ = tx.lock().unwrap().send(s);
                }),
            )
            .unwrap();
        (channel, rx)
    }

    #[test]
    fn reads_pass_through_wire_encoding() {
        let provider = MemoryProvider::new();
        provider.add_pv("TEST", "Test String").unwrap();
        let (channel, states) = open(&provider, "TEST");
        assert_eq!(states.try_recv().unwrap(), ChannelState::Connected);
        assert_eq!(channel.native_type(), Some(DbrBasicType::String));

        let (tx, rx) = mpsc::channel();
        channel.get(
            DbrType::new(DbrBasicType::Char, DbrCategory::Time),
            0,
            Box::new(move |r| tx.send(r).unwrap()),
        );
        let dbr = rx.recv().unwrap().unwrap();
        assert_eq!(dbr.data_type().basic_type, DbrBasicType::Char);
        assert_eq!(dbr.value().get_count(), "Test String".len());
        assert_eq!(provider.get_count(), 1);
    }

    #[test]
    fn late_pv_connects_waiting_channel() {
        let provider = MemoryProvider::new();
        let (channel, states) = open(&provider, "LATE");
        assert_eq!(channel.state(), ChannelState::NeverConnected);
        assert!(states.try_recv().is_err());
        provider.add_pv("LATE", 1i32).unwrap();
        assert_eq!(states.try_recv().unwrap(), ChannelState::Connected);
    }

    #[test]
    fn monitors_receive_initial_and_updates() {
        let provider = MemoryProvider::new();
        provider.add_pv("COUNT", 1i32).unwrap();
        let (channel, _states) = open(&provider, "COUNT");
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let id = channel
            .subscribe(
                DbrType::new(DbrBasicType::Double, DbrCategory::Time),
                0,
                Arc::new(move |r| {
                    let _ = tx.lock().unwrap().send(r);
                }),
            )
            .unwrap();
        let first = rx.recv().unwrap().unwrap();
        assert_eq!(first.value(), &DbrValue::Double(vec![1.0]));
        provider.store("COUNT", 5i32).unwrap();
        assert_eq!(rx.recv().unwrap().unwrap().value(), &DbrValue::Double(vec![5.0]));
        assert_eq!(provider.active_monitors("COUNT"), 1);

        channel.unsubscribe(id);
        assert_eq!(provider.active_monitors("COUNT"), 0);
        assert_eq!(provider.subscriptions_created(), 1);
        assert_eq!(provider.subscriptions_cancelled(), 1);
    }

    #[test]
    fn puts_convert_to_native() {
        let provider = MemoryProvider::new();
        provider.add_pv("SET", 0.0f64).unwrap();
        let (channel, _states) = open(&provider, "SET");
        let (tx, rx) = mpsc::channel();
        channel.put("2.5".into(), Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap().unwrap();
        assert_eq!(provider.load("SET"), Some(DbrValue::Double(vec![2.5])));
        assert_eq!(provider.put_count(), 1);

        provider.fail_puts("SET", Some("interlock")).unwrap();
        let (tx, rx) = mpsc::channel();
        channel.put(1.0f64.into(), Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(
            rx.recv().unwrap(),
            Err(ProviderError::Failed("interlock".into()))
        );
    }

    #[test]
    fn disconnect_reconnect_and_close() {
        let provider = MemoryProvider::new();
        provider.add_pv("LINK", 1i32).unwrap();
        let (channel, states) = open(&provider, "LINK");
        assert_eq!(states.recv().unwrap(), ChannelState::Connected);
        provider.disconnect("LINK").unwrap();
        assert_eq!(states.recv().unwrap(), ChannelState::Disconnected);
        provider.reconnect("LINK").unwrap();
        assert_eq!(states.recv().unwrap(), ChannelState::Connected);
        provider.close("LINK").unwrap();
        assert_eq!(states.recv().unwrap(), ChannelState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn unanswered_operations_never_call_back() {
        let provider = MemoryProvider::new();
        provider.add_pv("QUIET", 4i32).unwrap();
        let (channel, _states) = open(&provider, "QUIET");
        provider.leave_unanswered("QUIET", true).unwrap();
        let (tx, rx) = mpsc::channel();
        let put_tx = tx.clone();
        channel.get(
            DbrType::new(DbrBasicType::Long, DbrCategory::Basic),
            1,
            Box::new(move |r| tx.send(r.map(|_| ())).unwrap()),
        );
        channel.put(5i32.into(), Box::new(move |r| put_tx.send(r).unwrap()));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(provider.load("QUIET"), Some(DbrValue::Long(vec![4])));

        provider.leave_unanswered("QUIET", false).unwrap();
        let (tx, rx) = mpsc::channel();
        channel.put(5i32.into(), Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap().unwrap();
        assert_eq!(provider.load("QUIET"), Some(DbrValue::Long(vec![5])));
    }
}
