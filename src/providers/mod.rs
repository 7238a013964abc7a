//! Interface between connections and whatever actually serves channel data
//!
//! A [`ChannelProvider`] opens [`Channel`]s by name. Every channel operation
//! reports back through a callback. Providers may invoke callbacks on any
//! thread, including inline from the call that started the operation; callers
//! must not hold locks a callback could need.

pub mod memory;
pub use memory::MemoryProvider;

use std::sync::Arc;

use thiserror::Error;

use crate::{
    dbr::{Dbr, DbrBasicType, DbrError, DbrType, DbrValue},
    metadata::Access,
};

/// Connection state of a provider channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelState {
    NeverConnected,
    Connected,
    Disconnected,
    /// The channel was closed and will never connect again
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Channel '{0}' is not connected")]
    NotConnected(String),
    #[error("Channel '{0}' has been closed")]
    Closed(String),
    #[error("No write access to '{0}'")]
    NoWriteAccess(String),
    #[error("Operation not supported by this provider")]
    Unsupported,
    #[error(transparent)]
    Wire(#[from] DbrError),
    #[error("{0}")]
    Failed(String),
}

pub type StateCallback = Box<dyn Fn(ChannelState) + Send + Sync>;
pub type GetCallback = Box<dyn FnOnce(Result<Dbr, ProviderError>) + Send>;
pub type PutCallback = Box<dyn FnOnce(Result<(), ProviderError>) + Send>;
pub type MonitorCallback = Arc<dyn Fn(Result<Dbr, ProviderError>) + Send + Sync>;

/// Identifies one active monitor on a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MonitorId(pub u64);

/// Opens channels for a [`crate::Connector`]
pub trait ChannelProvider: Send + Sync + 'static {
    /// Open a channel. `on_state` is called on every connection state change
    /// for as long as the channel lives.
    fn create_channel(
        &self,
        name: &str,
        on_state: StateCallback,
    ) -> Result<Arc<dyn Channel>, ProviderError>;

    /// Send any buffered requests
    fn flush(&self) {}
}

/// One named channel opened by a [`ChannelProvider`]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> ChannelState;

    /// Native wire type, known once connected
    fn native_type(&self) -> Option<DbrBasicType>;
    fn element_count(&self) -> usize;

    fn access(&self) -> Access {
        Access::Read
    }

    fn host_name(&self) -> Option<String> {
        None
    }

    /// Read the value as `data_type`. A `count` of zero asks for every element.
    fn get(&self, data_type: DbrType, count: usize, callback: GetCallback);

    #[allow(unused_variables)]
    fn put(&self, value: DbrValue, callback: PutCallback) {
        callback(Err(ProviderError::NoWriteAccess(self.name().to_owned())))
    }

    /// Start pushing updates. The current value is delivered first.
    #[allow(unused_variables)]
    fn subscribe(
        &self,
        data_type: DbrType,
        count: usize,
        callback: MonitorCallback,
    ) -> Result<MonitorId, ProviderError> {
        Err(ProviderError::Unsupported)
    }

    #[allow(unused_variables)]
    fn unsubscribe(&self, id: MonitorId) {}

    /// Release the channel. No callbacks are made afterwards.
    fn destroy(&self);
}
