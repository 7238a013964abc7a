// #![warn(missing_docs)]

//! Client-side connection layer for EPICS Channel Access style process variables.
//!
//! This crate manages the client half of talking to remotely hosted, named values
//! ("process variables", or PVs): keeping track of whether each one is connected,
//! what alarm state it is in, subscribing to pushed updates while anyone is
//! interested, and converting the heterogeneous ["DBR" types] used on the wire into a
//! small set of canonical Rust values. The wire transport itself sits behind the
//! [`ChannelProvider`] trait.
//!
//! The pieces are:
//!
//! - A [`Connector`] session, which owns a worker pool and a scheduler, and creates
//!   connections. Optionally it shares connections through a [`ConnectionCache`].
//! - A [`Connection`] per PV name, with its own connectivity and alarm [`Status`],
//!   lazily fetched [`MetaData`], and a push subscription that exists exactly while
//!   [`Property::Value`] or [`Property::Poop`] listeners are registered.
//! - [`Request`] and [`Response`], which report the outcome of asynchronous gets and
//!   sets the same way.
//! - The [`marshal`] module, converting between [`DataType`]/[`Value`] and the wire
//!   representation in [`dbr`].
//! - Channel [`providers`]. [`providers::MemoryProvider`] keeps PVs in process, and
//!   is useful for tests and simulation.
//!
//! ## Example
//!
//! ```
//! use epicars_connector::{Connector, DataType, Value, providers::MemoryProvider};
//!
//! let provider = MemoryProvider::new();
//! provider.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//! let connector = Connector::new(provider);
//!
//! let connection = connector
//!     .new_connection("NUMERIC_VALUE", DataType::Double)
//!     .unwrap();
//! assert!(connection.wait_till_connected());
//! assert_eq!(connection.get_value().unwrap(), Value::Double(42.0));
//! connection.set_value(3.5).unwrap();
//! // The PV is natively an integer
//! assert_eq!(connection.get_value().unwrap(), Value::Double(3.0));
//! ```
//!
//! ## Configuration
//!
//! A [`Connector`] takes its pool sizes, timeouts, read-only flag and request
//! retention from a [`ConnectorConfig`], each of which can be overridden from the
//! environment. See [`config`] for the variables.
//!
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

mod cache;
pub mod config;
mod connection;
mod connector;
pub mod data_type;
pub mod dbr;
mod envelope;
mod error;
pub mod marshal;
mod metadata;
pub mod providers;
mod request;
mod scheduler;
mod status;
mod timestamp;

pub use crate::cache::ConnectionCache;
pub use crate::config::{ConnectorConfig, ConnectorSettings};
pub use crate::connection::{
    Connection, ListenerId, Property, PropertyChange, PropertyChangeListener,
};
pub use crate::connector::{Connector, ConnectorBuilder};
pub use crate::data_type::{DataType, Value};
pub use crate::envelope::{Poop, ValueEnvelope};
pub use crate::error::{Error, Result};
pub use crate::metadata::{Access, MetaData, MetaDataBuilder};
pub use crate::providers::{Channel, ChannelProvider};
pub use crate::request::{Request, RequestKind, Response, ResponseListener};
pub use crate::scheduler::{ScheduledTask, Scheduler};
pub use crate::status::{State, Status};
pub use crate::timestamp::{IsoFormat, Timestamp};
