//! Descriptive information about a channel, fetched once per connection.

use std::fmt;

use crate::{data_type::DataType, dbr::DbrBasicType};

/// Access rights a client holds on a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum Access {
    None = 0,
    #[default]
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl Access {
    pub fn can_read(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }
    pub fn can_write(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
    pub fn from_flags(read: bool, write: bool) -> Access {
        match (read, write) {
            (false, false) => Access::None,
            (true, false) => Access::Read,
            (false, true) => Access::Write,
            (true, true) => Access::ReadWrite,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::None => "no access",
            Access::Read => "read-only",
            Access::Write => "write-only",
            Access::ReadWrite => "read/write",
        })
    }
}

/// An immutable snapshot of a channel's descriptive information
///
/// Built with [`MetaData::builder`]. A connection replaces its metadata
/// wholesale; individual fields never change after construction.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaData {
    name: String,
    host: Option<String>,
    description: Option<String>,
    data_type: DataType,
    remote_type: Option<DbrBasicType>,
    count: usize,
    units: String,
    precision: Option<i16>,
    format: Option<String>,
    display_limits: (f64, f64),
    warning_limits: (f64, f64),
    alarm_limits: (f64, f64),
    control_limits: (f64, f64),
    states: Vec<String>,
    state_values: Vec<i64>,
    access: Access,
    valid: bool,
}

impl MetaData {
    pub fn builder(name: &str, data_type: DataType) -> MetaDataBuilder {
        MetaDataBuilder {
            meta: MetaData {
                name: name.to_owned(),
                host: None,
                description: None,
                data_type,
                remote_type: None,
                count: 1,
                units: String::new(),
                precision: None,
                format: None,
                display_limits: (0.0, 0.0),
                warning_limits: (0.0, 0.0),
                alarm_limits: (0.0, 0.0),
                control_limits: (0.0, 0.0),
                states: Vec::new(),
                state_values: Vec::new(),
                access: Access::default(),
                valid: true,
            },
        }
    }

    /// Placeholder used when the real metadata could not be fetched
    pub fn invalid(name: &str, data_type: DataType) -> MetaData {
        let mut builder = MetaData::builder(name, data_type).access(Access::None);
        builder.meta.valid = false;
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
    pub fn data_type(&self) -> DataType {
        self.data_type
    }
    /// The native wire type of the remote channel, if known
    pub fn remote_type(&self) -> Option<DbrBasicType> {
        self.remote_type
    }
    pub fn element_count(&self) -> usize {
        self.count
    }
    pub fn units(&self) -> &str {
        &self.units
    }
    pub fn precision(&self) -> Option<i16> {
        self.precision
    }
    /// Display format; if none was given, derived from the precision
    pub fn format(&self) -> Option<String> {
        self.format
            .clone()
            .or_else(|| self.precision.map(|p| format!("%.{}f", p.max(0))))
    }
    pub fn display_limits(&self) -> (f64, f64) {
        self.display_limits
    }
    pub fn warning_limits(&self) -> (f64, f64) {
        self.warning_limits
    }
    pub fn alarm_limits(&self) -> (f64, f64) {
        self.alarm_limits
    }
    pub fn control_limits(&self) -> (f64, f64) {
        self.control_limits
    }
    /// Labels of an enumerated channel, indexed by state
    pub fn states(&self) -> &[String] {
        &self.states
    }
    pub fn state_values(&self) -> &[i64] {
        &self.state_values
    }
    /// The label for an enum index, if this channel has one
    pub fn state_label(&self, index: u16) -> Option<&str> {
        self.states.get(index as usize).map(String::as_str)
    }
    pub fn access(&self) -> Access {
        self.access
    }
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Start a builder from a copy of this metadata
    pub fn to_builder(&self) -> MetaDataBuilder {
        MetaDataBuilder { meta: self.clone() }
    }
}

/// Assembles a [`MetaData`]
#[derive(Clone, Debug)]
pub struct MetaDataBuilder {
    meta: MetaData,
}

impl MetaDataBuilder {
    pub fn host(mut self, host: &str) -> Self {
        self.meta.host = Some(host.to_owned());
        self
    }
    pub fn description(mut self, description: &str) -> Self {
        self.meta.description = Some(description.to_owned());
        self
    }
    pub fn remote_type(mut self, remote_type: DbrBasicType) -> Self {
        self.meta.remote_type = Some(remote_type);
        self
    }
    pub fn element_count(mut self, count: usize) -> Self {
        self.meta.count = count;
        self
    }
    pub fn units(mut self, units: &str) -> Self {
        self.meta.units = units.to_owned();
        self
    }
    pub fn precision(mut self, precision: i16) -> Self {
        self.meta.precision = Some(precision);
        self
    }
    pub fn format(mut self, format: &str) -> Self {
        self.meta.format = Some(format.to_owned());
        self
    }
    pub fn display_limits(mut self, lower: f64, upper: f64) -> Self {
        self.meta.display_limits = (lower, upper);
        self
    }
    pub fn warning_limits(mut self, lower: f64, upper: f64) -> Self {
        self.meta.warning_limits = (lower, upper);
        self
    }
    pub fn alarm_limits(mut self, lower: f64, upper: f64) -> Self {
        self.meta.alarm_limits = (lower, upper);
        self
    }
    pub fn control_limits(mut self, lower: f64, upper: f64) -> Self {
        self.meta.control_limits = (lower, upper);
        self
    }
    /// Enum labels; state values default to the label indices
    pub fn states(mut self, labels: Vec<String>) -> Self {
        self.meta.state_values = (0..labels.len() as i64).collect();
        self.meta.states = labels;
        self
    }
    pub fn state_values(mut self, values: Vec<i64>) -> Self {
        self.meta.state_values = values;
        self
    }
    pub fn access(mut self, access: Access) -> Self {
        self.meta.access = access;
        self
    }
    pub fn build(self) -> MetaData {
        self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let meta = MetaData::builder("TEMP", DataType::Double)
            .units("degC")
            .precision(3)
            .display_limits(-10.0, 110.0)
            .remote_type(DbrBasicType::Double)
            .access(Access::ReadWrite)
            .build();
        assert!(meta.is_valid());
        assert_eq!(meta.units(), "degC");
        assert_eq!(meta.format().as_deref(), Some("%.3f"));
        assert_eq!(meta.display_limits(), (-10.0, 110.0));
        assert!(meta.access().can_write());

        let changed = meta.to_builder().units("K").build();
        assert_eq!(meta.units(), "degC");
        assert_eq!(changed.units(), "K");
    }

    #[test]
    fn invalid_sentinel() {
        let meta = MetaData::invalid("NOPE", DataType::Long);
        assert!(!meta.is_valid());
        assert_eq!(meta.name(), "NOPE");
        assert_eq!(meta.access(), Access::None);
    }

    #[test]
    fn state_labels() {
        let meta = MetaData::builder("MODE", DataType::Enum)
            .states(vec!["Off".into(), "On".into()])
            .build();
        assert_eq!(meta.state_label(1), Some("On"));
        assert_eq!(meta.state_label(2), None);
        assert_eq!(meta.state_values(), &[0, 1]);
    }

    #[test]
    fn access_flags() {
        assert_eq!(Access::from_flags(true, true), Access::ReadWrite);
        assert!(!Access::Write.can_read());
        assert!(!Access::None.can_write());
    }
}
