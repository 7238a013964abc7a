//! One observation of a channel: value, time, metadata and status together.

use std::fmt;

use crate::{
    data_type::Value,
    dbr::Dbr,
    metadata::MetaData,
    status::{State, Status},
    timestamp::Timestamp,
};

/// An immutable observation of a channel value
///
/// Pairs the converted [`Value`] with the [`Timestamp`], [`MetaData`] and
/// [`Status`] it was observed with, and the raw wire payload it came from.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueEnvelope {
    value: Value,
    timestamp: Timestamp,
    meta: MetaData,
    status: Status,
    raw: Option<Dbr>,
}

/// Short name used throughout the listener API
pub type Poop = ValueEnvelope;

impl ValueEnvelope {
    /// Build an envelope. A missing or non-positive timestamp is replaced by now.
    pub fn new(
        value: Value,
        timestamp: Option<Timestamp>,
        meta: MetaData,
        status: Status,
        raw: Option<Dbr>,
    ) -> Self {
        let timestamp = timestamp
            .filter(Timestamp::is_valid)
            .unwrap_or_else(Timestamp::now);
        ValueEnvelope {
            value,
            timestamp,
            meta,
            status,
            raw,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
    pub fn into_value(self) -> Value {
        self.value
    }
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
    pub fn meta_data(&self) -> &MetaData {
        &self.meta
    }
    pub fn status(&self) -> Status {
        self.status
    }
    /// The wire payload this observation was decoded from, if any
    pub fn raw(&self) -> Option<&Dbr> {
        self.raw.as_ref()
    }
    /// No alarm is active
    pub fn is_status_ok(&self) -> bool {
        self.status.is_set(State::Normal)
    }
}

impl fmt::Display for ValueEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.meta.name(), self.timestamp, self.value)?;
        if !self.is_status_ok() {
            write!(f, " {}", self.status.alarm())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;

    #[test]
    fn missing_or_zero_timestamp_becomes_now() {
        let meta = MetaData::invalid("X", DataType::Double);
        let before = Timestamp::now();
        let env = ValueEnvelope::new(Value::Double(1.0), None, meta.clone(), Status::NORMAL, None);
        assert!(env.timestamp().is_valid());
        assert!(env.timestamp() >= before);

        let env = ValueEnvelope::new(
            Value::Double(1.0),
            Some(Timestamp::from_millis(0)),
            meta.clone(),
            Status::NORMAL,
            None,
        );
        assert!(env.timestamp().is_valid());

        let given = Timestamp::new(1_000, 5);
        let env = ValueEnvelope::new(Value::Double(1.0), Some(given), meta, Status::NORMAL, None);
        assert_eq!(env.timestamp(), given);
    }

    #[test]
    fn status_ok_checks_normal_bit() {
        let meta = MetaData::invalid("X", DataType::Long);
        let ok = Status::from_states(&[State::Connected, State::Normal]);
        let alarmed = Status::from_states(&[State::Connected, State::Alarm]);
        let env = ValueEnvelope::new(Value::Long(1), None, meta.clone(), ok, None);
        assert!(env.is_status_ok());
        let env = ValueEnvelope::new(Value::Long(1), None, meta, alarmed, None);
        assert!(!env.is_status_ok());
        assert!(env.to_string().ends_with("1 [ALARM]"));
    }
}
