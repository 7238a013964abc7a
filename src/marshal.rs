//! Conversion between canonical [`Value`]s and wire [`DbrValue`]s.
//!
//! Numeric conversions between families are plain `as` casts: narrowing
//! truncates and saturates rather than failing. Strings are parsed when a
//! numeric wire type is involved, and a `Char` wire array is treated as the
//! bytes of one zero-terminated string. Pairs that have no sensible meaning
//! fail with [`MarshalError`].

use std::{fmt::Display, str::FromStr};

use num::cast::AsPrimitive;
use thiserror::Error;

use crate::{
    data_type::{DataType, Value, dbr_elements},
    dbr::{Dbr, DbrBasicType, DbrControl, DbrError, DbrGraphics, DbrValue},
    metadata::{MetaData, MetaDataBuilder},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error("Cannot write a {from} value as wire type {to}")]
    Unsupported { from: DataType, to: DbrBasicType },
    #[error("Cannot read wire type {from} as {to}")]
    UnsupportedWire { from: DbrBasicType, to: DataType },
    #[error("Wire value of type {0} has no elements")]
    Empty(DbrBasicType),
    #[error("Cannot parse {0:?} as a number")]
    Parse(String),
    #[error("{from} value cannot be read as {to}")]
    Extract { from: DataType, to: &'static str },
    #[error(transparent)]
    Wire(#[from] DbrError),
}

fn cast<T, U>(values: &[T]) -> Vec<U>
where
    T: AsPrimitive<U>,
    U: Copy + 'static,
{
    values.iter().map(|v| v.as_()).collect()
}

/// Write a run of numbers as the given wire type
fn numbers_to_wire<T>(
    from: DataType,
    values: &[T],
    wire: DbrBasicType,
) -> Result<DbrValue, MarshalError>
where
    T: Display
        + AsPrimitive<i8>
        + AsPrimitive<i16>
        + AsPrimitive<i32>
        + AsPrimitive<f32>
        + AsPrimitive<f64>
        + AsPrimitive<u16>,
{
    Ok(match wire {
        DbrBasicType::Char => DbrValue::Char(cast(values)),
        DbrBasicType::Int => DbrValue::Int(cast(values)),
        DbrBasicType::Long => DbrValue::Long(cast(values)),
        DbrBasicType::Float => DbrValue::Float(cast(values)),
        DbrBasicType::Double => DbrValue::Double(cast(values)),
        DbrBasicType::String => DbrValue::String(values.iter().map(ToString::to_string).collect()),
        DbrBasicType::Enum => match values {
            [single] => DbrValue::Enum(AsPrimitive::<u16>::as_(*single)),
            _ => return Err(MarshalError::Unsupported { from, to: wire }),
        },
    })
}

/// Spread a string over a `Char` array, one element per byte
fn string_to_chars(value: &str) -> DbrValue {
    DbrValue::Char(value.bytes().map(|b| b as i8).collect())
}

/// Read a `Char` array as the bytes of a string, stopping at the first zero
fn chars_to_string(chars: &[i8]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|c| **c != 0)
        .map(|c| *c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn parse_strings(values: &[String], wire: DbrBasicType) -> Result<DbrValue, MarshalError> {
    DbrValue::String(values.to_vec())
        .parse_into(wire)
        .map_err(|e| match e {
            DbrError::CannotParse(s) => MarshalError::Parse(s),
            other => MarshalError::Wire(other),
        })
}

/// Convert a canonical value into the wire representation for `wire`
pub fn to_wire(value: &Value, wire: DbrBasicType) -> Result<DbrValue, MarshalError> {
    let from = value.data_type();
    let unsupported = || MarshalError::Unsupported { from, to: wire };
    match value {
        Value::Double(v) => numbers_to_wire(from, std::slice::from_ref(v), wire),
        Value::Doubles(v) => numbers_to_wire(from, v, wire),
        Value::Long(v) => numbers_to_wire(from, std::slice::from_ref(v), wire),
        Value::Longs(v) => numbers_to_wire(from, v, wire),
        Value::Enum(v) => numbers_to_wire(from, &[*v as i64], wire),
        Value::Boolean(b) => match wire {
            DbrBasicType::String => Err(unsupported()),
            _ => numbers_to_wire(from, &[*b as i64], wire),
        },
        Value::BitSet(bits) => match wire {
            DbrBasicType::String | DbrBasicType::Enum => Err(unsupported()),
            _ => numbers_to_wire(from, &[Value::bits_to_u64(bits) as i64], wire),
        },
        Value::String(s) => match wire {
            DbrBasicType::String => Ok(DbrValue::String(vec![s.clone()])),
            DbrBasicType::Char => Ok(string_to_chars(s)),
            _ => parse_strings(std::slice::from_ref(s), wire),
        },
        Value::Strings(v) => match (wire, v.as_slice()) {
            (DbrBasicType::String, _) => Ok(DbrValue::String(v.clone())),
            (DbrBasicType::Char, [single]) => Ok(string_to_chars(single)),
            (DbrBasicType::Char, _) => Err(unsupported()),
            _ => parse_strings(v, wire),
        },
        Value::Object(v) | Value::Objects(v) => Ok(v.convert_to(wire)?),
    }
}

/// Numeric elements of a wire value, cast to `U`; `None` for strings
fn wire_numbers<U>(wire: &DbrValue) -> Option<Vec<U>>
where
    U: Copy + 'static,
    i8: AsPrimitive<U>,
    i16: AsPrimitive<U>,
    i32: AsPrimitive<U>,
    f32: AsPrimitive<U>,
    f64: AsPrimitive<U>,
    u16: AsPrimitive<U>,
{
    Some(match wire {
        DbrValue::Enum(e) => vec![AsPrimitive::<U>::as_(*e)],
        DbrValue::Char(v) => cast(v),
        DbrValue::Int(v) => cast(v),
        DbrValue::Long(v) => cast(v),
        DbrValue::Float(v) => cast(v),
        DbrValue::Double(v) => cast(v),
        DbrValue::String(_) => return None,
    })
}

/// Parse strings as `T`, falling back to truncating a float parse
fn parse_all<T>(values: &[String]) -> Result<Vec<T>, MarshalError>
where
    T: FromStr + Copy + 'static,
    f64: AsPrimitive<T>,
{
    values
        .iter()
        .map(|s| {
            let s = s.trim();
            s.parse::<T>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(AsPrimitive::<T>::as_))
                .ok_or_else(|| MarshalError::Parse(s.to_owned()))
        })
        .collect()
}

fn numbers_from_wire<T>(wire: &DbrValue) -> Result<Vec<T>, MarshalError>
where
    T: FromStr + Copy + 'static,
    i8: AsPrimitive<T>,
    i16: AsPrimitive<T>,
    i32: AsPrimitive<T>,
    f32: AsPrimitive<T>,
    f64: AsPrimitive<T>,
    u16: AsPrimitive<T>,
{
    match wire {
        DbrValue::String(v) => parse_all(v),
        other => wire_numbers(other).ok_or(MarshalError::Empty(other.get_type())),
    }
}

fn first<T>(wire: &DbrValue, values: Vec<T>) -> Result<T, MarshalError> {
    values
        .into_iter()
        .next()
        .ok_or(MarshalError::Empty(wire.get_type()))
}

/// Convert a wire value into the canonical form for `data_type`
pub fn from_wire(wire: &DbrValue, data_type: DataType) -> Result<Value, MarshalError> {
    let unsupported = || MarshalError::UnsupportedWire {
        from: wire.get_type(),
        to: data_type,
    };
    Ok(match data_type {
        DataType::Double => Value::Double(first(wire, numbers_from_wire(wire)?)?),
        DataType::Doubles => Value::Doubles(numbers_from_wire(wire)?),
        DataType::Long => Value::Long(first(wire, numbers_from_wire(wire)?)?),
        DataType::Longs => Value::Longs(numbers_from_wire(wire)?),
        DataType::Enum => Value::Enum(first(wire, numbers_from_wire(wire)?)?),
        DataType::String => Value::String(match wire {
            DbrValue::Char(chars) => chars_to_string(chars),
            other => first(wire, dbr_elements(other))?,
        }),
        DataType::Strings => Value::Strings(match wire {
            DbrValue::Char(chars) => vec![chars_to_string(chars)],
            other => dbr_elements(other),
        }),
        DataType::Object => {
            if wire.get_count() == 0 {
                return Err(MarshalError::Empty(wire.get_type()));
            }
            let mut single = wire.clone();
            // Enums are always single-valued and cannot be resized
            let _ = single.resize(1);
            Value::Object(single)
        }
        DataType::Objects => Value::Objects(wire.clone()),
        DataType::Boolean => match wire {
            DbrValue::String(_) => return Err(unsupported()),
            other => {
                let numbers: Vec<f64> = wire_numbers(other).ok_or_else(unsupported)?;
                Value::Boolean(first(wire, numbers)? != 0.0)
            }
        },
        DataType::BitSet => {
            // Widen without sign extension so each wire width fills only its own bits
            let packed = match wire {
                DbrValue::String(_) => return Err(unsupported()),
                DbrValue::Enum(e) => Some(*e as u64),
                DbrValue::Char(v) => v.first().map(|c| *c as u8 as u64),
                DbrValue::Int(v) => v.first().map(|c| *c as u16 as u64),
                DbrValue::Long(v) => v.first().map(|c| *c as u32 as u64),
                DbrValue::Float(v) => v.first().map(|c| *c as u64),
                DbrValue::Double(v) => v.first().map(|c| *c as u64),
            };
            Value::BitSet(Value::bits_from_u64(
                packed.ok_or(MarshalError::Empty(wire.get_type()))?,
            ))
        }
    })
}

/// Fill a metadata builder from whatever graphics and control information a
/// wire payload carries
///
/// Categories without that information fall back to the defaults for the
/// payload's type: the full range of the type for numeric limits, no units.
pub fn extract_metadata(base: MetaDataBuilder, dbr: &Dbr) -> MetaData {
    let kind = dbr.value().get_type();
    let default_graphics = DbrGraphics::default_for(kind);
    let graphics = dbr.graphics().unwrap_or(&default_graphics);
    let default_control = DbrControl::default_for(kind);
    let control = dbr.control().unwrap_or(&default_control);

    let mut builder = base
        .remote_type(kind)
        .units(graphics.units().unwrap_or_default());
    if let Some(precision) = graphics.precision() {
        builder = builder.precision(precision);
    }
    if let Some(limits) = graphics.limits() {
        let (dl, du) = limits.display_limits;
        let (wl, wu) = limits.warning_limits;
        let (al, au) = limits.alarm_limits;
        builder = builder
            .display_limits(dl, du)
            .warning_limits(wl, wu)
            .alarm_limits(al, au);
    }
    if let Some((lower, upper)) = control.limits() {
        builder = builder.control_limits(lower, upper);
    }
    if let Some(labels) = graphics.enum_strings() {
        builder = builder.states(labels.to_vec());
    }
    builder.build()
}

/// Convenience for building metadata straight from a payload
pub fn metadata_from(name: &str, data_type: DataType, dbr: &Dbr) -> MetaData {
    extract_metadata(
        MetaData::builder(name, data_type).element_count(dbr.value().get_count()),
        dbr,
    )
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::dbr::{AlarmStatus, Limits};

    #[test]
    fn scalars_become_single_element_arrays() {
        assert_eq!(
            to_wire(&Value::Double(2.5), DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![2.5])
        );
        assert_eq!(
            to_wire(&Value::Long(7), DbrBasicType::String).unwrap(),
            DbrValue::String(vec!["7".into()])
        );
    }

    #[test]
    fn numeric_narrowing_truncates() {
        assert_eq!(
            to_wire(&Value::Doubles(vec![1.9, -2.7]), DbrBasicType::Long).unwrap(),
            DbrValue::Long(vec![1, -2])
        );
        assert_eq!(
            to_wire(&Value::Long(300), DbrBasicType::Char).unwrap(),
            DbrValue::Char(vec![44])
        );
        let back = from_wire(&DbrValue::Long(vec![1, -2]), DataType::Doubles).unwrap();
        assert_eq!(back, Value::Doubles(vec![1.0, -2.0]));
    }

    #[test]
    fn strings_and_char_arrays() {
        let wire = to_wire(&Value::String("Hi!".into()), DbrBasicType::Char).unwrap();
        assert_eq!(wire, DbrValue::Char(vec![72, 105, 33]));
        assert_eq!(
            from_wire(&DbrValue::Char(vec![72, 105, 0, 88, 0]), DataType::String).unwrap(),
            Value::String("Hi".into())
        );
        assert_eq!(
            from_wire(&wire, DataType::String).unwrap(),
            Value::String("Hi!".into())
        );
    }

    #[test]
    fn strings_parse_into_numbers() {
        assert_eq!(
            to_wire(&Value::String(" 12 ".into()), DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![12])
        );
        assert!(matches!(
            to_wire(&Value::String("twelve".into()), DbrBasicType::Double),
            Err(MarshalError::Parse(_))
        ));
        assert_eq!(
            from_wire(&DbrValue::String(vec!["3.75".into()]), DataType::Long).unwrap(),
            Value::Long(3)
        );
    }

    #[test]
    fn booleans_are_zero_or_one() {
        assert_eq!(
            to_wire(&Value::Boolean(true), DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![1])
        );
        assert_eq!(
            to_wire(&Value::Boolean(false), DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![0.0])
        );
        assert!(to_wire(&Value::Boolean(true), DbrBasicType::String).is_err());
        assert_eq!(
            from_wire(&DbrValue::Char(vec![5]), DataType::Boolean).unwrap(),
            Value::Boolean(true)
        );
    }

    #[test]
    fn bitsets_accumulate() {
        let bits = vec![true, false, true, true];
        assert_eq!(
            to_wire(&Value::BitSet(bits.clone()), DbrBasicType::Long).unwrap(),
            DbrValue::Long(vec![13])
        );
        assert_eq!(
            from_wire(&DbrValue::Long(vec![13]), DataType::BitSet).unwrap(),
            Value::BitSet(bits)
        );
        // A negative short fills only sixteen bits
        let Value::BitSet(bits) = from_wire(&DbrValue::Int(vec![-1]), DataType::BitSet).unwrap()
        else {
            panic!("not a bitset");
        };
        assert_eq!(bits.len(), 16);
        assert!(to_wire(&Value::BitSet(vec![true]), DbrBasicType::Enum).is_err());
    }

    #[test]
    fn enums() {
        assert_eq!(
            to_wire(&Value::Enum(2), DbrBasicType::Enum).unwrap(),
            DbrValue::Enum(2)
        );
        assert_eq!(
            from_wire(&DbrValue::Long(vec![1]), DataType::Enum).unwrap(),
            Value::Enum(1)
        );
        assert!(to_wire(&Value::Longs(vec![1, 2]), DbrBasicType::Enum).is_err());
    }

    #[test]
    fn objects_pass_through() {
        let wire = DbrValue::Int(vec![4, 5, 6]);
        assert_eq!(
            from_wire(&wire, DataType::Objects).unwrap(),
            Value::Objects(wire.clone())
        );
        assert_eq!(
            from_wire(&wire, DataType::Object).unwrap(),
            Value::Object(DbrValue::Int(vec![4]))
        );
        assert_eq!(
            to_wire(&Value::Objects(wire), DbrBasicType::Double).unwrap(),
            DbrValue::Double(vec![4.0, 5.0, 6.0])
        );
    }

    #[test]
    fn empty_wire_values_fail() {
        assert_eq!(
            from_wire(&DbrValue::Double(vec![]), DataType::Double),
            Err(MarshalError::Empty(DbrBasicType::Double))
        );
    }

    #[test]
    fn metadata_from_control_payload() {
        let dbr = Dbr::Control {
            status: AlarmStatus::default(),
            graphics: DbrGraphics::Double {
                units: "mm".into(),
                precision: 2,
                limits: Limits {
                    display_limits: (-5.0, 5.0),
                    alarm_limits: (-4.0, 4.0),
                    warning_limits: (-3.0, 3.0),
                },
            },
            control: DbrControl::Double(-1.0, 1.0),
            value: DbrValue::Double(vec![0.5]),
        };
        let meta = metadata_from("MOTOR", DataType::Double, &dbr);
        assert!(meta.is_valid());
        assert_eq!(meta.units(), "mm");
        assert_eq!(meta.precision(), Some(2));
        assert_eq!(meta.display_limits(), (-5.0, 5.0));
        assert_eq!(meta.warning_limits(), (-3.0, 3.0));
        assert_eq!(meta.alarm_limits(), (-4.0, 4.0));
        assert_eq!(meta.control_limits(), (-1.0, 1.0));
        assert_eq!(meta.remote_type(), Some(DbrBasicType::Double));
    }

    #[test]
    fn metadata_defaults_without_graphics() {
        let dbr = Dbr::Time {
            status: AlarmStatus::default(),
            timestamp: SystemTime::now(),
            value: DbrValue::Int(vec![1]),
        };
        let meta = metadata_from("COUNT", DataType::Long, &dbr);
        assert_eq!(meta.units(), "");
        assert_eq!(meta.display_limits(), (i16::MIN as f64, i16::MAX as f64));
        assert_eq!(meta.control_limits(), (i16::MIN as f64, i16::MAX as f64));
    }
}
