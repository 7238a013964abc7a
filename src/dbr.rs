//! Wire representation of process variable data.
//!
//! Channel Access moves data around as [DBR] structures. These break down into seven
//! basic array types, which define the data, and five categories of attached
//! metadata. This module models that wire layer: it is what a channel provider hands
//! to, and accepts from, a [`crate::Connection`]. The canonical, provider-independent
//! view of the same data lives in [`crate::data_type`], and [`crate::marshal`]
//! converts between the two.
//!
//! The basic types are enumerated in [`DbrBasicType`] and are represented in
//! [`DbrValue`] - all numeric data types are signed and every type can be an array.
//! The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`])
//! - [`DbrValue::Int`] ([`Vec<i16>`])
//! - [`DbrValue::Long`] ([`Vec<i32>`])
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into the state labels carried by the
//!   [`DbrGraphics::Enum`] metadata.
//! - [`DbrValue::String`] - natively a `[u8; 40]`, represented here by
//!   [`Vec<String>`] and converted to fixed-length as required for encoding.
//!
//! The five metadata categories are enumerated by [`DbrCategory`] and represented by
//! [`Dbr`]:
//! - [`Dbr::Basic`] - No extra metadata included, just the plain data value.
//! - [`Dbr::Status`] - Alarm status and severity in addition to the data.
//! - [`Dbr::Time`] - All of [`Dbr::Status`], plus a timestamp.
//! - [`Dbr::Graphics`] - Status plus display information: units, precision, display,
//!   alarm and warning limits, or the state labels for enums.
//! - [`Dbr::Control`] - Everything in [`Dbr::Graphics`] plus control limits.
//!
//! [`Dbr::ClassName`] carries the record type for the PV.
//!
//! [DBR]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types
//!
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_f32, be_f64, be_i8, be_i16, be_i32, be_u16, be_u32},
};
use num::{NumCast, traits::ToBytes};
use num_traits::Bounded;
use std::{
    cmp, fmt,
    num::NonZeroUsize,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;

// Constants from EPICS
const MAX_STRING_SIZE: usize = 40;
const MAX_UNITS_SIZE: usize = 8;
const MAX_ENUM_STRING_SIZE: usize = 26;
const MAX_ENUM_STATES: usize = 16;
/// Seconds between the UNIX epoch and the EPICS epoch (1990-01-01)
const EPICS_EPOCH_OFFSET: u64 = 631152000;

type ParseResult<'a, T> = IResult<&'a [u8], T>;
type NomError<'a> = nom::error::Error<&'a [u8]>;

/// Errors from converting or decoding wire data
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DbrError {
    #[error("Value cannot be represented as the requested type")]
    NoConvert,
    #[error("Could not parse '{0}' as a number")]
    CannotParse(String),
    #[error("Malformed payload for {0:?}")]
    Malformed(DbrType),
}

/// Encode a String to a fixed-maximum-length byte array
///
/// We want to convert a string to a byte sequence but never a length > the fixed
/// field size. Truncating the encoded bytes could split a multibyte character, so
/// convert one-character-at-a-time until the length would go over.
fn string_to_fixed_length_bytes(value: &str, max_length: usize) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(max_length);
    for c in value.chars() {
        if buffer.len() + c.len_utf8() < max_length {
            let mut char_buffer = [0u8; 4];
            buffer.extend_from_slice(c.encode_utf8(&mut char_buffer).as_bytes());
        } else {
            break;
        }
    }
    buffer
}

/// Write a string into a zero-padded field of exactly `width` bytes
fn fixed_field(value: &str, width: usize) -> Vec<u8> {
    let mut buf = string_to_fixed_length_bytes(value, width);
    buf.resize(width, 0u8);
    buf
}

/// Read a zero-terminated string out of a fixed-width field
fn padded_string(width: usize) -> impl Fn(&[u8]) -> ParseResult<'_, String> {
    move |input| {
        let (rest, field) = take::<_, _, NomError>(width).parse(input)?;
        let strlen = field.iter().position(|&c| c == 0x00).unwrap_or(field.len());
        Ok((rest, String::from_utf8_lossy(&field[..strlen]).into_owned()))
    }
}

fn big_endian<T: ToBytes>(items: &[T]) -> Vec<u8> {
    items
        .iter()
        .flat_map(|v| v.to_be_bytes().as_ref().to_vec())
        .collect()
}

/// Represent actual data transferred over the wire
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

/// Error returned when trying to resize a DBR but it's a data type that can't
#[derive(Debug)]
pub struct DbrValueIsEnumError;

impl DbrValue {
    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }
    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// Convert a DbrValue::String to another data type by parsing the numeric string
    ///
    /// Fails if the value cannot be parsed. Asking for a conversion from a
    /// non-string value falls back to [`DbrValue::convert_to`].
    pub fn parse_into(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrError> {
        fn _parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, DbrError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| DbrError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return self.convert_to(basic_type);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => match val.as_slice() {
                [single] => DbrValue::Enum(
                    single
                        .trim()
                        .parse()
                        .map_err(|_| DbrError::CannotParse(single.clone()))?,
                ),
                _ => return Err(DbrError::NoConvert),
            },
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(_parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(_parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(_parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(_parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(_parse_all(val)?),
        })
    }

    /// Every element cast to `U`, failing on the first one out of range
    fn cast_elements<U: NumCast>(&self) -> Result<Vec<U>, DbrError> {
        fn cast<T: Copy + NumCast, U: NumCast>(items: &[T]) -> Result<Vec<U>, DbrError> {
            items
                .iter()
                .map(|n| NumCast::from(*n).ok_or(DbrError::NoConvert))
                .collect()
        }
        match self {
            DbrValue::Enum(index) => cast(&[*index]),
            DbrValue::Char(items) => cast(items),
            DbrValue::Int(items) => cast(items),
            DbrValue::Long(items) => cast(items),
            DbrValue::Float(items) => cast(items),
            DbrValue::Double(items) => cast(items),
            DbrValue::String(_) => Err(DbrError::NoConvert),
        }
    }

    /// Convert to another basic type, failing if any element is not representable
    ///
    /// Strings become numbers by parsing, except for `Char` where a single string is
    /// spelled out as its bytes. `Char` arrays become a single zero-terminated string.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, DbrError> {
        if self.get_type() == basic_type {
            return Ok(self.clone());
        }
        Ok(match (self, basic_type) {
            (DbrValue::String(items), DbrBasicType::Char) => match items.as_slice() {
                [] => DbrValue::Char(Vec::new()),
                [text] => DbrValue::Char(text.bytes().map(|b| b as i8).collect()),
                _ => return Err(DbrError::NoConvert),
            },
            (DbrValue::String(_), _) => self.parse_into(basic_type)?,
            (_, DbrBasicType::String) => DbrValue::String(match self {
                DbrValue::Char(chars) => {
                    let bytes = chars.iter().take_while(|c| **c != 0).map(|c| *c as u8);
                    vec![String::from_utf8(bytes.collect()).map_err(|_| DbrError::NoConvert)?]
                }
                DbrValue::Enum(index) => vec![index.to_string()],
                DbrValue::Int(items) => items.iter().map(ToString::to_string).collect(),
                DbrValue::Long(items) => items.iter().map(ToString::to_string).collect(),
                DbrValue::Float(items) => items.iter().map(ToString::to_string).collect(),
                DbrValue::Double(items) => items.iter().map(ToString::to_string).collect(),
                DbrValue::String(items) => items.clone(),
            }),
            (_, DbrBasicType::Enum) => match self.cast_elements::<u16>()?.as_slice() {
                [index] => DbrValue::Enum(*index),
                _ => return Err(DbrError::NoConvert),
            },
            (_, DbrBasicType::Char) => DbrValue::Char(self.cast_elements()?),
            (_, DbrBasicType::Int) => DbrValue::Int(self.cast_elements()?),
            (_, DbrBasicType::Long) => DbrValue::Long(self.cast_elements()?),
            (_, DbrBasicType::Float) => DbrValue::Float(self.cast_elements()?),
            (_, DbrBasicType::Double) => DbrValue::Double(self.cast_elements()?),
        })
    }

    /// Encode the value contents of a DBR into a byte vector
    ///
    /// If max_elems is `None`, then all elements available will be returned.
    ///
    /// Returns the number of elements along with the bytes
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let count = self.get_count();
        let elements = max_elems.map_or(count, |max| cmp::min(max.get(), count));
        let bytes = match self {
            DbrValue::Enum(index) => index.to_be_bytes().to_vec(),
            DbrValue::String(items) => items
                .iter()
                .take(elements)
                .flat_map(|v| fixed_field(v, MAX_STRING_SIZE))
                .collect(),
            DbrValue::Char(items) => big_endian(&items[..elements]),
            DbrValue::Int(items) => big_endian(&items[..elements]),
            DbrValue::Long(items) => big_endian(&items[..elements]),
            DbrValue::Float(items) => big_endian(&items[..elements]),
            DbrValue::Double(items) => big_endian(&items[..elements]),
        };
        (elements, bytes)
    }

    pub fn decode_value(
        data_type: DbrBasicType,
        item_count: usize,
        data: &[u8],
    ) -> ParseResult<'_, DbrValue> {
        match data_type {
            // Enums are always single-valued; extra items are ignored
            DbrBasicType::Enum => be_u16.map(DbrValue::Enum).parse(data),
            DbrBasicType::String => count(padded_string(MAX_STRING_SIZE), item_count)
                .map(DbrValue::String)
                .parse(data),
            DbrBasicType::Char => count(be_i8, item_count).map(DbrValue::Char).parse(data),
            DbrBasicType::Int => count(be_i16, item_count).map(DbrValue::Int).parse(data),
            DbrBasicType::Long => count(be_i32, item_count).map(DbrValue::Long).parse(data),
            DbrBasicType::Float => count(be_f32, item_count).map(DbrValue::Float).parse(data),
            DbrBasicType::Double => count(be_f64, item_count).map(DbrValue::Double).parse(data),
        }
    }

    pub fn resize(&mut self, to_size: usize) -> Result<(), DbrValueIsEnumError> {
        match self {
            DbrValue::Enum(_) => Err(DbrValueIsEnumError)?,
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
        Ok(())
    }
}

macro_rules! impl_dbrvalue_from {
    ($($variant:ident: $typ:ty),*) => {
        $(
            impl From<Vec<$typ>> for DbrValue {
                fn from(value: Vec<$typ>) -> Self {
                    DbrValue::$variant(value)
                }
            }
            impl From<$typ> for DbrValue {
                fn from(value: $typ) -> Self {
                    DbrValue::$variant(vec![value])
                }
            }
        )*
    };
}
impl_dbrvalue_from!(Char: i8, Int: i16, Long: i32, Float: f32, Double: f64);

impl From<Vec<String>> for DbrValue {
    fn from(value: Vec<String>) -> Self {
        DbrValue::String(value)
    }
}
impl From<String> for DbrValue {
    fn from(value: String) -> Self {
        DbrValue::String(vec![value])
    }
}
impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_owned()])
    }
}

/// The display, alarm and warning limits of a numeric PV, as (lower, upper)
#[derive(Clone, Debug, PartialEq)]
pub struct Limits<T: Bounded + ToBytes> {
    pub display_limits: (T, T),
    pub alarm_limits: (T, T),
    pub warning_limits: (T, T),
}
impl<T: Bounded + ToBytes + Copy> Limits<T> {
    fn to_be_bytes(&self) -> Vec<u8> {
        let (display_low, display_high) = self.display_limits;
        let (alarm_low, alarm_high) = self.alarm_limits;
        let (warning_low, warning_high) = self.warning_limits;
        big_endian(&[
            display_high,
            display_low,
            alarm_high,
            warning_high,
            warning_low,
            alarm_low,
        ])
    }

    pub fn map<U: Bounded + ToBytes, F: Fn(T) -> U>(&self, f: F) -> Limits<U> {
        let pair = |(low, high): (T, T)| (f(low), f(high));
        Limits {
            display_limits: pair(self.display_limits),
            alarm_limits: pair(self.alarm_limits),
            warning_limits: pair(self.warning_limits),
        }
    }

    /// Parse the six limits in wire order
    fn parse<'a, P>(parser: P) -> impl FnMut(&'a [u8]) -> ParseResult<'a, Self>
    where
        P: Parser<&'a [u8], Output = T, Error = nom::error::Error<&'a [u8]>>,
    {
        let mut six = count(parser, 6);
        move |input| {
            let (rest, v) = six.parse(input)?;
            Ok((
                rest,
                Limits {
                    display_limits: (v[1], v[0]),
                    alarm_limits: (v[5], v[2]),
                    warning_limits: (v[4], v[3]),
                },
            ))
        }
    }
}

impl<T: Bounded + ToBytes> Default for Limits<T> {
    fn default() -> Self {
        Self {
            display_limits: (T::min_value(), T::max_value()),
            alarm_limits: (T::min_value(), T::max_value()),
            warning_limits: (T::min_value(), T::max_value()),
        }
    }
}

/// Display metadata carried by the `GR` and `CTRL` categories
#[derive(Clone, Debug, PartialEq)]
pub enum DbrGraphics {
    Enum {
        strings: Vec<String>,
    },
    String,
    Char {
        units: String,
        limits: Limits<i8>,
    },
    Int {
        units: String,
        limits: Limits<i16>,
    },
    Long {
        units: String,
        limits: Limits<i32>,
    },
    Float {
        units: String,
        limits: Limits<f32>,
        precision: i16,
    },
    Double {
        units: String,
        limits: Limits<f64>,
        precision: i16,
    },
}

impl DbrGraphics {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrGraphics::String,
            DbrBasicType::Enum => DbrGraphics::Enum {
                strings: Vec::new(),
            },
            DbrBasicType::Int => DbrGraphics::Int {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Char => DbrGraphics::Char {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Long => DbrGraphics::Long {
                units: String::new(),
                limits: Limits::default(),
            },
            DbrBasicType::Float => DbrGraphics::Float {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
            DbrBasicType::Double => DbrGraphics::Double {
                units: String::new(),
                limits: Limits::default(),
                precision: 0,
            },
        }
    }

    pub fn units(&self) -> Option<&str> {
        match self {
            DbrGraphics::Enum { .. } | DbrGraphics::String => None,
            DbrGraphics::Char { units, .. }
            | DbrGraphics::Int { units, .. }
            | DbrGraphics::Long { units, .. }
            | DbrGraphics::Float { units, .. }
            | DbrGraphics::Double { units, .. } => Some(units),
        }
    }

    pub fn precision(&self) -> Option<i16> {
        match self {
            DbrGraphics::Float { precision, .. } | DbrGraphics::Double { precision, .. } => {
                Some(*precision)
            }
            _ => None,
        }
    }

    /// The limits widened to f64, if this is a numeric type
    pub fn limits(&self) -> Option<Limits<f64>> {
        match self {
            DbrGraphics::Enum { .. } | DbrGraphics::String => None,
            DbrGraphics::Char { limits, .. } => Some(limits.map(<f64 as From<_>>::from)),
            DbrGraphics::Int { limits, .. } => Some(limits.map(<f64 as From<_>>::from)),
            DbrGraphics::Long { limits, .. } => Some(limits.map(<f64 as From<_>>::from)),
            DbrGraphics::Float { limits, .. } => Some(limits.map(<f64 as From<_>>::from)),
            DbrGraphics::Double { limits, .. } => Some(limits.clone()),
        }
    }

    pub fn enum_strings(&self) -> Option<&[String]> {
        match self {
            DbrGraphics::Enum { strings } => Some(strings),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        fn with_units(units: &str, limits: Vec<u8>) -> Vec<u8> {
            let mut out = fixed_field(units, MAX_UNITS_SIZE);
            out.extend(limits);
            out
        }
        // Floating types lead with precision and two bytes of RISC padding
        fn with_precision(precision: i16, units: &str, limits: Vec<u8>) -> Vec<u8> {
            let mut out = precision.to_be_bytes().to_vec();
            out.extend([0u8; 2]);
            out.extend(with_units(units, limits));
            out
        }
        match self {
            DbrGraphics::Enum { strings } => {
                let states = cmp::min(strings.len(), MAX_ENUM_STATES);
                let mut out = (states as i16).to_be_bytes().to_vec();
                for i in 0..MAX_ENUM_STATES {
                    let label = strings.get(i).map(String::as_str).unwrap_or("");
                    out.extend(fixed_field(label, MAX_ENUM_STRING_SIZE));
                }
                out
            }
            DbrGraphics::String => Vec::new(),
            DbrGraphics::Char { units, limits } => with_units(units, limits.to_be_bytes()),
            DbrGraphics::Int { units, limits } => with_units(units, limits.to_be_bytes()),
            DbrGraphics::Long { units, limits } => with_units(units, limits.to_be_bytes()),
            DbrGraphics::Float {
                units,
                limits,
                precision,
            } => with_precision(*precision, units, limits.to_be_bytes()),
            DbrGraphics::Double {
                units,
                limits,
                precision,
            } => with_precision(*precision, units, limits.to_be_bytes()),
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> ParseResult<'_, Self> {
        let units = padded_string(MAX_UNITS_SIZE);
        match kind {
            DbrBasicType::String => Ok((input, DbrGraphics::String)),
            DbrBasicType::Enum => {
                let (input, states) = be_i16::<_, NomError>(input)?;
                let (input, labels) =
                    count(padded_string(MAX_ENUM_STRING_SIZE), MAX_ENUM_STATES).parse(input)?;
                let states = (states.max(0) as usize).min(MAX_ENUM_STATES);
                Ok((
                    input,
                    DbrGraphics::Enum {
                        strings: labels.into_iter().take(states).collect(),
                    },
                ))
            }
            DbrBasicType::Char => (units, Limits::parse(be_i8))
                .map(|(units, limits)| DbrGraphics::Char { units, limits })
                .parse(input),
            DbrBasicType::Int => (units, Limits::parse(be_i16))
                .map(|(units, limits)| DbrGraphics::Int { units, limits })
                .parse(input),
            DbrBasicType::Long => (units, Limits::parse(be_i32))
                .map(|(units, limits)| DbrGraphics::Long { units, limits })
                .parse(input),
            DbrBasicType::Float => (be_i16, take(2usize), units, Limits::parse(be_f32))
                .map(|(precision, _, units, limits)| DbrGraphics::Float {
                    units,
                    limits,
                    precision,
                })
                .parse(input),
            DbrBasicType::Double => (be_i16, take(2usize), units, Limits::parse(be_f64))
                .map(|(precision, _, units, limits)| DbrGraphics::Double {
                    units,
                    limits,
                    precision,
                })
                .parse(input),
        }
    }
}

/// Control limits, as (lower, upper), carried by the `CTRL` category
#[derive(Clone, Debug, PartialEq)]
pub enum DbrControl {
    Enum,
    String,
    Char(i8, i8),
    Int(i16, i16),
    Long(i32, i32),
    Float(f32, f32),
    Double(f64, f64),
}

impl DbrControl {
    pub fn default_for(kind: DbrBasicType) -> Self {
        match kind {
            DbrBasicType::String => DbrControl::String,
            DbrBasicType::Enum => DbrControl::Enum,
            DbrBasicType::Int => DbrControl::Int(i16::MIN, i16::MAX),
            DbrBasicType::Float => DbrControl::Float(f32::MIN, f32::MAX),
            DbrBasicType::Char => DbrControl::Char(i8::MIN, i8::MAX),
            DbrBasicType::Long => DbrControl::Long(i32::MIN, i32::MAX),
            DbrBasicType::Double => DbrControl::Double(f64::MIN, f64::MAX),
        }
    }

    /// The control limits widened to f64, if numeric
    pub fn limits(&self) -> Option<(f64, f64)> {
        match *self {
            DbrControl::Enum | DbrControl::String => None,
            DbrControl::Char(l, u) => Some((l.into(), u.into())),
            DbrControl::Int(l, u) => Some((l.into(), u.into())),
            DbrControl::Long(l, u) => Some((l.into(), u.into())),
            DbrControl::Float(l, u) => Some((l.into(), u.into())),
            DbrControl::Double(l, u) => Some((l, u)),
        }
    }

    // Wire order is upper, then lower
    fn to_be_bytes(&self) -> Vec<u8> {
        match *self {
            DbrControl::Enum | DbrControl::String => Vec::new(),
            DbrControl::Char(low, high) => big_endian(&[high, low]),
            DbrControl::Int(low, high) => big_endian(&[high, low]),
            DbrControl::Long(low, high) => big_endian(&[high, low]),
            DbrControl::Float(low, high) => big_endian(&[high, low]),
            DbrControl::Double(low, high) => big_endian(&[high, low]),
        }
    }

    fn parse(kind: DbrBasicType, input: &[u8]) -> ParseResult<'_, Self> {
        match kind {
            DbrBasicType::String => Ok((input, DbrControl::String)),
            DbrBasicType::Enum => Ok((input, DbrControl::Enum)),
            DbrBasicType::Char => (be_i8, be_i8)
                .map(|(u, l)| DbrControl::Char(l, u))
                .parse(input),
            DbrBasicType::Int => (be_i16, be_i16)
                .map(|(u, l)| DbrControl::Int(l, u))
                .parse(input),
            DbrBasicType::Long => (be_i32, be_i32)
                .map(|(u, l)| DbrControl::Long(l, u))
                .parse(input),
            DbrBasicType::Float => (be_f32, be_f32)
                .map(|(u, l)| DbrControl::Float(l, u))
                .parse(input),
            DbrBasicType::Double => (be_f64, be_f64)
                .map(|(u, l)| DbrControl::Double(l, u))
                .parse(input),
        }
    }
}

/// Basic DBR Data types, independent of category
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}
impl fmt::Display for DbrBasicType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "STRING",
            Self::Int => "INT",
            Self::Float => "FLOAT",
            Self::Enum => "ENUM",
            Self::Char => "CHAR",
            Self::Long => "LONG",
            Self::Double => "DOUBLE",
        };
        f.write_str(name)
    }
}

/// Mapping of DBR categories
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrCategory {
    Basic = 0,
    Status = 1,
    Time = 2,
    Graphics = 3,
    Control = 4,
    /// The special single-valued DBR_CLASS_NAME
    ClassName = 8,
}
/// A basic type paired with its metadata category, one of the `DBR_*_*` types
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DbrType {
    pub basic_type: DbrBasicType,
    pub category: DbrCategory,
}

pub const DBR_CLASS_NAME: DbrType = DbrType {
    basic_type: DbrBasicType::String,
    category: DbrCategory::ClassName,
};

impl DbrType {
    /// Give the lookup for the padding for each DBR type
    ///
    /// When encoding a return packet, there is a datatype-specific
    /// padding to be inserted between the metadata about the value and
    /// the actual value itself. This is given as a lookup table rather
    /// than a calculation. The float/double graphics padding sits between
    /// precision and units, and is written by [`DbrGraphics`] itself.
    ///
    /// See <https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types>
    pub fn get_metadata_padding(&self) -> usize {
        match (self.category, self.basic_type) {
            (DbrCategory::Status, DbrBasicType::Char) => 1,
            (DbrCategory::Status, DbrBasicType::Double) => 4,
            (DbrCategory::Time, DbrBasicType::Int) => 2,
            (DbrCategory::Time, DbrBasicType::Enum) => 2,
            (DbrCategory::Time, DbrBasicType::Char) => 3,
            (DbrCategory::Time, DbrBasicType::Double) => 4,
            (DbrCategory::Graphics, DbrBasicType::Char) => 1,
            (DbrCategory::Control, DbrBasicType::Char) => 1,
            _ => 0,
        }
    }
    pub fn new(basic_type: DbrBasicType, category: DbrCategory) -> Self {
        Self {
            basic_type,
            category,
        }
    }
}

/// Alarm status and severity of the record, as sent on the wire
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AlarmStatus {
    pub status: i16,
    pub severity: i16,
}

impl AlarmStatus {
    pub const NO_ALARM: i16 = 0;
    pub const MINOR: i16 = 1;
    pub const MAJOR: i16 = 2;
    pub const INVALID: i16 = 3;

    pub fn new(status: i16, severity: i16) -> Self {
        AlarmStatus { status, severity }
    }
}

/// Structured unit of exchange for records on the wire
#[derive(Clone, Debug, PartialEq)]
pub enum Dbr {
    /// Value only, with no metadata
    Basic(DbrValue),
    /// Alarm status metadata alongside the record value
    Status {
        status: AlarmStatus,
        value: DbrValue,
    },
    /// Timestamp, alarm status, and value
    Time {
        status: AlarmStatus,
        timestamp: SystemTime,
        value: DbrValue,
    },
    Graphics {
        status: AlarmStatus,
        graphics: DbrGraphics,
        value: DbrValue,
    },
    Control {
        status: AlarmStatus,
        graphics: DbrGraphics,
        control: DbrControl,
        value: DbrValue,
    },
    ClassName(DbrValue),
}

impl Dbr {
    pub fn take_value(self) -> DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::ClassName(value) => value,
            Dbr::Status { value, .. }
            | Dbr::Time { value, .. }
            | Dbr::Graphics { value, .. }
            | Dbr::Control { value, .. } => value,
        }
    }
    /// Retrieve the [`DbrValue`] contained by this DBR
    pub fn value(&self) -> &DbrValue {
        match self {
            Dbr::Basic(value) | Dbr::ClassName(value) => value,
            Dbr::Status { value, .. }
            | Dbr::Time { value, .. }
            | Dbr::Graphics { value, .. }
            | Dbr::Control { value, .. } => value,
        }
    }
    /// Alarm status, for every category except `Basic` and `ClassName`
    pub fn status(&self) -> Option<AlarmStatus> {
        match self {
            Dbr::Basic(_) | Dbr::ClassName(_) => None,
            Dbr::Status { status, .. }
            | Dbr::Time { status, .. }
            | Dbr::Graphics { status, .. }
            | Dbr::Control { status, .. } => Some(*status),
        }
    }
    pub fn timestamp(&self) -> Option<SystemTime> {
        match self {
            Dbr::Time { timestamp, .. } => Some(*timestamp),
            _ => None,
        }
    }
    pub fn graphics(&self) -> Option<&DbrGraphics> {
        match self {
            Dbr::Graphics { graphics, .. } | Dbr::Control { graphics, .. } => Some(graphics),
            _ => None,
        }
    }
    pub fn control(&self) -> Option<&DbrControl> {
        match self {
            Dbr::Control { control, .. } => Some(control),
            _ => None,
        }
    }
    pub fn data_type(&self) -> DbrType {
        let category = match self {
            Dbr::Basic(_) => DbrCategory::Basic,
            Dbr::Status { .. } => DbrCategory::Status,
            Dbr::Time { .. } => DbrCategory::Time,
            Dbr::Graphics { .. } => DbrCategory::Graphics,
            Dbr::Control { .. } => DbrCategory::Control,
            Dbr::ClassName(_) => return DBR_CLASS_NAME,
        };
        DbrType {
            basic_type: self.value().get_type(),
            category,
        }
    }

    pub fn from_bytes(data_type: DbrType, data_count: usize, data: &[u8]) -> Result<Dbr, DbrError> {
        Self::parse(data_type, data_count, data)
            .map(|(_, dbr)| dbr)
            .map_err(|_| DbrError::Malformed(data_type))
    }

    fn parse(data_type: DbrType, data_count: usize, data: &[u8]) -> ParseResult<'_, Dbr> {
        let basic = data_type.basic_type;
        let (data, status) = if matches!(
            data_type.category,
            DbrCategory::Basic | DbrCategory::ClassName
        ) {
            (data, None)
        } else {
            let (d, (status, severity)) = (be_i16::<_, NomError>, be_i16).parse(data)?;
            (d, Some(AlarmStatus { status, severity }))
        };

        let (data, timestamp) = if data_type.category == DbrCategory::Time {
            let (input, (time_s, time_ns)) = (be_u32::<_, NomError>, be_u32).parse(data)?;
            let since_unix = Duration::new(
                time_s as u64 + EPICS_EPOCH_OFFSET,
                time_ns % 1_000_000_000,
            );
            (input, Some(UNIX_EPOCH + since_unix))
        } else {
            (data, None)
        };

        let (data, graphics) = if matches!(
            data_type.category,
            DbrCategory::Graphics | DbrCategory::Control
        ) {
            let (d, g) = DbrGraphics::parse(basic, data)?;
            (d, Some(g))
        } else {
            (data, None)
        };
        let (data, control) = if data_type.category == DbrCategory::Control {
            let (d, c) = DbrControl::parse(basic, data)?;
            (d, Some(c))
        } else {
            (data, None)
        };

        // Offset the read buffer to account for metadata padding
        let (data, _) = take::<_, _, NomError>(data_type.get_metadata_padding()).parse(data)?;
        let (rest, value) = DbrValue::decode_value(basic, data_count, data)?;
        let status = status.unwrap_or_default();

        Ok((
            rest,
            match (data_type.category, timestamp, graphics, control) {
                (DbrCategory::Basic, ..) => Dbr::Basic(value),
                (DbrCategory::ClassName, ..) => Dbr::ClassName(value),
                (DbrCategory::Status, ..) => Dbr::Status { status, value },
                (DbrCategory::Time, Some(timestamp), ..) => Dbr::Time {
                    status,
                    timestamp,
                    value,
                },
                (DbrCategory::Graphics, _, Some(graphics), _) => Dbr::Graphics {
                    status,
                    graphics,
                    value,
                },
                (DbrCategory::Control, _, Some(graphics), Some(control)) => Dbr::Control {
                    status,
                    graphics,
                    control,
                    value,
                },
                _ => {
                    return Err(nom::Err::Failure(nom::error::Error::new(
                        rest,
                        nom::error::ErrorKind::Verify,
                    )));
                }
            },
        ))
    }

    /// Encode the full DBR, metadata first, returning the element count actually sent
    pub fn to_bytes(&self, max_elems: Option<NonZeroUsize>) -> (usize, Vec<u8>) {
        let (elements, data) = self.value().to_bytes(max_elems);
        let mut out = Vec::with_capacity(data.len() + 16);
        if let Some(AlarmStatus { status, severity }) = self.status() {
            out.extend(status.to_be_bytes());
            out.extend(severity.to_be_bytes());
        }
        match self {
            Dbr::Time { timestamp, .. } => {
                let since_unix = timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
                let seconds = since_unix.as_secs().saturating_sub(EPICS_EPOCH_OFFSET) as u32;
                out.extend(seconds.to_be_bytes());
                out.extend(since_unix.subsec_nanos().to_be_bytes());
            }
            Dbr::Graphics { graphics, .. } => out.extend(graphics.to_bytes()),
            Dbr::Control {
                graphics, control, ..
            } => {
                out.extend(graphics.to_bytes());
                out.extend(control.to_be_bytes());
            }
            _ => (),
        }
        out.resize(out.len() + self.data_type().get_metadata_padding(), 0);
        out.extend(data);
        (elements, out)
    }

    /// Convert to another DBR type, filling in any missing metadata with defaults
    pub fn convert_to(&self, dbr_type: DbrType) -> Result<Dbr, DbrError> {
        if let Dbr::ClassName(value) = self {
            // ClassName cannot be converted as it isn't a normal form of data
            return match dbr_type.category {
                DbrCategory::ClassName => Ok(Dbr::ClassName(value.clone())),
                _ => Err(DbrError::NoConvert),
            };
        }
        let value = self.value().convert_to(dbr_type.basic_type)?;
        let status = self.status().unwrap_or_default();
        let timestamp = self.timestamp().unwrap_or_else(SystemTime::now);
        // Graphics only survive conversion if the basic type is unchanged
        let same_type = value.get_type() == self.value().get_type();
        let graphics = self
            .graphics()
            .filter(|_| same_type)
            .cloned()
            .unwrap_or_else(|| DbrGraphics::default_for(value.get_type()));
        let control = self
            .control()
            .filter(|_| same_type)
            .cloned()
            .unwrap_or_else(|| DbrControl::default_for(value.get_type()));

        Ok(match dbr_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics,
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics,
                control,
                value,
            },
            DbrCategory::ClassName => return Err(DbrError::NoConvert),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::vec;

    use super::*;

    #[test]
    fn single_or_vec() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert!(v.convert_to(DbrBasicType::Char).is_err());
        assert_eq!(v.to_bytes(None).1, vec![0x00, 0x00, 0x01, 0xF4]);
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap().to_bytes(None).1,
            vec![0x01, 0xF4]
        );

        let data = vec![500.23f32, 12.7f32];
        let v: DbrValue = data.clone().into();
        assert_eq!(v.get_count(), 2);
        assert_eq!(
            v.to_bytes(NonZeroUsize::new(1)).1,
            data.iter()
                .take(1)
                .flat_map(|v| v.to_be_bytes())
                .collect::<Vec<u8>>()
        );
        // Try converting this to an int with truncation
        let v = v.convert_to(DbrBasicType::Int).unwrap();
        assert_eq!(v.to_bytes(None).1, vec![0x01, 0xf4, 0x00, 0x0c]);
    }

    #[test]
    fn encode_dbr() {
        let example_packet = [
            0x0, 0x0, 0x0, 0x0, 0x42, 0x32, 0x19, 0x99, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x0, 0x2a,
        ];
        let dbr = Dbr::Time {
            status: AlarmStatus::default(),
            timestamp: SystemTime::UNIX_EPOCH
                .checked_add(Duration::from_secs(1741731609))
                .unwrap(),
            value: vec![42i32].into(),
        };

        let (_size, out_data) = dbr.to_bytes(None);
        assert_eq!(out_data, example_packet);
        let back = Dbr::from_bytes(dbr.data_type(), 1, &out_data).unwrap();
        assert_eq!(back, dbr);
    }

    #[test]
    fn test_string_to_char() {
        let test_string = "a test string".to_string();
        let s = DbrValue::String(vec![test_string.clone()]);
        let as_char = s.convert_to(DbrBasicType::Char).unwrap();
        let re_s = as_char.convert_to(DbrBasicType::String).unwrap();

        assert_eq!(s, re_s);
    }

    #[test]
    fn test_numeric_strings_parse() {
        let s = DbrValue::String(vec![" 42 ".to_string()]);
        assert_eq!(s.parse_into(DbrBasicType::Long).unwrap(), DbrValue::Long(vec![42]));
        assert_eq!(
            DbrValue::String(vec!["nope".into()]).parse_into(DbrBasicType::Double),
            Err(DbrError::CannotParse("nope".into()))
        );
    }

    #[test]
    fn control_double_layout() {
        let dbr = Dbr::Control {
            status: AlarmStatus::new(3, AlarmStatus::MINOR),
            graphics: DbrGraphics::Double {
                units: "mA".into(),
                limits: Limits {
                    display_limits: (0.0, 100.0),
                    alarm_limits: (-1.0, 101.0),
                    warning_limits: (1.0, 99.0),
                },
                precision: 3,
            },
            control: DbrControl::Double(0.0, 50.0),
            value: vec![1.5f64, 2.5].into(),
        };
        let (elements, bytes) = dbr.to_bytes(None);
        assert_eq!(elements, 2);
        // status(4) + precision/pad(4) + units(8) + limits(48) + control(16) + data(16)
        assert_eq!(bytes.len(), 4 + 4 + 8 + 48 + 16 + 16);
        assert_eq!(&bytes[8..10], b"mA");
        let back = Dbr::from_bytes(dbr.data_type(), 2, &bytes).unwrap();
        assert_eq!(back, dbr);
    }

    #[test]
    fn integer_limits_widen_to_double() {
        let graphics = DbrGraphics::Int {
            units: "V".into(),
            limits: Limits {
                display_limits: (-10, 10),
                alarm_limits: (-8, 8),
                warning_limits: (-5, 5),
            },
        };
        let widened = graphics.limits().unwrap();
        assert_eq!(widened.display_limits, (-10.0, 10.0));
        assert_eq!(widened.alarm_limits, (-8.0, 8.0));
        assert_eq!(widened.warning_limits, (-5.0, 5.0));
        assert!(DbrGraphics::String.limits().is_none());
    }

    #[test]
    fn graphics_enum_labels() {
        let dbr = Dbr::Graphics {
            status: AlarmStatus::default(),
            graphics: DbrGraphics::Enum {
                strings: vec!["Off".into(), "On".into()],
            },
            value: DbrValue::Enum(1),
        };
        let (_, bytes) = dbr.to_bytes(None);
        assert_eq!(bytes.len(), 4 + 2 + 16 * 26 + 2);
        let back = Dbr::from_bytes(dbr.data_type(), 1, &bytes).unwrap();
        assert_eq!(
            back.graphics().and_then(|g| g.enum_strings()),
            Some(&["Off".to_string(), "On".to_string()][..])
        );
    }

    #[test]
    fn truncated_payload_is_error() {
        let dbr_type = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        assert_eq!(
            Dbr::from_bytes(dbr_type, 1, &[0u8; 6]),
            Err(DbrError::Malformed(dbr_type))
        );
    }
}
