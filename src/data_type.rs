//! Canonical in-memory representations of channel values.

use std::fmt::{self, Display};

use crate::{
    dbr::{DbrBasicType, DbrValue},
    marshal::MarshalError,
};

/// The shape a [`crate::Connection`] presents its channel's value in
///
/// Each kind maps to one [`Value`] variant, and drives how wire data is
/// marshalled in and out.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Double,
    Doubles,
    Long,
    Longs,
    String,
    Strings,
    /// The first element of the native wire value, untouched
    Object,
    /// The native wire value, untouched
    Objects,
    BitSet,
    Enum,
    Boolean,
}

impl DataType {
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            DataType::Doubles | DataType::Longs | DataType::Strings | DataType::Objects
        )
    }

    /// The wire type to request reads in, given the channel's native type
    pub fn wire_type(&self, native: Option<DbrBasicType>) -> DbrBasicType {
        match self {
            DataType::Double | DataType::Doubles => DbrBasicType::Double,
            DataType::Long | DataType::Longs | DataType::BitSet => DbrBasicType::Long,
            // Character arrays carry long strings; ask for them as-is
            DataType::String if native == Some(DbrBasicType::Char) => DbrBasicType::Char,
            DataType::String | DataType::Strings => DbrBasicType::String,
            DataType::Object | DataType::Objects => native.unwrap_or(DbrBasicType::Double),
            DataType::Enum => DbrBasicType::Enum,
            DataType::Boolean => DbrBasicType::Int,
        }
    }

    /// Choose the natural DataType for a channel with the given native type
    /// and element count
    pub fn default_for(native: DbrBasicType, count: usize) -> DataType {
        let array = count > 1;
        match native {
            DbrBasicType::Double | DbrBasicType::Float if array => DataType::Doubles,
            DbrBasicType::Double | DbrBasicType::Float => DataType::Double,
            DbrBasicType::Int | DbrBasicType::Long if array => DataType::Longs,
            DbrBasicType::Int | DbrBasicType::Long => DataType::Long,
            // A char waveform is almost always a long string
            DbrBasicType::Char if array => DataType::String,
            DbrBasicType::Char => DataType::Long,
            DbrBasicType::String if array => DataType::Strings,
            DbrBasicType::String => DataType::String,
            DbrBasicType::Enum => DataType::Enum,
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A channel value in its canonical form
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Double(f64),
    Doubles(Vec<f64>),
    Long(i64),
    Longs(Vec<i64>),
    String(String),
    Strings(Vec<String>),
    Object(DbrValue),
    Objects(DbrValue),
    /// Bit 0 first
    BitSet(Vec<bool>),
    Enum(u16),
    Boolean(bool),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Double(_) => DataType::Double,
            Value::Doubles(_) => DataType::Doubles,
            Value::Long(_) => DataType::Long,
            Value::Longs(_) => DataType::Longs,
            Value::String(_) => DataType::String,
            Value::Strings(_) => DataType::Strings,
            Value::Object(_) => DataType::Object,
            Value::Objects(_) => DataType::Objects,
            Value::BitSet(_) => DataType::BitSet,
            Value::Enum(_) => DataType::Enum,
            Value::Boolean(_) => DataType::Boolean,
        }
    }

    /// Pack a bitset into an integer, bit 0 lowest. Bits past 64 are dropped.
    pub fn bits_to_u64(bits: &[bool]) -> u64 {
        bits.iter()
            .take(64)
            .enumerate()
            .filter(|(_, b)| **b)
            .fold(0u64, |acc, (i, _)| acc | (1 << i))
    }

    /// Unpack an integer into a bitset, trimmed after the highest set bit
    pub fn bits_from_u64(value: u64) -> Vec<bool> {
        let width = 64 - value.leading_zeros() as usize;
        (0..width).map(|i| value & (1 << i) != 0).collect()
    }
}

/// Render the elements of a wire value, one string per element
pub(crate) fn dbr_elements(value: &DbrValue) -> Vec<String> {
    fn each<T: Display>(v: &[T]) -> Vec<String> {
        v.iter().map(ToString::to_string).collect()
    }
    match value {
        DbrValue::Enum(e) => vec![e.to_string()],
        DbrValue::String(v) => v.clone(),
        DbrValue::Char(v) => each(v),
        DbrValue::Int(v) => each(v),
        DbrValue::Long(v) => each(v),
        DbrValue::Float(v) => each(v),
        DbrValue::Double(v) => each(v),
    }
}

fn write_list<T: Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    f.write_str("[")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str("]")
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Double(v) => write!(f, "{v}"),
            Value::Long(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Enum(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Doubles(v) => write_list(f, v),
            Value::Longs(v) => write_list(f, v),
            Value::Strings(v) => write_list(f, v),
            Value::BitSet(bits) => {
                let as_digits: Vec<u8> = bits.iter().map(|b| *b as u8).collect();
                write_list(f, &as_digits)
            }
            Value::Object(v) => match dbr_elements(v).as_slice() {
                [single] => f.write_str(single),
                many => write_list(f, many),
            },
            Value::Objects(v) => write_list(f, &dbr_elements(v)),
        }
    }
}

macro_rules! impl_value_from {
    ($variant:ident, $typ:ty) => {
        impl From<$typ> for Value {
            fn from(value: $typ) -> Self {
                Value::$variant(value)
            }
        }
    };
}
impl_value_from!(Double, f64);
impl_value_from!(Doubles, Vec<f64>);
impl_value_from!(Long, i64);
impl_value_from!(Longs, Vec<i64>);
impl_value_from!(String, String);
impl_value_from!(Strings, Vec<String>);
impl_value_from!(BitSet, Vec<bool>);
impl_value_from!(Enum, u16);
impl_value_from!(Boolean, bool);
impl_value_from!(Objects, DbrValue);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}
impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Long(value.into())
    }
}

fn mismatch(value: &Value, wanted: &'static str) -> MarshalError {
    MarshalError::Extract {
        from: value.data_type(),
        to: wanted,
    }
}

impl TryFrom<Value> for f64 {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Double(v) => Ok(v),
            Value::Long(v) => Ok(v as f64),
            Value::Enum(v) => Ok(v.into()),
            other => Err(mismatch(&other, "f64")),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Long(v) => Ok(v),
            Value::Enum(v) => Ok(v.into()),
            Value::Boolean(v) => Ok(v.into()),
            Value::BitSet(bits) => Ok(Value::bits_to_u64(&bits) as i64),
            other => Err(mismatch(&other, "i64")),
        }
    }
}

impl TryFrom<Value> for u16 {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Enum(v) => Ok(v),
            Value::Long(v) => u16::try_from(v).map_err(|_| mismatch(&Value::Long(v), "u16")),
            other => Err(mismatch(&other, "u16")),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Boolean(v) => Ok(v),
            Value::Long(v) => Ok(v != 0),
            other => Err(mismatch(&other, "bool")),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(v) => Ok(v),
            other => Ok(other.to_string()),
        }
    }
}

impl TryFrom<Value> for Vec<f64> {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Doubles(v) => Ok(v),
            Value::Longs(v) => Ok(v.into_iter().map(|x| x as f64).collect()),
            Value::Double(v) => Ok(vec![v]),
            other => Err(mismatch(&other, "Vec<f64>")),
        }
    }
}

impl TryFrom<Value> for Vec<i64> {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Longs(v) => Ok(v),
            Value::Long(v) => Ok(vec![v]),
            other => Err(mismatch(&other, "Vec<i64>")),
        }
    }
}

impl TryFrom<Value> for Vec<String> {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Strings(v) => Ok(v),
            Value::String(v) => Ok(vec![v]),
            other => Err(mismatch(&other, "Vec<String>")),
        }
    }
}

impl TryFrom<Value> for Vec<bool> {
    type Error = MarshalError;
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::BitSet(v) => Ok(v),
            Value::Long(v) => Ok(Value::bits_from_u64(v as u64)),
            other => Err(mismatch(&other, "Vec<bool>")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_arrays_and_scalars() {
        assert_eq!(Value::Doubles(vec![1.5, 2.0, 3.0]).to_string(), "[1.5, 2, 3]");
        assert_eq!(Value::Long(42).to_string(), "42");
        assert_eq!(
            Value::Strings(vec!["a".into(), "b".into()]).to_string(),
            "[a, b]"
        );
        assert_eq!(Value::Object(DbrValue::Int(vec![7])).to_string(), "7");
        assert_eq!(Value::Objects(DbrValue::Int(vec![7, 8])).to_string(), "[7, 8]");
        assert_eq!(Value::BitSet(vec![true, false, true]).to_string(), "[1, 0, 1]");
    }

    #[test]
    fn bitset_packing() {
        assert_eq!(Value::bits_to_u64(&[true, false, true]), 5);
        assert_eq!(Value::bits_from_u64(5), vec![true, false, true]);
        assert!(Value::bits_from_u64(0).is_empty());
        // Bit 64 and up cannot be represented
        let mut wide = vec![false; 70];
        wide[0] = true;
        wide[65] = true;
        assert_eq!(Value::bits_to_u64(&wide), 1);
        assert_eq!(Value::bits_from_u64(u64::MAX).len(), 64);
    }

    #[test]
    fn native_conversions() {
        assert_eq!(f64::try_from(Value::Long(3)).unwrap(), 3.0);
        assert_eq!(i64::try_from(Value::Boolean(true)).unwrap(), 1);
        assert_eq!(u16::try_from(Value::Enum(4)).unwrap(), 4);
        assert!(u16::try_from(Value::Long(-1)).is_err());
        assert!(bool::try_from(Value::String("x".into())).is_err());
        assert_eq!(String::try_from(Value::Doubles(vec![1.0])).unwrap(), "[1]");
        assert_eq!(
            Vec::<f64>::try_from(Value::Longs(vec![1, 2])).unwrap(),
            vec![1.0, 2.0]
        );
        assert!(Vec::<i64>::try_from(Value::Doubles(vec![1.0])).is_err());
    }

    #[test]
    fn default_types_for_native() {
        assert_eq!(DataType::default_for(DbrBasicType::Double, 1), DataType::Double);
        assert_eq!(DataType::default_for(DbrBasicType::Float, 10), DataType::Doubles);
        assert_eq!(DataType::default_for(DbrBasicType::Char, 40), DataType::String);
        assert_eq!(DataType::default_for(DbrBasicType::Long, 3), DataType::Longs);
        assert_eq!(DataType::default_for(DbrBasicType::Enum, 1), DataType::Enum);
        assert_eq!(
            DataType::String.wire_type(Some(DbrBasicType::Char)),
            DbrBasicType::Char
        );
        assert_eq!(
            DataType::Objects.wire_type(Some(DbrBasicType::Int)),
            DbrBasicType::Int
        );
    }
}
