use std::fmt::Debug;

use crate::engine::tsm1::block::{
    BLOCK_BOOLEAN, BLOCK_FLOAT64, BLOCK_INTEGER, BLOCK_STRING, BLOCK_UNSIGNED,
};

pub trait FieldType:
    Send + Sync + Sized + Debug + Clone + PartialOrd + PartialEq + Default
{
}

impl FieldType for f64 {}
impl FieldType for i64 {}
impl FieldType for bool {}
impl FieldType for Vec<u8> {}
impl FieldType for u64 {}

#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub struct TimeValue<T>
where
    T: FieldType,
{
    pub unix_nano: i64,
    pub value: T,
}

impl<T> TimeValue<T>
where
    T: FieldType,
{
    pub fn new(unix_nano: i64, value: T) -> Self {
        Self { unix_nano, value }
    }
}

pub type FloatValues = Vec<TimeValue<f64>>;
pub type IntegerValues = Vec<TimeValue<i64>>;
pub type BoolValues = Vec<TimeValue<bool>>;
pub type StringValues = Vec<TimeValue<Vec<u8>>>;
pub type UnsignedValues = Vec<TimeValue<u64>>;

/// Values is a typed run of timestamped points for one series field.
/// A given key has a single fixed type within a segment file.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Float(FloatValues),
    Integer(IntegerValues),
    Bool(BoolValues),
    String(StringValues),
    Unsigned(UnsignedValues),
}

macro_rules! for_each_variant {
    ($self:expr, $values:ident, $body:expr) => {
        match $self {
            Values::Float($values) => $body,
            Values::Integer($values) => $body,
            Values::Bool($values) => $body,
            Values::String($values) => $body,
            Values::Unsigned($values) => $body,
        }
    };
}

impl Values {
    /// with_block_type returns an empty run of the given block type.
    pub fn with_block_type(typ: u8) -> anyhow::Result<Values> {
        match typ {
            BLOCK_FLOAT64 => Ok(Values::Float(Vec::new())),
            BLOCK_INTEGER => Ok(Values::Integer(Vec::new())),
            BLOCK_BOOLEAN => Ok(Values::Bool(Vec::new())),
            BLOCK_STRING => Ok(Values::String(Vec::new())),
            BLOCK_UNSIGNED => Ok(Values::Unsigned(Vec::new())),
            _ => Err(anyhow!("unknown block type: {}", typ)),
        }
    }

    pub fn block_type(&self) -> u8 {
        match self {
            Values::Float(_) => BLOCK_FLOAT64,
            Values::Integer(_) => BLOCK_INTEGER,
            Values::Bool(_) => BLOCK_BOOLEAN,
            Values::String(_) => BLOCK_STRING,
            Values::Unsigned(_) => BLOCK_UNSIGNED,
        }
    }

    pub fn len(&self) -> usize {
        for_each_variant!(self, v, v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// min_time returns the first timestamp; the run must be non-empty.
    pub fn min_time(&self) -> i64 {
        for_each_variant!(self, v, v[0].unix_nano)
    }

    /// max_time returns the last timestamp; the run must be non-empty.
    pub fn max_time(&self) -> i64 {
        for_each_variant!(self, v, v[v.len() - 1].unix_nano)
    }

    /// merge combines two runs of the same type into one sorted,
    /// deduplicated run. On equal timestamps the value from `other` wins.
    pub fn merge(self, other: Values) -> anyhow::Result<Values> {
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => Ok(Values::Float(merge_typed(a, b))),
            (Values::Integer(a), Values::Integer(b)) => Ok(Values::Integer(merge_typed(a, b))),
            (Values::Bool(a), Values::Bool(b)) => Ok(Values::Bool(merge_typed(a, b))),
            (Values::String(a), Values::String(b)) => Ok(Values::String(merge_typed(a, b))),
            (Values::Unsigned(a), Values::Unsigned(b)) => Ok(Values::Unsigned(merge_typed(a, b))),
            (a, b) => Err(anyhow!(
                "cannot merge block types {} and {}",
                a.block_type(),
                b.block_type()
            )),
        }
    }

    /// include retains only the values with `min <= unix_nano <= max`.
    pub fn include(self, min: i64, max: i64) -> Values {
        fn filter<T: FieldType>(v: Vec<TimeValue<T>>, min: i64, max: i64) -> Vec<TimeValue<T>> {
            v.into_iter()
                .filter(|x| x.unix_nano >= min && x.unix_nano <= max)
                .collect()
        }
        match self {
            Values::Float(v) => Values::Float(filter(v, min, max)),
            Values::Integer(v) => Values::Integer(filter(v, min, max)),
            Values::Bool(v) => Values::Bool(filter(v, min, max)),
            Values::String(v) => Values::String(filter(v, min, max)),
            Values::Unsigned(v) => Values::Unsigned(filter(v, min, max)),
        }
    }

    /// chunk splits the run into consecutive runs of at most `size` points.
    pub fn chunk(self, size: usize) -> Vec<Values> {
        fn split<T: FieldType>(v: Vec<TimeValue<T>>, size: usize) -> Vec<Vec<TimeValue<T>>> {
            let mut out = Vec::with_capacity(v.len() / size + 1);
            let mut rest = v;
            while rest.len() > size {
                let tail = rest.split_off(size);
                out.push(rest);
                rest = tail;
            }
            if !rest.is_empty() {
                out.push(rest);
            }
            out
        }
        match self {
            Values::Float(v) => split(v, size).into_iter().map(Values::Float).collect(),
            Values::Integer(v) => split(v, size).into_iter().map(Values::Integer).collect(),
            Values::Bool(v) => split(v, size).into_iter().map(Values::Bool).collect(),
            Values::String(v) => split(v, size).into_iter().map(Values::String).collect(),
            Values::Unsigned(v) => split(v, size).into_iter().map(Values::Unsigned).collect(),
        }
    }
}

/// merge_typed merges two timestamp-sorted runs; values from `b` win on
/// duplicate timestamps.
fn merge_typed<T: FieldType>(a: Vec<TimeValue<T>>, b: Vec<TimeValue<T>>) -> Vec<TimeValue<T>> {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }

    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if x.unix_nano < y.unix_nano {
                    out.push(a.next().unwrap());
                } else if x.unix_nano > y.unix_nano {
                    out.push(b.next().unwrap());
                } else {
                    a.next();
                    out.push(b.next().unwrap());
                }
            }
            (Some(_), None) => out.push(a.next().unwrap()),
            (None, Some(_)) => out.push(b.next().unwrap()),
            (None, None) => break,
        }
    }
    out
}
