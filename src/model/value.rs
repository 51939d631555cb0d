//! Query result values and their wire rendering.

use super::labels::Labels;
use super::time::Timestamp;
use serde::ser::{SerializeSeq, SerializeStruct, SerializeTuple};
use serde::{Serialize, Serializer};

/// A single timestamped float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub t: Timestamp,
    pub v: f64,
}

impl Sample {
    pub fn new(t: Timestamp, v: f64) -> Self {
        Self { t, v }
    }
}

/// Rendered as `[<unix seconds>, "<value>"]`.
impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&UnixSeconds(self.t))?;
        tup.serialize_element(&format_float(self.v))?;
        tup.end()
    }
}

/// Millisecond timestamp rendered as fractional Unix seconds.
#[derive(Debug, Clone, Copy)]
pub struct UnixSeconds(pub Timestamp);

impl Serialize for UnixSeconds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0 % 1000 == 0 {
            serializer.serialize_i64(self.0 / 1000)
        } else {
            serializer.serialize_f64(self.0 as f64 / 1000.0)
        }
    }
}

/// A stored series: its identity plus samples in time order.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

/// One element of an instant vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSample {
    pub metric: Labels,
    pub sample: Sample,
}

impl Serialize for VectorSample {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("VectorSample", 2)?;
        st.serialize_field("metric", &self.metric)?;
        st.serialize_field("value", &self.sample)?;
        st.end()
    }
}

/// One element of a range matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSeries {
    pub metric: Labels,
    pub values: Vec<Sample>,
}

impl Serialize for MatrixSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("MatrixSeries", 2)?;
        st.serialize_field("metric", &self.metric)?;
        st.serialize_field("values", &self.values)?;
        st.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Scalar,
    String,
    Vector,
    Matrix,
}

/// The result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Sample),
    String { t: Timestamp, value: String },
    Vector(Vec<VectorSample>),
    Matrix(Vec<MatrixSeries>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Scalar(_) => ValueType::Scalar,
            Value::String { .. } => ValueType::String,
            Value::Vector(_) => ValueType::Vector,
            Value::Matrix(_) => ValueType::Matrix,
        }
    }

    /// Keep only the first `limit` series of a vector or matrix.
    ///
    /// Returns whether anything was dropped. Scalars and strings are left
    /// alone.
    pub fn truncate(&mut self, limit: usize) -> bool {
        match self {
            Value::Vector(v) if v.len() > limit => {
                v.truncate(limit);
                true
            }
            Value::Matrix(m) if m.len() > limit => {
                m.truncate(limit);
                true
            }
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Scalar(s) => s.serialize(serializer),
            Value::String { t, value } => {
                let mut tup = serializer.serialize_tuple(2)?;
                tup.serialize_element(&UnixSeconds(*t))?;
                tup.serialize_element(value)?;
                tup.end()
            }
            Value::Vector(v) => {
                let mut seq = serializer.serialize_seq(Some(v.len()))?;
                for s in v {
                    seq.serialize_element(s)?;
                }
                seq.end()
            }
            Value::Matrix(m) => {
                let mut seq = serializer.serialize_seq(Some(m.len()))?;
                for s in m {
                    seq.serialize_element(s)?;
                }
                seq.end()
            }
        }
    }
}

/// Serde helper rendering a float as its string form.
pub fn serialize_float_str<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_float(*v))
}

/// Serde helper rendering a millisecond timestamp as Unix seconds.
pub fn serialize_unix_seconds<S: Serializer>(
    t: &Timestamp,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    UnixSeconds(*t).serialize(serializer)
}

/// Shortest decimal form, with `NaN`, `+Inf` and `-Inf` spelled out.
pub fn format_float(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{}", v)
    }
}

/// Exponent form with a signed, two digit exponent (`1.5e+03`).
pub fn format_float_exp(v: f64) -> String {
    if !v.is_finite() {
        return format_float(v);
    }
    let raw = format!("{:e}", v);
    let Some((mantissa, exp)) = raw.split_once('e') else {
        return raw;
    };
    let exp: i32 = exp.parse().unwrap_or(0);
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exp.abs())
}
