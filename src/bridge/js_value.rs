//! Engine-side value representation.
//!
//! [`JSValue`] is what the marshaller produces for script. Besides the plain
//! JSON kinds it can carry dates and the two proxy kinds that stand for host
//! objects: a nested object handle and a function marker.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Clone, Debug, PartialEq)]
pub enum JSValue {
    Undefined,
    Null,
    Bool(bool),
    /// Whole number that fits in i64.
    Int(i64),
    Float(f64),
    String(String),
    /// Timestamp recognized in a string payload.
    Date(DateTime<Utc>),
    Array(Vec<JSValue>),
    /// Keys keep the order they arrived in.
    Object(IndexMap<String, JSValue>),
    /// Host object reachable through a handle
    NativeObject { id: i64 },
    /// Host function exposed as a member of a host object
    NativeFunction {
        object_id: i64,
        name: String,
        asynchronous: bool,
    },
}

impl JSValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JSValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JSValue::Int(i) => Some(*i as f64),
            JSValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JSValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JSValue::Undefined)
    }
}

// Proxy kinds only make sense inside one session and refuse to serialize.
impl Serialize for JSValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error;
        match self {
            JSValue::Undefined | JSValue::Null => serializer.serialize_none(),
            JSValue::Bool(b) => serializer.serialize_bool(*b),
            JSValue::Int(i) => serializer.serialize_i64(*i),
            JSValue::Float(f) => serializer.serialize_f64(*f),
            JSValue::String(s) => serializer.serialize_str(s),
            JSValue::Date(d) => serializer.serialize_str(&d.to_rfc3339()),
            JSValue::Array(arr) => arr.serialize(serializer),
            JSValue::Object(obj) => obj.serialize(serializer),
            JSValue::NativeObject { id } => Err(Error::custom(format!(
                "Cannot serialize JSValue::NativeObject (id: {}). Host objects are referenced, not copied.",
                id
            ))),
            JSValue::NativeFunction { object_id, name, .. } => Err(Error::custom(format!(
                "Cannot serialize JSValue::NativeFunction ({}.{}). Functions must be called, not serialized.",
                object_id, name
            ))),
        }
    }
}

/// Date/time text the engine receives as a `Date`: RFC 3339, naive
/// date-times with `T` or a space before the time, and bare dates at
/// midnight. Naive forms are taken as UTC.
pub(crate) fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl JSValue {
    /// Number without a fractional part that fits i64 becomes `Int`.
    pub(crate) fn from_f64(value: f64) -> Self {
        let integral = value.is_finite()
            && value.fract() == 0.0
            && value >= i64::MIN as f64
            && value < i64::MAX as f64;
        if integral {
            JSValue::Int(value as i64)
        } else {
            JSValue::Float(value)
        }
    }

    /// String content, promoted to `Date` when it reads as one.
    pub(crate) fn from_text(text: String) -> Self {
        match parse_date(&text) {
            Some(date) => JSValue::Date(date),
            None => JSValue::String(text),
        }
    }
}

struct EngineValueVisitor;

impl<'de> Visitor<'de> for EngineValueVisitor {
    type Value = JSValue;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("a JSON document")
    }

    fn visit_unit<E>(self) -> Result<JSValue, E> {
        Ok(JSValue::Null)
    }

    fn visit_none<E>(self) -> Result<JSValue, E> {
        Ok(JSValue::Null)
    }

    fn visit_some<D>(self, deserializer: D) -> Result<JSValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        JSValue::deserialize(deserializer)
    }

    fn visit_bool<E>(self, value: bool) -> Result<JSValue, E> {
        Ok(JSValue::Bool(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<JSValue, E> {
        Ok(JSValue::Int(value))
    }

    fn visit_u64<E>(self, value: u64) -> Result<JSValue, E> {
        Ok(i64::try_from(value).map_or(JSValue::Float(value as f64), JSValue::Int))
    }

    fn visit_f64<E>(self, value: f64) -> Result<JSValue, E> {
        Ok(JSValue::from_f64(value))
    }

    fn visit_str<E>(self, value: &str) -> Result<JSValue, E> {
        Ok(JSValue::from_text(value.to_owned()))
    }

    fn visit_string<E>(self, value: String) -> Result<JSValue, E> {
        Ok(JSValue::from_text(value))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<JSValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element::<JSValue>()? {
            items.push(item);
        }
        Ok(JSValue::Array(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<JSValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = IndexMap::with_capacity(map.size_hint().unwrap_or(0).min(1024));
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value::<JSValue>()?;
            // Later duplicates win but keep the first key's position.
            entries.insert(key, value);
        }
        Ok(JSValue::Object(entries))
    }
}

// Strings that read as dates come back as `Date`, mirroring how dates are
// written out, and integral floats collapse to `Int` as in the marshaller.
impl<'de> Deserialize<'de> for JSValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(EngineValueVisitor)
    }
}
