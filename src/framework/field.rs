//! Per-path field schemas and coercion of loosely-typed request data.

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{Arc, OnceLock},
};

use http::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use serde_json::{Map, Value};
use strum::{Display, EnumString};

use crate::error::Error;

use super::duration::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum FieldType {
    String,
    LowercaseString,
    NameString,
    Int,
    Bool,
    Map,
    KvPairs,
    DurationSeconds,
    Slice,
    StringSlice,
    CommaStringSlice,
    CommaIntSlice,
    Header,
}

impl FieldType {
    /// The value a field of this type takes when neither input nor default is present.
    pub fn zero(&self) -> FieldValue {
        match self {
            Self::String | Self::LowercaseString | Self::NameString => {
                FieldValue::String(String::new())
            }
            Self::Int => FieldValue::Int(0),
            Self::Bool => FieldValue::Bool(false),
            Self::Map => FieldValue::Map(Map::new()),
            Self::KvPairs => FieldValue::KvPairs(BTreeMap::new()),
            Self::DurationSeconds => FieldValue::Duration(0),
            Self::Slice => FieldValue::Slice(Vec::new()),
            Self::StringSlice | Self::CommaStringSlice => FieldValue::Strings(Vec::new()),
            Self::CommaIntSlice => FieldValue::Ints(Vec::new()),
            Self::Header => FieldValue::Header(HeaderMap::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    pub ty: FieldType,
    pub default: Option<Value>,
    pub description: String,
}

impl FieldSchema {
    pub fn new(ty: FieldType, description: impl Into<String>) -> Self {
        Self {
            ty,
            default: None,
            description: description.into(),
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    fn default_value(&self) -> Result<FieldValue, String> {
        match &self.default {
            Some(default) => coerce(self.ty, default),
            None => Ok(self.ty.zero()),
        }
    }
}

/// Field schemas of a path, keyed by field name. Ordered so help output is alphabetized.
pub type FieldMap = BTreeMap<String, FieldSchema>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Bool(bool),
    Map(Map<String, Value>),
    KvPairs(BTreeMap<String, String>),
    /// Whole seconds.
    Duration(i64),
    Slice(Vec<Value>),
    Strings(Vec<String>),
    Ints(Vec<i64>),
    Header(HeaderMap),
}

impl FieldValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Map(_) => "map",
            Self::KvPairs(_) => "kv-pairs",
            Self::Duration(_) => "duration",
            Self::Slice(_) => "slice",
            Self::Strings(_) => "string slice",
            Self::Ints(_) => "int slice",
            Self::Header(_) => "header",
        }
    }
}

pub(crate) fn name_regex() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();

    NAME.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"^[A-Za-z0-9_](([A-Za-z0-9_.-]+)?[A-Za-z0-9_])?$").unwrap()
    })
}

fn coerce_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(format!("expected a string, got {other}")),
    }
}

fn coerce_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => Ok(i),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
            _ => Err(format!("{n} is not an integer")),
        },
        Value::String(s) => i64::from_str(s.trim()).map_err(|e| format!("{s:?}: {e}")),
        other => Err(format!("expected an integer, got {other}")),
    }
}

fn coerce_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{n} is not a boolean")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(format!("{s:?} is not a boolean")),
        },
        other => Err(format!("expected a boolean, got {other}")),
    }
}

fn coerce_duration(value: &Value) -> Result<i64, String> {
    let seconds = match value {
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i,
            (None, Some(f)) if f.is_finite() && f.abs() < i64::MAX as f64 => f as i64,
            _ => return Err(format!("{n} is not a valid duration")),
        },
        Value::String(s) => parse_duration(s).map_err(|e| e.to_string())?,
        other => return Err(format!("expected a duration, got {other}")),
    };

    if seconds < 0 {
        return Err(format!("{seconds} is negative"));
    }

    Ok(seconds)
}

fn string_list(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::Array(items) => items.iter().map(coerce_string).collect(),
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![coerce_string(other)?]),
    }
}

fn comma_list(value: &Value) -> Result<Vec<String>, String> {
    let items = match value {
        Value::String(s) => s.split(',').map(str::to_owned).collect(),
        other => string_list(other)?,
    };

    Ok(items
        .into_iter()
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect())
}

fn coerce_kv_pairs(value: &Value) -> Result<BTreeMap<String, String>, String> {
    if let Value::Object(map) = value {
        return map
            .iter()
            .map(|(k, v)| Ok((k.clone(), coerce_string(v)?)))
            .collect();
    }

    string_list(value)?
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_owned(), v.trim().to_owned())),
            _ => Err(format!("invalid key value pair {pair:?}")),
        })
        .collect()
}

fn coerce_header(value: &Value) -> Result<HeaderMap, String> {
    let Value::Object(map) = value else {
        return Err(format!("expected a header map, got {value}"));
    };

    let mut headers = HeaderMap::new();
    for (name, values) in map {
        let name = HeaderName::from_str(name).map_err(|e| format!("{name:?}: {e}"))?;
        for v in string_list(values)? {
            let v = HeaderValue::from_str(&v).map_err(|e| format!("{v:?}: {e}"))?;
            headers.append(name.clone(), v);
        }
    }

    Ok(headers)
}

/// Converts a raw input value to the representation declared by `ty`.
pub fn coerce(ty: FieldType, value: &Value) -> Result<FieldValue, String> {
    Ok(match ty {
        FieldType::String => FieldValue::String(coerce_string(value)?),
        FieldType::LowercaseString => FieldValue::String(coerce_string(value)?.to_lowercase()),
        FieldType::NameString => {
            let s = coerce_string(value)?;
            if !name_regex().is_match(&s) {
                return Err(format!("{s:?} is not a valid name"));
            }
            FieldValue::String(s)
        }
        FieldType::Int => FieldValue::Int(coerce_int(value)?),
        FieldType::Bool => FieldValue::Bool(coerce_bool(value)?),
        FieldType::Map => match value {
            Value::Object(map) => FieldValue::Map(map.clone()),
            Value::String(s) => match serde_json::from_str(s) {
                Ok(Value::Object(map)) => FieldValue::Map(map),
                _ => return Err(format!("{s:?} is not a JSON object")),
            },
            other => return Err(format!("expected a map, got {other}")),
        },
        FieldType::KvPairs => FieldValue::KvPairs(coerce_kv_pairs(value)?),
        FieldType::DurationSeconds => FieldValue::Duration(coerce_duration(value)?),
        FieldType::Slice => match value {
            Value::Array(items) => FieldValue::Slice(items.clone()),
            other => FieldValue::Slice(vec![other.clone()]),
        },
        FieldType::StringSlice => FieldValue::Strings(string_list(value)?),
        FieldType::CommaStringSlice => FieldValue::Strings(comma_list(value)?),
        FieldType::CommaIntSlice => {
            let ints = match value {
                Value::Number(_) => vec![coerce_int(value)?],
                Value::Array(items) => items.iter().map(coerce_int).collect::<Result<_, _>>()?,
                other => comma_list(other)?
                    .iter()
                    .map(|s| i64::from_str(s).map_err(|e| format!("{s:?}: {e}")))
                    .collect::<Result<_, _>>()?,
            };
            FieldValue::Ints(ints)
        }
        FieldType::Header => FieldValue::Header(coerce_header(value)?),
    })
}

/// Raw request data paired with the schema of the path it was routed to.
#[derive(Debug, Clone)]
pub struct FieldData {
    raw: Map<String, Value>,
    schema: Arc<FieldMap>,
}

impl FieldData {
    pub fn new(raw: Map<String, Value>, schema: Arc<FieldMap>) -> Self {
        Self { raw, schema }
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn schema(&self) -> &FieldMap {
        &self.schema
    }

    fn field(&self, key: &str) -> Result<&FieldSchema, Error> {
        self.schema
            .get(key)
            .ok_or_else(|| Error::internal(eyre::eyre!("field {key:?} not in the path schema")))
    }

    fn conversion_error(key: &str, e: String) -> Error {
        Error::validation(format!("error converting input for field {key:?}: {e}"))
    }

    /// Checks that every supplied field known to the schema converts.
    pub fn validate(&self) -> Result<(), Error> {
        for (key, value) in &self.raw {
            if let Some(field) = self.schema.get(key) {
                coerce(field.ty, value).map_err(|e| Self::conversion_error(key, e))?;
            }
        }
        Ok(())
    }

    /// The supplied value, or `None` when the request did not set the field.
    pub fn get_ok_err(&self, key: &str) -> Result<Option<FieldValue>, Error> {
        let field = self.field(key)?;
        match self.raw.get(key) {
            Some(value) => coerce(field.ty, value)
                .map(Some)
                .map_err(|e| Self::conversion_error(key, e)),
            None => Ok(None),
        }
    }

    pub fn get_ok(&self, key: &str) -> Option<FieldValue> {
        self.get_ok_err(key).ok().flatten()
    }

    /// The supplied value, else the field default, else the type's zero value.
    pub fn get(&self, key: &str) -> Result<FieldValue, Error> {
        match self.get_ok_err(key)? {
            Some(value) => Ok(value),
            None => self
                .field(key)?
                .default_value()
                .map_err(|e| Self::conversion_error(key, e)),
        }
    }

    fn mismatch(key: &str, value: &FieldValue, wanted: &str) -> Error {
        Error::internal(eyre::eyre!(
            "field {key:?} holds a {}, not a {wanted}",
            value.kind()
        ))
    }

    pub fn get_string(&self, key: &str) -> Result<String, Error> {
        match self.get(key)? {
            FieldValue::String(s) => Ok(s),
            other => Err(Self::mismatch(key, &other, "string")),
        }
    }

    pub fn get_opt_string(&self, key: &str) -> Result<Option<String>, Error> {
        match self.get_ok_err(key)? {
            None => Ok(None),
            Some(FieldValue::String(s)) => Ok(Some(s)),
            Some(other) => Err(Self::mismatch(key, &other, "string")),
        }
    }

    pub fn get_int(&self, key: &str) -> Result<i64, Error> {
        match self.get(key)? {
            FieldValue::Int(i) => Ok(i),
            other => Err(Self::mismatch(key, &other, "int")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, Error> {
        match self.get(key)? {
            FieldValue::Bool(b) => Ok(b),
            other => Err(Self::mismatch(key, &other, "bool")),
        }
    }

    pub fn get_duration(&self, key: &str) -> Result<i64, Error> {
        match self.get(key)? {
            FieldValue::Duration(d) => Ok(d),
            other => Err(Self::mismatch(key, &other, "duration")),
        }
    }

    pub fn get_opt_duration(&self, key: &str) -> Result<Option<i64>, Error> {
        match self.get_ok_err(key)? {
            None => Ok(None),
            Some(FieldValue::Duration(d)) => Ok(Some(d)),
            Some(other) => Err(Self::mismatch(key, &other, "duration")),
        }
    }

    pub fn get_strings(&self, key: &str) -> Result<Vec<String>, Error> {
        match self.get(key)? {
            FieldValue::Strings(v) => Ok(v),
            other => Err(Self::mismatch(key, &other, "string slice")),
        }
    }

    pub fn get_opt_strings(&self, key: &str) -> Result<Option<Vec<String>>, Error> {
        match self.get_ok_err(key)? {
            None => Ok(None),
            Some(FieldValue::Strings(v)) => Ok(Some(v)),
            Some(other) => Err(Self::mismatch(key, &other, "string slice")),
        }
    }

    pub fn get_kv_pairs(&self, key: &str) -> Result<BTreeMap<String, String>, Error> {
        match self.get(key)? {
            FieldValue::KvPairs(v) => Ok(v),
            other => Err(Self::mismatch(key, &other, "kv-pairs")),
        }
    }

    pub fn get_opt_kv_pairs(&self, key: &str) -> Result<Option<BTreeMap<String, String>>, Error> {
        match self.get_ok_err(key)? {
            None => Ok(None),
            Some(FieldValue::KvPairs(v)) => Ok(Some(v)),
            Some(other) => Err(Self::mismatch(key, &other, "kv-pairs")),
        }
    }
}

/// Convenience for building a [`FieldMap`] from `(name, schema)` pairs.
pub fn fields<I, K>(entries: I) -> Arc<FieldMap>
where
    I: IntoIterator<Item = (K, FieldSchema)>,
    K: Into<String>,
{
    Arc::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
}

/// Keys of `raw` that `schema` does not declare.
pub(crate) fn unknown_fields(raw: &Map<String, Value>, schema: &FieldMap) -> Vec<String> {
    let mut unknown = raw
        .keys()
        .filter(|k| !schema.contains_key(*k))
        .cloned()
        .collect::<Vec<_>>();
    unknown.sort();
    unknown
}
