use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;

use crate::core::{ArcStr, Hash32};
use crate::error::ParameterError;

/// The declared type of a task parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Str,
    /// A calendar date, canonicalized to ISO `YYYY-MM-DD`.
    Date,
    /// An ordered sequence of values of one element kind.
    List(Box<ParamKind>),
}

impl ParamKind {
    /// Shorthand for `ParamKind::List(Box::new(element))`.
    pub fn list(element: ParamKind) -> Self {
        ParamKind::List(Box::new(element))
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Bool => write!(f, "bool"),
            ParamKind::Int => write!(f, "int"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::Str => write!(f, "str"),
            ParamKind::Date => write!(f, "date"),
            ParamKind::List(element) => write!(f, "[{element}]"),
        }
    }
}

/// A concrete parameter value.
///
/// Values are plain data; equality of two assignments is judged over their
/// canonical encodings, never over how the values were constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
    List(Vec<ParamValue>),
}

impl ParamValue {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Str(_) => "str",
            ParamValue::Date(_) => "date",
            ParamValue::List(_) => "list",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value as i64)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl<T> From<Vec<T>> for ParamValue
where
    T: Into<ParamValue>,
{
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// A single parameter declaration on a task kind.
#[derive(Debug, Clone)]
pub(crate) struct ParamSpec {
    pub(crate) name: ArcStr,
    pub(crate) kind: ParamKind,
    pub(crate) default: Option<ParamValue>,
}

/// A validated, immutable record of parameter values.
///
/// Constructed by the registry from a task kind's parameter specs; run
/// contracts read values back out through the typed getters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: BTreeMap<ArcStr, ParamValue>,
}

impl Params {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(name, value)| (name.as_ref(), value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn bool(&self, name: &str) -> Result<bool, ParameterError> {
        self.typed(name, ParamKind::Bool, ParamValue::as_bool)
    }

    pub fn int(&self, name: &str) -> Result<i64, ParameterError> {
        self.typed(name, ParamKind::Int, ParamValue::as_int)
    }

    pub fn float(&self, name: &str) -> Result<f64, ParameterError> {
        self.typed(name, ParamKind::Float, ParamValue::as_float)
    }

    pub fn str(&self, name: &str) -> Result<&str, ParameterError> {
        self.typed(name, ParamKind::Str, ParamValue::as_str)
    }

    pub fn date(&self, name: &str) -> Result<NaiveDate, ParameterError> {
        self.typed(name, ParamKind::Date, ParamValue::as_date)
    }

    /// Works for any element kind; the declared element type was enforced
    /// at validation time.
    pub fn list(&self, name: &str) -> Result<&[ParamValue], ParameterError> {
        match self.values.get(name) {
            Some(value) => value.as_list().ok_or_else(|| ParameterError::Type {
                param: name.to_string(),
                expected: "list".to_string(),
                found: value.label().to_string(),
            }),
            None => Err(ParameterError::Missing(name.to_string())),
        }
    }

    /// Convenience for `List(Str)` parameters such as symbol universes.
    pub fn strings(&self, name: &str) -> Result<Vec<String>, ParameterError> {
        let items = self.list(name)?;
        items
            .iter()
            .map(|item| match item.as_str() {
                Some(text) => Ok(text.to_string()),
                None => Err(ParameterError::Type {
                    param: name.to_string(),
                    expected: ParamKind::list(ParamKind::Str).to_string(),
                    found: item.label().to_string(),
                }),
            })
            .collect()
    }

    fn typed<'a, T, F>(&'a self, name: &str, expected: ParamKind, get: F) -> Result<T, ParameterError>
    where
        F: Fn(&'a ParamValue) -> Option<T>,
    {
        match self.values.get(name) {
            Some(value) => get(value).ok_or_else(|| ParameterError::Type {
                param: name.to_string(),
                expected: expected.to_string(),
                found: value.label().to_string(),
            }),
            None => Err(ParameterError::Missing(name.to_string())),
        }
    }

    /// Canonical signature of this record; see [`Signature`].
    pub(crate) fn signature(&self) -> Signature {
        let mut text = String::new();
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                text.push(',');
            }
            text.push_str(name);
            text.push('=');
            canon(&mut text, value);
        }
        Signature(text.into())
    }
}

/// Canonical literal encoding of one value.
///
/// Strings are always quoted with `"` and `\` escaped so that the encoding
/// stays unambiguous inside the `name=value` and `[..]` framing.
fn canon(buffer: &mut String, value: &ParamValue) {
    match value {
        ParamValue::Bool(value) => buffer.push_str(if *value { "true" } else { "false" }),
        ParamValue::Int(value) => buffer.push_str(&value.to_string()),
        ParamValue::Float(value) => buffer.push_str(&value.to_string()),
        ParamValue::Str(value) => {
            buffer.push('"');
            for c in value.chars() {
                if c == '"' || c == '\\' {
                    buffer.push('\\');
                }
                buffer.push(c);
            }
            buffer.push('"');
        }
        ParamValue::Date(value) => buffer.push_str(&value.to_string()),
        ParamValue::List(items) => {
            buffer.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buffer.push(',');
                }
                canon(buffer, item);
            }
            buffer.push(']');
        }
    }
}

/// The canonical, order-independent encoding of a parameter assignment.
///
/// Parameter names are sorted, values are rendered through a type-specific
/// canonical literal, and the resulting text is the cache key: two
/// value-equal assignments always produce the same signature, however they
/// were constructed. The file-backed store addresses directories by the
/// BLAKE3 hash of this text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(ArcStr);

impl Signature {
    /// The full canonical text, e.g. `date_end=2020-01-01,lookback=1`.
    pub fn text(&self) -> &str {
        &self.0
    }

    pub(crate) fn digest(&self) -> Hash32 {
        Hash32::hash(self.0.as_bytes())
    }

    /// First 12 hex digits of the signature hash, for compact display.
    pub fn short(&self) -> String {
        let mut hex = self.digest().to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validates a raw assignment against a spec list, applying defaults and
/// coercions, and returns the resulting record.
pub(crate) fn validate(
    specs: &[ParamSpec],
    given: impl IntoIterator<Item = (ArcStr, ParamValue)>,
) -> Result<Params, ParameterError> {
    let mut pending: BTreeMap<ArcStr, ParamValue> = BTreeMap::new();

    for (name, value) in given {
        if !specs.iter().any(|spec| spec.name == name) {
            return Err(ParameterError::Unknown(name.to_string()));
        }
        if pending.insert(name.clone(), value).is_some() {
            return Err(ParameterError::Duplicate(name.to_string()));
        }
    }

    let mut values = BTreeMap::new();
    for spec in specs {
        let raw = match pending.remove(&spec.name) {
            Some(value) => value,
            None => match &spec.default {
                Some(value) => value.clone(),
                None => return Err(ParameterError::Missing(spec.name.to_string())),
            },
        };
        values.insert(spec.name.clone(), coerce(&spec.kind, raw, &spec.name)?);
    }

    Ok(Params { values })
}

/// Checks a value against a declared kind.
///
/// The only accepted widening is int to float; everything else must match
/// exactly. Non-finite floats are rejected because they have no canonical
/// literal.
pub(crate) fn coerce(
    kind: &ParamKind,
    value: ParamValue,
    param: &str,
) -> Result<ParamValue, ParameterError> {
    match (kind, value) {
        (ParamKind::Bool, value @ ParamValue::Bool(_)) => Ok(value),
        (ParamKind::Int, value @ ParamValue::Int(_)) => Ok(value),
        (ParamKind::Float, ParamValue::Int(value)) => Ok(ParamValue::Float(value as f64)),
        (ParamKind::Float, ParamValue::Float(value)) => {
            if value.is_finite() {
                Ok(ParamValue::Float(value))
            } else {
                Err(ParameterError::NonFinite(param.to_string()))
            }
        }
        (ParamKind::Str, value @ ParamValue::Str(_)) => Ok(value),
        (ParamKind::Date, value @ ParamValue::Date(_)) => Ok(value),
        (ParamKind::List(element), ParamValue::List(items)) => {
            let items = items
                .into_iter()
                .map(|item| coerce(element, item, param))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ParamValue::List(items))
        }
        (expected, found) => Err(ParameterError::Type {
            param: param.to_string(),
            expected: expected.to_string(),
            found: found.label().to_string(),
        }),
    }
}
