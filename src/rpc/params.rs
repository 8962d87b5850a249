//! Parameter specs and the wire-to-native parameter converter.
//!
//! Conversion is positional. A missing or `null` wire value falls back to the
//! parameter's default, then to null if the parameter accepts it, and fails
//! otherwise. Numbers are never silently truncated: a floating-point value for
//! an integer parameter is a type error.

use std::fmt;

use serde_json::{Map, Value};

use super::error::ConversionError;

/// Semantic type of a formal parameter (or of a method's return value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    /// Any JSON value, including null. Passed through untouched.
    Any,
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float. Integers widen.
    Float,
    String,
    /// JSON object, passed through as opaque structured data.
    Map,
    /// JSON array, passed through as opaque structured data.
    List,
    /// JSON array whose elements are converted to the inner type.
    ListOf(Box<ParamType>),
}

impl ParamType {
    pub fn list_of(inner: ParamType) -> Self {
        ParamType::ListOf(Box::new(inner))
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Any => write!(f, "Object"),
            ParamType::Bool => write!(f, "Boolean"),
            ParamType::Int => write!(f, "Integer"),
            ParamType::Float => write!(f, "Double"),
            ParamType::String => write!(f, "String"),
            ParamType::Map => write!(f, "JSONObject"),
            ParamType::List => write!(f, "JSONArray"),
            ParamType::ListOf(inner) => write!(f, "List<{}>", inner),
        }
    }
}

/// Default slot of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamDefault {
    /// A wire value must be supplied (unless the type accepts null).
    Required,
    /// Optional parameter; null when not supplied.
    Null,
    /// Literal parsed by the converter for the parameter's type.
    Literal(String),
}

/// One formal parameter of a method.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub description: String,
    pub nullable: bool,
    pub default: ParamDefault,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            description: String::new(),
            nullable: false,
            default: ParamDefault::Required,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Mark the parameter optional with a null default.
    pub fn optional(mut self) -> Self {
        self.default = ParamDefault::Null;
        self
    }

    /// Declare a default literal, e.g. `"1"`, `"0x10"`, `"true"`.
    pub fn default_value(mut self, literal: impl Into<String>) -> Self {
        self.default = ParamDefault::Literal(literal.into());
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn accepts_null(&self) -> bool {
        self.nullable || self.ty == ParamType::Any
    }

    /// Parse the declared default, if any.
    pub fn resolve_default(&self) -> Result<Option<Arg>, ConversionError> {
        match &self.default {
            ParamDefault::Required => Ok(None),
            ParamDefault::Null => Ok(Some(Arg::Null)),
            ParamDefault::Literal(text) => parse_literal(&self.ty, text).map(Some),
        }
    }

    /// Help line, e.g. `Integer count[optional, default 1]: how many`.
    pub fn help(&self) -> String {
        let mut line = format!("{} {}", self.ty, self.name);
        match &self.default {
            ParamDefault::Required => {}
            ParamDefault::Null => line.push_str("[optional]"),
            ParamDefault::Literal(text) => {
                line.push_str(&format!("[optional, default {}]", text));
            }
        }
        if !self.description.is_empty() {
            line.push_str(": ");
            line.push_str(&self.description);
        }
        line
    }

    fn fill_absent(&self, position: usize, explicit_null: bool) -> Result<Arg, ConversionError> {
        if let Some(default) = self.resolve_default()? {
            return Ok(default);
        }
        if self.accepts_null() {
            return Ok(Arg::Null);
        }
        let name = self.name.clone();
        if explicit_null {
            Err(ConversionError::NullNotAllowed { position, name })
        } else {
            Err(ConversionError::MissingArgument { position, name })
        }
    }
}

/// A converted, call-ready argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Map(Map<String, Value>),
    List(Vec<Value>),
    Items(Vec<Arg>),
    Any(Value),
}

impl Arg {
    pub fn into_value(self) -> Value {
        match self {
            Arg::Null => Value::Null,
            Arg::Bool(b) => Value::Bool(b),
            Arg::Int(i) => Value::from(i),
            Arg::Float(f) => Value::from(f),
            Arg::Str(s) => Value::String(s),
            Arg::Map(m) => Value::Object(m),
            Arg::List(items) => Value::Array(items),
            Arg::Items(items) => Value::Array(items.into_iter().map(Arg::into_value).collect()),
            Arg::Any(v) => v,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Arg::Null => "null",
            Arg::Bool(_) => "boolean",
            Arg::Int(_) => "integer",
            Arg::Float(_) => "float",
            Arg::Str(_) => "string",
            Arg::Map(_) => "object",
            Arg::List(_) | Arg::Items(_) => "array",
            Arg::Any(v) => json_kind(v),
        }
    }
}

/// Accessor failure inside a method body: the registered signature and the
/// body disagree about an argument.
#[derive(Debug, thiserror::Error)]
#[error("argument {index} is {found}, expected {wanted}")]
pub struct ArgError {
    pub index: usize,
    pub wanted: &'static str,
    pub found: &'static str,
}

/// Converted arguments handed to a method body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(Vec<Arg>);

impl Args {
    pub fn new(args: Vec<Arg>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.0.get(index)
    }

    pub fn int(&self, index: usize) -> Result<i64, ArgError> {
        match self.arg(index) {
            Arg::Int(i) => Ok(*i),
            other => Err(self.mismatch(index, "integer", other)),
        }
    }

    pub fn opt_int(&self, index: usize) -> Result<Option<i64>, ArgError> {
        match self.arg(index) {
            Arg::Null => Ok(None),
            _ => self.int(index).map(Some),
        }
    }

    pub fn float(&self, index: usize) -> Result<f64, ArgError> {
        match self.arg(index) {
            Arg::Float(f) => Ok(*f),
            other => Err(self.mismatch(index, "float", other)),
        }
    }

    pub fn bool(&self, index: usize) -> Result<bool, ArgError> {
        match self.arg(index) {
            Arg::Bool(b) => Ok(*b),
            other => Err(self.mismatch(index, "boolean", other)),
        }
    }

    pub fn str(&self, index: usize) -> Result<&str, ArgError> {
        match self.arg(index) {
            Arg::Str(s) => Ok(s),
            other => Err(self.mismatch(index, "string", other)),
        }
    }

    pub fn opt_str(&self, index: usize) -> Result<Option<&str>, ArgError> {
        match self.arg(index) {
            Arg::Null => Ok(None),
            _ => self.str(index).map(Some),
        }
    }

    pub fn items(&self, index: usize) -> Result<&[Arg], ArgError> {
        match self.arg(index) {
            Arg::Items(items) => Ok(items),
            other => Err(self.mismatch(index, "typed list", other)),
        }
    }

    /// The argument rendered back to JSON.
    pub fn value(&self, index: usize) -> Value {
        self.arg(index).clone().into_value()
    }

    fn arg(&self, index: usize) -> &Arg {
        self.0.get(index).unwrap_or(&Arg::Null)
    }

    fn mismatch(&self, index: usize, wanted: &'static str, found: &Arg) -> ArgError {
        ArgError {
            index,
            wanted,
            found: found.kind(),
        }
    }
}

/// Convert positional wire values according to `specs`.
pub fn convert(specs: &[ParamSpec], values: Vec<Value>) -> Result<Args, ConversionError> {
    if values.len() > specs.len() {
        return Err(ConversionError::TooManyParameters {
            expected: specs.len(),
            received: values.len(),
        });
    }

    let mut supplied = values.into_iter();
    let mut args = Vec::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        let position = index + 1;
        let arg = match supplied.next() {
            Some(Value::Null) => spec.fill_absent(position, true)?,
            Some(value) => convert_value(&spec.ty, value, position, &spec.name)?,
            None => spec.fill_absent(position, false)?,
        };
        args.push(arg);
    }

    Ok(Args(args))
}

fn convert_value(
    ty: &ParamType,
    value: Value,
    position: usize,
    name: &str,
) -> Result<Arg, ConversionError> {
    match (ty, value) {
        (ParamType::Any, value) => Ok(Arg::Any(value)),
        (ParamType::Bool, Value::Bool(b)) => Ok(Arg::Bool(b)),
        (ParamType::Int, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(Arg::Int(i))
            } else if n.is_u64() {
                Err(ConversionError::OutOfRange {
                    position,
                    name: name.to_string(),
                    expected: ParamType::Int,
                })
            } else {
                Err(ConversionError::TypeMismatch {
                    position,
                    name: name.to_string(),
                    expected: ParamType::Int,
                    received: "float",
                })
            }
        }
        (ParamType::Float, Value::Number(n)) => {
            n.as_f64()
                .map(Arg::Float)
                .ok_or_else(|| ConversionError::OutOfRange {
                    position,
                    name: name.to_string(),
                    expected: ParamType::Float,
                })
        }
        (ParamType::String, Value::String(s)) => Ok(Arg::Str(s)),
        (ParamType::Map, Value::Object(m)) => Ok(Arg::Map(m)),
        (ParamType::List, Value::Array(items)) => Ok(Arg::List(items)),
        (ParamType::ListOf(inner), Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let element = format!("{}[{}]", name, i);
                match item {
                    Value::Null if **inner == ParamType::Any => Ok(Arg::Any(Value::Null)),
                    Value::Null => Err(ConversionError::NullNotAllowed {
                        position,
                        name: element,
                    }),
                    item => convert_value(inner, item, position, &element),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Arg::Items),
        (expected, other) => Err(ConversionError::TypeMismatch {
            position,
            name: name.to_string(),
            expected: expected.clone(),
            received: json_kind(&other),
        }),
    }
}

/// Parse a default literal for the given type.
pub fn parse_literal(ty: &ParamType, text: &str) -> Result<Arg, ConversionError> {
    let bad = || ConversionError::BadLiteral {
        literal: text.to_string(),
        expected: ty.clone(),
    };

    match ty {
        ParamType::String => Ok(Arg::Str(text.to_string())),
        ParamType::Int => decode_int(text).map(Arg::Int).ok_or_else(bad),
        ParamType::Float => text.trim().parse::<f64>().map(Arg::Float).map_err(|_| bad()),
        ParamType::Bool => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Arg::Bool(true)),
            "false" => Ok(Arg::Bool(false)),
            _ => Err(bad()),
        },
        ParamType::Any => Ok(Arg::Any(
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())),
        )),
        ParamType::Map | ParamType::List | ParamType::ListOf(_) => {
            let value: Value = serde_json::from_str(text).map_err(|_| bad())?;
            convert_value(ty, value, 0, "default").map_err(|_| bad())
        }
    }
}

/// Decode an integer literal: decimal, `0x`/`#` hexadecimal, or leading-zero
/// octal, with an optional sign.
fn decode_int(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let (radix, digits) = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
        .or_else(|| body.strip_prefix('#'))
    {
        (16, hex)
    } else if body.len() > 1 && body.starts_with('0') {
        (8, &body[1..])
    } else {
        (10, body)
    };

    if digits.is_empty() || digits.starts_with(['-', '+']) {
        return None;
    }

    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i64::try_from(value).ok()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
