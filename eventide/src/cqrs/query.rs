//! Attribute filters for projection queries and their wire format.
//!
//! A [`Filter`] compares one document property against a value and may carry
//! nested filters combined with `and`/`or`. Client-facing query layers pass
//! filters around as compact strings:
//!
//! ```text
//! property|operator|value|visible|tag|nestedFilters
//! ```
//!
//! Text fields go through a fixed escape table (`.&!$'` become `;dot;`,
//! `;amp;`, `;excl;`, `;dollar;`, `;aps;`) and are then percent-encoded.
//! Each nested filter is written as `and+` or `or+` followed by the encoded
//! wire form of the child, and nested filters are joined with `.`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Everything except the RFC 3986 unreserved characters.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const ESCAPES: [(char, &str); 5] = [
    ('.', ";dot;"),
    ('&', ";amp;"),
    ('!', ";excl;"),
    ('$', ";dollar;"),
    ('\'', ";aps;"),
];

/// Errors produced while reading or writing the filter wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// The string does not have the six pipe-separated sections.
    #[error("Malformed filter '{0}': expected property|operator|value|visible|tag|nested")]
    Malformed(String),

    /// The operator is not one of the supported comparisons.
    #[error("Unknown filter operator '{0}'")]
    UnknownOperator(String),

    /// A nested filter is not prefixed with `and+` or `or+`.
    #[error("Unknown nested filter logic '{0}'")]
    UnknownLogic(String),

    /// The visibility flag is neither `T` nor `F`.
    #[error("Invalid visibility flag '{0}'")]
    InvalidVisibility(String),

    /// A percent-encoded section does not decode to UTF-8.
    #[error("Invalid percent-encoding in '{0}'")]
    InvalidEncoding(String),

    /// The text contains a sequence that collides with the escape table and
    /// would not survive a round trip.
    #[error("'{0}' contains a reserved escape sequence")]
    ReservedToken(String),
}

/// Comparison applied by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Substring (strings) or membership (arrays)
    Contains,
    /// String prefix
    StartsWith,
}

impl FilterOperator {
    /// The operator as written on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Contains => "contains",
            Self::StartsWith => "startswith",
        }
    }

    const fn accepts(self, ordering: Ordering) -> bool {
        match self {
            Self::Eq => matches!(ordering, Ordering::Equal),
            Self::Ne => !matches!(ordering, Ordering::Equal),
            Self::Gt => matches!(ordering, Ordering::Greater),
            Self::Ge => !matches!(ordering, Ordering::Less),
            Self::Lt => matches!(ordering, Ordering::Less),
            Self::Le => !matches!(ordering, Ordering::Greater),
            Self::Contains | Self::StartsWith => false,
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOperator {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "gt" => Ok(Self::Gt),
            "ge" => Ok(Self::Ge),
            "lt" => Ok(Self::Lt),
            "le" => Ok(Self::Le),
            "contains" => Ok(Self::Contains),
            "startswith" => Ok(Self::StartsWith),
            _ => Err(FilterError::UnknownOperator(s.to_string())),
        }
    }
}

/// How a nested filter combines with the result so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLogic {
    /// Both must match
    And,
    /// Either may match
    Or,
}

impl FilterLogic {
    /// The logic as written on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl FromStr for FilterLogic {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => Err(FilterError::UnknownLogic(s.to_string())),
        }
    }
}

/// A filter operand, carried as its wire text.
///
/// Typed constructors produce the canonical text; comparison against a
/// document field interprets the text according to the field's JSON type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterValue(String);

impl FilterValue {
    /// The raw text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The value as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    /// The value as a float, if it parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        self.0.parse().ok()
    }

    /// The value as a boolean (`true`/`false`).
    pub fn as_bool(&self) -> Option<bool> {
        self.0.parse().ok()
    }
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        Self(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        Self(v.to_string())
    }
}

impl From<i32> for FilterValue {
    fn from(v: i32) -> Self {
        Self(v.to_string())
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl From<u64> for FilterValue {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        Self(v.to_string())
    }
}

/// A nested filter and the logic joining it to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NestedFilter {
    /// `and` / `or`
    pub logic: FilterLogic,
    /// The nested filter
    pub filter: Filter,
}

/// An attribute filter over projection documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Document property; dots address nested objects (`customer.name`).
    pub property: String,
    /// Comparison operator.
    pub operator: FilterOperator,
    /// Operand.
    pub value: FilterValue,
    /// Whether client UIs show the filter. Not used for matching.
    pub visible: bool,
    /// Free-form label. Not used for matching; empty when unset.
    pub tag: String,
    /// Nested filters, folded left to right.
    pub nested: Vec<NestedFilter>,
}

impl Filter {
    /// A visible, untagged filter.
    pub fn new(
        property: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<FilterValue>,
    ) -> Self {
        Self {
            property: property.into(),
            operator,
            value: value.into(),
            visible: true,
            tag: String::new(),
            nested: Vec::new(),
        }
    }

    /// Shorthand for an equality filter.
    pub fn eq(property: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::new(property, FilterOperator::Eq, value)
    }

    /// Sets visibility.
    #[must_use]
    pub const fn with_visible(mut self, visible: bool) -> Self {
        self.visible = visible;
        self
    }

    /// Sets the tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Appends a nested filter combined with `and`.
    #[must_use]
    pub fn and(mut self, filter: Self) -> Self {
        self.nested.push(NestedFilter {
            logic: FilterLogic::And,
            filter,
        });
        self
    }

    /// Appends a nested filter combined with `or`.
    #[must_use]
    pub fn or(mut self, filter: Self) -> Self {
        self.nested.push(NestedFilter {
            logic: FilterLogic::Or,
            filter,
        });
        self
    }

    /// Every property this filter and its nested filters reference.
    pub fn properties(&self) -> Vec<&str> {
        let mut properties = vec![self.property.as_str()];
        for nested in &self.nested {
            properties.extend(nested.filter.properties());
        }
        properties
    }

    /// Evaluates the filter against a document body.
    ///
    /// The filter's own comparison is the starting result; each nested
    /// filter is then combined with it in order.
    pub fn matches(&self, document: &JsonValue) -> bool {
        let own = lookup(document, &self.property)
            .map_or(self.operator == FilterOperator::Ne, |field| {
                compare(field, self.operator, &self.value)
            });
        self.nested
            .iter()
            .fold(own, |result, nested| match nested.logic {
                FilterLogic::And => result && nested.filter.matches(document),
                FilterLogic::Or => result || nested.filter.matches(document),
            })
    }

    /// Writes the wire form.
    pub fn to_wire(&self) -> Result<String, FilterError> {
        let mut wire = format!(
            "{}|{}|{}|{}|{}|",
            encode(&self.property)?,
            self.operator.as_str(),
            encode(self.value.as_str())?,
            if self.visible { "T" } else { "F" },
            encode(&self.tag)?,
        );
        let nested = self
            .nested
            .iter()
            .map(|nested| {
                Ok(format!(
                    "{}+{}",
                    nested.logic.as_str(),
                    encode(&nested.filter.to_wire()?)?
                ))
            })
            .collect::<Result<Vec<_>, FilterError>>()?;
        wire.push_str(&nested.join("."));
        Ok(wire)
    }

    /// Reads the wire form.
    pub fn from_wire(wire: &str) -> Result<Self, FilterError> {
        let sections: Vec<&str> = wire.splitn(6, '|').collect();
        let &[property, operator, value, visible, tag, nested] = sections.as_slice() else {
            return Err(FilterError::Malformed(wire.to_string()));
        };
        let visible = match visible {
            "T" => true,
            "F" => false,
            other => return Err(FilterError::InvalidVisibility(other.to_string())),
        };
        let nested = if nested.is_empty() {
            Vec::new()
        } else {
            nested
                .split('.')
                .map(|item| {
                    let (logic, child) = item
                        .split_once('+')
                        .ok_or_else(|| FilterError::Malformed(item.to_string()))?;
                    Ok(NestedFilter {
                        logic: logic.parse()?,
                        filter: Self::from_wire(&decode(child)?)?,
                    })
                })
                .collect::<Result<Vec<_>, FilterError>>()?
        };
        Ok(Self {
            property: decode(property)?,
            operator: operator.parse()?,
            value: FilterValue(decode(value)?),
            visible,
            tag: decode(tag)?,
            nested,
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.property, self.operator, self.value)
    }
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match ESCAPES.iter().find(|(raw, _)| *raw == c) {
            Some((_, token)) => escaped.push_str(token),
            None => escaped.push(c),
        }
    }
    escaped
}

fn unescape(text: &str) -> String {
    let mut unescaped = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(at) = rest.find(';') {
        unescaped.push_str(&rest[..at]);
        let tail = &rest[at..];
        match ESCAPES.iter().find(|(_, token)| tail.starts_with(token)) {
            Some((raw, token)) => {
                unescaped.push(*raw);
                rest = &tail[token.len()..];
            }
            None => {
                unescaped.push(';');
                rest = &tail[1..];
            }
        }
    }
    unescaped.push_str(rest);
    unescaped
}

fn encode(text: &str) -> Result<String, FilterError> {
    let escaped = escape(text);
    if unescape(&escaped) != text {
        return Err(FilterError::ReservedToken(text.to_string()));
    }
    Ok(utf8_percent_encode(&escaped, COMPONENT).to_string())
}

fn decode(text: &str) -> Result<String, FilterError> {
    let decoded = percent_decode_str(text)
        .decode_utf8()
        .map_err(|_| FilterError::InvalidEncoding(text.to_string()))?;
    Ok(unescape(&decoded))
}

fn lookup<'a>(document: &'a JsonValue, property: &str) -> Option<&'a JsonValue> {
    property
        .split('.')
        .try_fold(document, |value, segment| value.get(segment))
}

fn compare(field: &JsonValue, operator: FilterOperator, value: &FilterValue) -> bool {
    match field {
        JsonValue::Null => match operator {
            FilterOperator::Eq => value.as_str() == "null",
            FilterOperator::Ne => value.as_str() != "null",
            _ => false,
        },
        JsonValue::Bool(b) => match (operator, value.as_bool()) {
            (FilterOperator::Eq, Some(v)) => *b == v,
            (FilterOperator::Ne, Some(v)) => *b != v,
            (FilterOperator::Ne, None) => true,
            _ => false,
        },
        JsonValue::Number(n) => match (n.as_f64(), value.as_f64()) {
            (Some(field), Some(operand)) => field
                .partial_cmp(&operand)
                .is_some_and(|ordering| operator.accepts(ordering)),
            _ => operator == FilterOperator::Ne,
        },
        JsonValue::String(s) => match operator {
            FilterOperator::Contains => s.contains(value.as_str()),
            FilterOperator::StartsWith => s.starts_with(value.as_str()),
            _ => operator.accepts(s.as_str().cmp(value.as_str())),
        },
        JsonValue::Array(items) => match operator {
            FilterOperator::Contains => items.iter().any(|item| scalar_text(item) == value.as_str()),
            _ => false,
        },
        JsonValue::Object(_) => false,
    }
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
