// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scalar value model shared by the manifest, transport and instrument.
//!
//! The controller speaks four scalar kinds (`float`, `int`, `bool`, `str`).
//! Manifest documents declare them, the wire codec serializes them (bool
//! travels as int), and the instrument coerces payload elements back into
//! them. Response payloads may additionally contain lists, which get their
//! own [`WireValue`] variant.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Declared scalar kind of a parameter value or command argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Float,
    Int,
    Bool,
    Str,
}

impl ScalarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Str => "str",
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed scalar as it appears in manifest documents and argument maps.
///
/// Untagged, so YAML/JSON scalars deserialize into the natural variant.
/// Variant order matters: bool before int before float, otherwise `true`
/// would parse as a string and `3` as a float.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ScalarValue {
    /// The natural scalar kind of this value.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Self::Bool(_) => ScalarType::Bool,
            Self::Int(_) => ScalarType::Int,
            Self::Float(_) => ScalarType::Float,
            Self::Str(_) => ScalarType::Str,
        }
    }

    /// Coerce into the declared scalar kind.
    ///
    /// Mirrors the controller's own tolerance: numbers convert freely,
    /// bools become 0/1, and strings are parsed. A value that cannot be
    /// represented in the target kind is an [`BridgeError::InvalidArgument`].
    pub fn coerce(&self, target: ScalarType) -> Result<ScalarValue> {
        match target {
            ScalarType::Float => self.as_f64().map(ScalarValue::Float),
            ScalarType::Int => self.as_i64().map(ScalarValue::Int),
            ScalarType::Bool => self.as_bool().map(ScalarValue::Bool),
            ScalarType::Str => Ok(ScalarValue::Str(self.render())),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Self::Float(v) => Ok(*v),
            Self::Int(v) => Ok(*v as f64),
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Str(text) => text.trim().parse::<f64>().map_err(|_| {
                BridgeError::invalid_argument(format!("cannot coerce '{text}' to float"))
            }),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Float(v) => {
                if v.is_finite() {
                    Ok(v.trunc() as i64)
                } else {
                    Err(BridgeError::invalid_argument(format!(
                        "cannot coerce non-finite float {v} to int"
                    )))
                }
            }
            Self::Bool(v) => Ok(i64::from(*v)),
            Self::Str(text) => text.trim().parse::<i64>().map_err(|_| {
                BridgeError::invalid_argument(format!("cannot coerce '{text}' to int"))
            }),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            Self::Int(v) => Ok(*v != 0),
            Self::Float(v) => Ok(*v != 0.0),
            Self::Str(text) => match text.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(BridgeError::invalid_argument(format!(
                    "cannot coerce '{text}' to bool"
                ))),
            },
        }
    }

    /// Render as the string the controller would echo back.
    pub fn render(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(text) => text.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Str(text) => serde_json::Value::String(text.clone()),
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A value as decoded from a controller response payload.
///
/// Payload elements are scalars (bool arrives as int) or nested lists,
/// e.g. the names list returned by `Signals_NamesGet`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireValue {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<WireValue>),
}

impl WireValue {
    /// Coerce a payload element into the declared parameter kind.
    pub fn coerce_scalar(&self, target: ScalarType) -> Result<ScalarValue> {
        match self {
            Self::Int(v) => ScalarValue::Int(*v).coerce(target),
            Self::Float(v) => ScalarValue::Float(*v).coerce(target),
            Self::Str(text) => ScalarValue::Str(text.clone()).coerce(target),
            Self::List(_) => Err(BridgeError::protocol(
                "cannot coerce a list payload element to a scalar",
            )),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Self::Int(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            Self::Str(_) | Self::List(_) => Err(BridgeError::protocol(format!(
                "payload element {self:?} is not numeric"
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Str(text) => serde_json::Value::String(text.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(WireValue::to_json).collect())
            }
        }
    }
}

#[cfg(test)]
#[path = "value_tests.rs"]
mod tests;
