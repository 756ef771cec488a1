// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative parameter/action manifest.
//!
//! The manifest is a YAML document describing every named parameter (read
//! and/or write command, value type, validator, safety limits) and every
//! named action (side-effect command with typed argument fields) the bridge
//! may touch. Loading is two phases: serde deserialization into the typed
//! structs below, then a validation walk that names the offending path in
//! every schema error (`parameters.bias_v.safety.max_step`).
//!
//! The manifest is pure data: no I/O beyond the document text handed in.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::value::{ScalarType, ScalarValue};

/// Top-level manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub defaults: ManifestDefaults,
    #[serde(default)]
    pub parameters: IndexMap<String, ParameterSpec>,
    #[serde(default)]
    pub actions: IndexMap<String, ActionSpec>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDefaults {
    #[serde(default = "default_true")]
    pub snapshot_value: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_default_interval_s: Option<f64>,
}

impl Default for ManifestDefaults {
    fn default() -> Self {
        Self { snapshot_value: true, ramp_default_interval_s: None }
    }
}

fn default_true() -> bool {
    true
}

/// One named readable and/or writable scalar exposed by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Filled from the mapping key during load; empty in raw documents.
    #[serde(default, skip_serializing)]
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default = "default_value_type", alias = "type")]
    pub value_type: ScalarType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_cmd: Option<ReadCommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_cmd: Option<WriteCommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vals: Option<ValidatorSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_value: Option<bool>,
}

fn default_value_type() -> ScalarType {
    ScalarType::Float
}

impl ParameterSpec {
    pub fn readable(&self) -> bool {
        self.get_cmd.is_some()
    }

    pub fn writable(&self) -> bool {
        self.set_cmd.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadCommandSpec {
    pub command: String,
    /// Index into the response payload where this parameter's value lives.
    #[serde(default)]
    pub payload_index: i64,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, ScalarValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_fields: Vec<ResponseFieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommandSpec {
    pub command: String,
    /// Name of the argument that carries the value being written.
    pub value_arg: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, ScalarValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arg_fields: Vec<ArgFieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFieldSpec {
    pub index: i64,
    pub name: String,
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgFieldSpec {
    pub name: String,
    pub r#type: ScalarType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidatorKind {
    Numbers,
    Ints,
    Bool,
    Enum,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub kind: ValidatorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ScalarValue>,
}

impl ValidatorSpec {
    /// Check a candidate value against this validator.
    ///
    /// `numbers`/`ints` are inclusive ranges; `bool` forbids non-bool
    /// values; `enum` checks the choices list; `none` accepts anything of
    /// the declared value type.
    pub fn check(&self, parameter: &str, value: &ScalarValue) -> Result<()> {
        match self.kind {
            ValidatorKind::Numbers => {
                let v = value.as_f64()?;
                self.check_range(parameter, v)
            }
            ValidatorKind::Ints => {
                if !matches!(value, ScalarValue::Int(_) | ScalarValue::Bool(_)) {
                    return Err(BridgeError::invalid_argument(format!(
                        "parameter '{parameter}' requires an integer, got {value}"
                    )));
                }
                self.check_range(parameter, value.as_f64()?)
            }
            ValidatorKind::Bool => match value {
                ScalarValue::Bool(_) => Ok(()),
                other => Err(BridgeError::invalid_argument(format!(
                    "parameter '{parameter}' requires a bool, got {other}"
                ))),
            },
            ValidatorKind::Enum => {
                if self.choices.contains(value) {
                    Ok(())
                } else {
                    let allowed = self
                        .choices
                        .iter()
                        .map(ScalarValue::render)
                        .collect::<Vec<_>>()
                        .join(", ");
                    Err(BridgeError::invalid_argument(format!(
                        "parameter '{parameter}' value {value} is not one of: {allowed}"
                    )))
                }
            }
            ValidatorKind::None => Ok(()),
        }
    }

    fn check_range(&self, parameter: &str, v: f64) -> Result<()> {
        if let Some(min) = self.min {
            if v < min {
                return Err(BridgeError::invalid_argument(format!(
                    "parameter '{parameter}' value {v} is below minimum {min}"
                )));
            }
        }
        if let Some(max) = self.max {
            if v > max {
                return Err(BridgeError::invalid_argument(format!(
                    "parameter '{parameter}' value {v} is above maximum {max}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_slew_per_s: Option<f64>,
    #[serde(default)]
    pub cooldown_s: f64,
    #[serde(default = "default_true")]
    pub ramp_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ramp_interval_s: Option<f64>,
    /// Rejected at load time. The confirmation gate was removed; write
    /// enablement is a single allow/deny flag at the instrument boundary.
    #[serde(default, skip_serializing, rename = "require_confirmation")]
    pub legacy_require_confirmation: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSafetyMode {
    #[serde(rename = "alwaysAllowed", alias = "readonly")]
    AlwaysAllowed,
    #[serde(rename = "guarded")]
    Guarded,
    #[serde(rename = "blocked")]
    Blocked,
}

impl ActionSafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlwaysAllowed => "alwaysAllowed",
            Self::Guarded => "guarded",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSafetySpec {
    pub mode: ActionSafetyMode,
}

/// One named side-effect command. No read/value semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default, skip_serializing)]
    pub name: String,
    pub action_cmd: ActionCommandSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<ActionSafetySpec>,
}

impl ActionSpec {
    pub fn safety_mode(&self) -> ActionSafetyMode {
        self.safety.as_ref().map_or(ActionSafetyMode::Guarded, |s| s.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommandSpec {
    pub command: String,
    /// Fixed argument values, in wire order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, ScalarValue>,
    /// Declared wire type per argument; missing entries are inferred from
    /// the fixed value.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub arg_types: IndexMap<String, ScalarType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arg_fields: Vec<ArgFieldSpec>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ActionCommandSpec {
    /// Declared wire type of an argument, falling back to the fixed value's
    /// natural kind, then float.
    pub fn arg_type(&self, arg: &str) -> ScalarType {
        if let Some(kind) = self.arg_types.get(arg) {
            return *kind;
        }
        if let Some(field) = self.arg_fields.iter().find(|f| f.name == arg) {
            return field.r#type;
        }
        self.args.get(arg).map_or(ScalarType::Float, ScalarValue::scalar_type)
    }

    /// All declared argument names, fixed args first, in document order.
    pub fn declared_args(&self) -> Vec<String> {
        let mut names: Vec<String> = self.args.keys().cloned().collect();
        for key in self.arg_types.keys() {
            if !names.iter().any(|n| n == key) {
                names.push(key.clone());
            }
        }
        for field in &self.arg_fields {
            if !names.iter().any(|n| n == &field.name) {
                names.push(field.name.clone());
            }
        }
        names
    }
}

/// Parse and validate a manifest document.
///
/// Parameters and actions are sorted by name so downstream ordering is
/// deterministic regardless of document order.
pub fn load_manifest(text: &str) -> Result<Manifest> {
    let mut manifest: Manifest = serde_yaml::from_str(text)
        .map_err(|e| BridgeError::schema("root", e.to_string()))?;

    manifest.parameters.sort_keys();
    manifest.actions.sort_keys();

    let ramp_default = manifest.defaults.ramp_default_interval_s;
    if let Some(interval) = ramp_default {
        if interval <= 0.0 {
            return Err(BridgeError::schema(
                "defaults.ramp_default_interval_s",
                "must be positive",
            ));
        }
    }

    let snapshot_default = manifest.defaults.snapshot_value;
    for (name, spec) in manifest.parameters.iter_mut() {
        spec.name.clone_from(name);
        if spec.label.trim().is_empty() {
            spec.label.clone_from(name);
        }
        if spec.snapshot_value.is_none() {
            spec.snapshot_value = Some(snapshot_default);
        }
        validate_parameter(name, spec, ramp_default)?;
    }

    for (name, spec) in manifest.actions.iter_mut() {
        spec.name.clone_from(name);
        validate_action(name, spec)?;
    }

    Ok(manifest)
}

/// Serialize back to YAML. `load_manifest(to_yaml(m))` yields an equal
/// manifest.
pub fn to_yaml(manifest: &Manifest) -> Result<String> {
    serde_yaml::to_string(manifest).map_err(|e| BridgeError::schema("root", e.to_string()))
}

fn validate_parameter(
    name: &str,
    spec: &ParameterSpec,
    ramp_default: Option<f64>,
) -> Result<()> {
    let path = format!("parameters.{name}");

    if spec.get_cmd.is_none() && spec.set_cmd.is_none() {
        return Err(BridgeError::schema(
            &path,
            "must define at least one of get_cmd or set_cmd",
        ));
    }

    if let Some(get_cmd) = &spec.get_cmd {
        if get_cmd.command.trim().is_empty() {
            return Err(BridgeError::schema(format!("{path}.get_cmd.command"), "is required"));
        }
        if get_cmd.payload_index < 0 {
            return Err(BridgeError::schema(
                format!("{path}.get_cmd.payload_index"),
                "must be non-negative",
            ));
        }
    }

    if let Some(set_cmd) = &spec.set_cmd {
        if set_cmd.command.trim().is_empty() {
            return Err(BridgeError::schema(format!("{path}.set_cmd.command"), "is required"));
        }
        if set_cmd.value_arg.trim().is_empty() {
            return Err(BridgeError::schema(format!("{path}.set_cmd.value_arg"), "is required"));
        }
    }

    if let Some(vals) = &spec.vals {
        if let (Some(min), Some(max)) = (vals.min, vals.max) {
            if max < min {
                return Err(BridgeError::schema(format!("{path}.vals"), "max must be >= min"));
            }
        }
        if vals.kind == ValidatorKind::Enum && vals.choices.is_empty() {
            return Err(BridgeError::schema(
                format!("{path}.vals.choices"),
                "enum validator requires a non-empty choices list",
            ));
        }
    }

    if spec.writable() && spec.safety.is_none() {
        return Err(BridgeError::schema(
            format!("{path}.safety"),
            "writable parameter must include safety settings",
        ));
    }

    if let Some(safety) = &spec.safety {
        validate_safety(&format!("{path}.safety"), spec, safety, ramp_default)?;
    }

    Ok(())
}

fn validate_safety(
    path: &str,
    spec: &ParameterSpec,
    safety: &SafetySpec,
    ramp_default: Option<f64>,
) -> Result<()> {
    if safety.legacy_require_confirmation.is_some() {
        return Err(BridgeError::schema(
            format!("{path}.require_confirmation"),
            "is no longer supported; use the policy-level allow/deny and dry-run flags",
        ));
    }

    let min = safety.min.or_else(|| spec.vals.as_ref().and_then(|v| v.min));
    let max = safety.max.or_else(|| spec.vals.as_ref().and_then(|v| v.max));
    if let (Some(min), Some(max)) = (min, max) {
        if max <= min {
            return Err(BridgeError::schema(format!("{path}.max"), "must be > min"));
        }
    }

    if spec.writable() {
        if min.is_none() || max.is_none() {
            return Err(BridgeError::schema(
                path,
                "writable parameter requires min and max bounds",
            ));
        }
        match safety.max_step {
            None => {
                return Err(BridgeError::schema(
                    format!("{path}.max_step"),
                    "is required for writable parameters",
                ));
            }
            Some(step) if step <= 0.0 => {
                return Err(BridgeError::schema(format!("{path}.max_step"), "must be positive"));
            }
            Some(_) => {}
        }
    } else if let Some(step) = safety.max_step {
        if step <= 0.0 {
            return Err(BridgeError::schema(format!("{path}.max_step"), "must be positive"));
        }
    }

    if let Some(slew) = safety.max_slew_per_s {
        if slew <= 0.0 {
            return Err(BridgeError::schema(
                format!("{path}.max_slew_per_s"),
                "must be positive when provided",
            ));
        }
    }

    if safety.cooldown_s < 0.0 {
        return Err(BridgeError::schema(
            format!("{path}.cooldown_s"),
            "must be non-negative",
        ));
    }

    if let Some(interval) = safety.ramp_interval_s.or(ramp_default) {
        if interval <= 0.0 {
            return Err(BridgeError::schema(
                format!("{path}.ramp_interval_s"),
                "must be positive when provided",
            ));
        }
    }

    Ok(())
}

fn validate_action(name: &str, spec: &ActionSpec) -> Result<()> {
    let path = format!("actions.{name}");
    if spec.action_cmd.command.trim().is_empty() {
        return Err(BridgeError::schema(
            format!("{path}.action_cmd.command"),
            "is required",
        ));
    }
    for (index, field) in spec.action_cmd.arg_fields.iter().enumerate() {
        if field.name.trim().is_empty() {
            return Err(BridgeError::schema(
                format!("{path}.action_cmd.arg_fields[{index}].name"),
                "is required",
            ));
        }
    }
    Ok(())
}

impl Manifest {
    pub fn parameter(&self, name: &str) -> Result<&ParameterSpec> {
        self.parameters.get(name).ok_or_else(|| {
            BridgeError::UnknownParameter(format!(
                "parameter '{name}' is not declared in the manifest"
            ))
        })
    }

    pub fn action(&self, name: &str) -> Result<&ActionSpec> {
        self.actions.get(name).ok_or_else(|| {
            BridgeError::CommandUnavailable(format!(
                "action '{name}' is not declared in the manifest"
            ))
        })
    }

    /// Resolve a display label back to the parameter that carries it.
    ///
    /// Labels are what monitor configurations reference; they must be
    /// unique among readable parameters.
    pub fn parameter_by_label(&self, label: &str) -> Result<&ParameterSpec> {
        let mut found: Option<&ParameterSpec> = None;
        for spec in self.parameters.values() {
            if spec.label == label && spec.readable() {
                if found.is_some() {
                    return Err(BridgeError::schema(
                        format!("parameters.{}", spec.name),
                        format!("label '{label}' is used by more than one readable parameter"),
                    ));
                }
                found = Some(spec);
            }
        }
        found.ok_or_else(|| {
            BridgeError::UnknownParameter(format!(
                "no readable parameter with label '{label}'"
            ))
        })
    }

    /// Effective ramp interval for a parameter, falling back to the
    /// manifest default.
    pub fn ramp_interval_s(&self, spec: &ParameterSpec) -> Option<f64> {
        spec.safety
            .as_ref()
            .and_then(|s| s.ramp_interval_s)
            .or(self.defaults.ramp_default_interval_s)
    }
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
