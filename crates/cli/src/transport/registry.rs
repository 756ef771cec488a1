// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command registry: the declared wire surface derived from the manifest.
//!
//! Every read, write and action command contributes one entry describing
//! its argument names, wire types and declared order. The registry drives
//! argument normalization (exact name match first, then a case- and
//! non-alphanumeric-insensitive fallback) and wire serialization order, and
//! is the source of `available_commands()`.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::{BridgeError, Result};
use crate::manifest::Manifest;
use crate::value::{ScalarType, ScalarValue};

/// One declared command argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgSpec {
    pub name: String,
    pub wire_type: ScalarType,
    pub required: bool,
    /// Fixed value from the manifest, used when the caller omits the key.
    pub default: Option<ScalarValue>,
}

/// One declared wire command with its ordered argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub args: Vec<ArgSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: IndexMap<String, CommandSpec>,
    /// normalized name -> exact name, first declaration wins.
    normalized: HashMap<String, String>,
}

/// Case- and non-alphanumeric-insensitive key used for fallback matching.
pub fn normalize_key(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_alphanumeric()).map(|c| c.to_ascii_lowercase()).collect()
}

impl CommandRegistry {
    /// Build the registry from a manifest's read, write and action
    /// commands. A command declared by several specs keeps the union of
    /// its argument declarations (first declaration of each arg wins).
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let mut registry = Self::default();

        for spec in manifest.parameters.values() {
            if let Some(get_cmd) = &spec.get_cmd {
                let args = fixed_args_only(&get_cmd.args);
                registry.declare(&get_cmd.command, args);
            }
            if let Some(set_cmd) = &spec.set_cmd {
                let mut args = vec![ArgSpec {
                    name: set_cmd.value_arg.clone(),
                    wire_type: spec.value_type,
                    required: true,
                    default: None,
                }];
                args.extend(fixed_args_only(&set_cmd.args));
                for field in &set_cmd.arg_fields {
                    args.push(ArgSpec {
                        name: field.name.clone(),
                        wire_type: field.r#type,
                        required: field.required,
                        default: None,
                    });
                }
                registry.declare(&set_cmd.command, args);
            }
        }

        for spec in manifest.actions.values() {
            let cmd = &spec.action_cmd;
            let mut args = Vec::new();
            for name in cmd.declared_args() {
                args.push(ArgSpec {
                    wire_type: cmd.arg_type(&name),
                    required: cmd
                        .arg_fields
                        .iter()
                        .any(|f| f.name == name && f.required),
                    default: cmd.args.get(&name).cloned(),
                    name,
                });
            }
            registry.declare(&cmd.command, args);
        }

        registry
    }

    fn declare(&mut self, command: &str, args: Vec<ArgSpec>) {
        match self.commands.get_mut(command) {
            Some(existing) => {
                for arg in args {
                    if !existing.args.iter().any(|a| a.name == arg.name) {
                        existing.args.push(arg);
                    }
                }
            }
            None => {
                self.normalized
                    .entry(normalize_key(command))
                    .or_insert_with(|| command.to_owned());
                self.commands
                    .insert(command.to_owned(), CommandSpec { name: command.to_owned(), args });
            }
        }
    }

    /// Sorted unique command names.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a command by exact name, falling back to the normalized
    /// index.
    pub fn resolve(&self, command: &str) -> Result<&CommandSpec> {
        if let Some(spec) = self.commands.get(command) {
            return Ok(spec);
        }
        if let Some(exact) = self.normalized.get(&normalize_key(command)) {
            if let Some(spec) = self.commands.get(exact) {
                return Ok(spec);
            }
        }
        Err(BridgeError::CommandUnavailable(format!(
            "command '{command}' is not declared in the manifest"
        )))
    }

    /// Normalize a caller argument map against the command declaration.
    ///
    /// Returns `(name, value)` pairs in declared wire order with every
    /// value coerced to its declared wire type (`bool` coerces to int on
    /// the wire, which the codec handles). Unknown keys, missing required
    /// keys and failed coercions are [`BridgeError::InvalidArgument`].
    pub fn normalize_args(
        &self,
        command: &str,
        args: &IndexMap<String, ScalarValue>,
    ) -> Result<Vec<(String, ScalarValue)>> {
        let spec = self.resolve(command)?;

        if spec.args.is_empty() {
            if args.is_empty() {
                return Ok(Vec::new());
            }
            let unexpected = args.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(BridgeError::invalid_argument(format!(
                "command '{}' does not take arguments; unexpected: {unexpected}",
                spec.name
            )));
        }

        // Match caller keys to declared args: exact first, normalized second.
        let mut provided: HashMap<&str, &ScalarValue> = HashMap::new();
        for (key, value) in args {
            let declared = spec
                .args
                .iter()
                .find(|a| a.name == *key)
                .or_else(|| {
                    let wanted = normalize_key(key);
                    spec.args.iter().find(|a| normalize_key(&a.name) == wanted)
                });
            let Some(declared) = declared else {
                let allowed =
                    spec.args.iter().map(|a| a.name.as_str()).collect::<Vec<_>>().join(", ");
                return Err(BridgeError::invalid_argument(format!(
                    "unexpected argument '{key}' for command '{}'; allowed: {allowed}",
                    spec.name
                )));
            };
            provided.insert(declared.name.as_str(), value);
        }

        let mut normalized = Vec::with_capacity(spec.args.len());
        for declared in &spec.args {
            let raw = provided
                .get(declared.name.as_str())
                .copied()
                .cloned()
                .or_else(|| declared.default.clone());
            let Some(raw) = raw else {
                if declared.required {
                    return Err(BridgeError::invalid_argument(format!(
                        "missing required argument '{}' for command '{}'",
                        declared.name, spec.name
                    )));
                }
                continue;
            };
            let coerced = raw.coerce(declared.wire_type).map_err(|e| {
                BridgeError::invalid_argument(format!(
                    "argument '{}' for command '{}': {e}",
                    declared.name, spec.name
                ))
            })?;
            normalized.push((declared.name.clone(), coerced));
        }

        Ok(normalized)
    }
}

fn fixed_args_only(args: &IndexMap<String, ScalarValue>) -> Vec<ArgSpec> {
    args.iter()
        .map(|(name, value)| ArgSpec {
            name: name.clone(),
            wire_type: value.scalar_type(),
            required: false,
            default: Some(value.clone()),
        })
        .collect()
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
