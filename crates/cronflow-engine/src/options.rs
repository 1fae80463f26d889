//! Job option resolution and final command-line construction.

use std::collections::HashSet;

use serde_json::{Map, Value};

use cronflow_types::{Job, JobOption, OptionKind};

use crate::error::{EngineError, Result};

/// System option that opts a job into notifications.
pub const NOTIFY_OPTION: &str = "notify";

/// Resolved value of one option.
#[derive(Debug, Clone, PartialEq)]
enum OptionValue {
    Flag(bool),
    Text(Option<String>),
    List(Vec<String>),
}

impl OptionValue {
    fn to_json(&self) -> Value {
        match self {
            OptionValue::Flag(b) => Value::Bool(*b),
            OptionValue::Text(Some(s)) => Value::String(s.clone()),
            OptionValue::Text(None) => Value::Null,
            OptionValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }
}

/// The command to run plus the option values that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub command: String,
    /// Effective values of every declared option, system ones included.
    pub options: Map<String, Value>,
    /// Values of system-handled options only.
    pub system: Map<String, Value>,
}

impl CommandPlan {
    /// Notification opt-in declared through the `notify` system option.
    pub fn notify(&self) -> Option<bool> {
        self.system.get(NOTIFY_OPTION).and_then(Value::as_bool)
    }
}

/// Check option declarations when a job is created or updated.
pub fn validate_options(options: &[JobOption]) -> Result<()> {
    let mut seen = HashSet::new();
    for option in options {
        let invalid = |reason: &str| EngineError::InvalidOption {
            option: option.name.clone(),
            reason: reason.to_string(),
        };

        if option.name.trim().is_empty() {
            return Err(invalid("option name must not be empty"));
        }
        if !seen.insert(option.name.as_str()) {
            return Err(invalid("duplicate option name"));
        }
        if let Some(flag) = &option.flag {
            if flag.trim().is_empty() || flag.chars().any(char::is_whitespace) {
                return Err(invalid("flag must be a single non-empty word"));
            }
        }

        match &option.kind {
            OptionKind::Boolean { .. } if option.flag.is_none() && !option.system => {
                return Err(invalid("boolean options need a flag"));
            }
            OptionKind::Select { choices, default } => {
                if choices.is_empty() {
                    return Err(invalid("select options need at least one choice"));
                }
                if let Some(default) = default {
                    if !choices.contains(default) {
                        return Err(invalid("default is not one of the choices"));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Apply overrides to the job's declared options and render the command.
///
/// Overrides not naming a declared option are rejected.
pub fn build_command(job: &Job, overrides: &Map<String, Value>) -> Result<CommandPlan> {
    if let Some(unknown) = overrides
        .keys()
        .find(|key| !job.options.iter().any(|o| &o.name == *key))
    {
        return Err(EngineError::InvalidOption {
            option: unknown.clone(),
            reason: format!("job '{}' declares no such option", job.id),
        });
    }

    let mut command = job.command.trim().to_string();
    let mut options = Map::new();
    let mut system = Map::new();

    for option in &job.options {
        let value = resolve(option, overrides.get(&option.name))?;
        options.insert(option.name.clone(), value.to_json());

        if option.system {
            system.insert(option.name.clone(), value.to_json());
            continue;
        }

        if let Some(fragment) = render(option, &value) {
            command.push(' ');
            command.push_str(&fragment);
        }
    }

    Ok(CommandPlan {
        command,
        options,
        system,
    })
}

fn resolve(option: &JobOption, raw: Option<&Value>) -> Result<OptionValue> {
    let invalid = |reason: String| EngineError::InvalidOption {
        option: option.name.clone(),
        reason,
    };
    let raw = raw.filter(|v| !v.is_null());

    match &option.kind {
        OptionKind::Boolean { default } => match raw {
            None => Ok(OptionValue::Flag(*default)),
            Some(Value::Bool(b)) => Ok(OptionValue::Flag(*b)),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(OptionValue::Flag(true)),
                "false" | "0" | "no" | "off" | "" => Ok(OptionValue::Flag(false)),
                other => Err(invalid(format!("expected a boolean, got '{other}'"))),
            },
            Some(other) => Err(invalid(format!("expected a boolean, got {other}"))),
        },
        OptionKind::Text { default } => match raw {
            None => Ok(OptionValue::Text(default.clone())),
            Some(value) => Ok(OptionValue::Text(Some(scalar_to_string(value).ok_or_else(
                || invalid(format!("expected a string, got {value}")),
            )?))),
        },
        OptionKind::Select { choices, default } => match raw {
            None => Ok(OptionValue::Text(default.clone())),
            Some(value) => {
                let choice = scalar_to_string(value)
                    .ok_or_else(|| invalid(format!("expected a string, got {value}")))?;
                if choice.is_empty() {
                    return Ok(OptionValue::Text(None));
                }
                if !choices.contains(&choice) {
                    return Err(invalid(format!(
                        "'{choice}' is not one of [{}]",
                        choices.join(", ")
                    )));
                }
                Ok(OptionValue::Text(Some(choice)))
            }
        },
        OptionKind::Array { default } => match raw {
            None => Ok(OptionValue::List(default.clone())),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    scalar_to_string(item)
                        .ok_or_else(|| invalid(format!("expected string items, got {item}")))
                })
                .collect::<Result<Vec<_>>>()
                .map(OptionValue::List),
            Some(Value::String(s)) => Ok(OptionValue::List(
                s.split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(String::from)
                    .collect(),
            )),
            Some(other) => Err(invalid(format!("expected a list, got {other}"))),
        },
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render(option: &JobOption, value: &OptionValue) -> Option<String> {
    let with_flag = |arg: String| match &option.flag {
        Some(flag) => format!("{flag} {arg}"),
        None => arg,
    };

    match value {
        OptionValue::Flag(true) => option.flag.clone(),
        OptionValue::Flag(false) => None,
        OptionValue::Text(Some(text)) if !text.is_empty() => Some(with_flag(shell_quote(text))),
        OptionValue::Text(_) => None,
        OptionValue::List(items) if !items.is_empty() => {
            Some(with_flag(shell_quote(&items.join(","))))
        }
        OptionValue::List(_) => None,
    }
}

/// Quote a value for `sh -c`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
