// Flow Definition Models
// Serde types for the YAML flow definition and the binding syntax used by node inputs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Root flow definition as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FlowDefinition {
    /// Flow name
    #[serde(default)]
    pub name: Option<String>,

    /// Declared flow inputs
    #[serde(default)]
    pub inputs: BTreeMap<String, InputDefinition>,

    /// Declared flow outputs
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputDefinition>,

    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

/// A declared flow input
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InputDefinition {
    #[serde(rename = "type", default)]
    pub value_type: ValueType,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

/// A declared flow output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDefinition {
    /// Raw binding, e.g. `${node.output}`
    pub reference: Value,

    #[serde(default)]
    pub description: Option<String>,
}

/// A node as written in the flow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDefinition {
    pub name: String,

    /// Identifier of the tool in the registry
    pub tool: String,

    /// Parameter name to raw binding
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,

    #[serde(default)]
    pub activate: Option<ActivateDefinition>,

    /// Runs once per batch over the collected line outputs
    #[serde(default)]
    pub aggregation: bool,

    /// Overrides the tool's cacheable marker
    #[serde(default)]
    pub enable_cache: Option<bool>,

    /// Value dependents receive when this node is bypassed
    #[serde(default)]
    pub bypass_value: Option<Value>,

    /// How an aggregation node treats lines that failed
    #[serde(default)]
    pub failed_lines: FailedLinePolicy,

    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Activation condition: the node runs only when `when` resolves to `is`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateDefinition {
    pub when: Value,
    pub is: Value,
}

/// Policy for failed lines when collecting aggregation inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailedLinePolicy {
    /// Failed lines are left out of the aggregated lists
    #[default]
    Skip,
    /// Failed lines contribute a null entry
    Null,
}

/// Retry policy for a node's tool call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Declared type of a flow input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Int,
    Double,
    Bool,
    List,
    Object,
    #[default]
    Any,
}

impl ValueType {
    /// Coerce a row value into this type, parsing strings where that is unambiguous
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("expected {}, got {}", self, describe(value));
        match (self, value) {
            (ValueType::Any, v) => Ok(v.clone()),
            (ValueType::String, Value::String(_)) => Ok(value.clone()),
            (ValueType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ValueType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (ValueType::Int, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            (ValueType::Int, Value::Number(n)) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(&f) => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(mismatch()),
            },
            (ValueType::Int, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch()),
            (ValueType::Double, Value::Number(n)) => {
                n.as_f64().map(Value::from).ok_or_else(mismatch)
            }
            (ValueType::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| mismatch()),
            (ValueType::Bool, Value::Bool(_)) => Ok(value.clone()),
            (ValueType::Bool, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (ValueType::List, Value::Array(_)) => Ok(value.clone()),
            (ValueType::List, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Err(mismatch()),
            },
            (ValueType::Object, Value::Object(_)) => Ok(value.clone()),
            (ValueType::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Double => "double",
            ValueType::Bool => "bool",
            ValueType::List => "list",
            ValueType::Object => "object",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// Short human-readable name of a JSON value's type
pub fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Where a node input, activate condition or flow output takes its value from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Binding {
    Literal(Value),
    FlowInput(String),
    NodeOutput { node: String, path: Vec<String> },
}

impl Binding {
    /// Parse a raw YAML value. Only whole-string `${...}` values are references.
    pub fn parse(raw: &Value) -> Result<Self, String> {
        let text = match raw {
            Value::String(s) => s.trim(),
            other => return Ok(Binding::Literal(other.clone())),
        };

        let inner = match text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
            Some(inner) => inner.trim(),
            None => return Ok(Binding::Literal(raw.clone())),
        };

        let parts: Vec<&str> = inner.split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("malformed reference '{}'", text));
        }

        match parts.as_slice() {
            ["inputs", name] => Ok(Binding::FlowInput(name.to_string())),
            ["inputs", ..] => Err(format!(
                "flow input reference '{}' cannot have a property path",
                text
            )),
            [node, "output", path @ ..] => Ok(Binding::NodeOutput {
                node: node.to_string(),
                path: path.iter().map(|p| p.to_string()).collect(),
            }),
            _ => Err(format!(
                "unsupported reference '{}', expected '${{inputs.NAME}}' or '${{NODE.output}}'",
                text
            )),
        }
    }

    /// Name of the referenced node, if this binding reads a node output
    pub fn node_reference(&self) -> Option<&str> {
        match self {
            Binding::NodeOutput { node, .. } => Some(node),
            _ => None,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Literal(v) => write!(f, "{}", v),
            Binding::FlowInput(name) => write!(f, "${{inputs.{}}}", name),
            Binding::NodeOutput { node, path } if path.is_empty() => {
                write!(f, "${{{}.output}}", node)
            }
            Binding::NodeOutput { node, path } => {
                write!(f, "${{{}.output.{}}}", node, path.join("."))
            }
        }
    }
}

/// Follow a property path into a value (object keys or array indices)
pub fn apply_path(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}
