// Tool Signatures
// Parameter schema used to check node bindings at graph-load time

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Semantic type of a tool parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Int,
    Double,
    Bool,
    List,
    Object,
    Any,
    /// Bound to the name of a connection resolved through the connection provider
    Connection,
    Union(Vec<ParamType>),
}

impl ParamType {
    /// Whether a literal value is acceptable for this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ParamType::String | ParamType::Connection => value.is_string(),
            ParamType::Int => value.is_i64() || value.is_u64(),
            ParamType::Double => value.is_number(),
            ParamType::Bool => value.is_boolean(),
            ParamType::List => value.is_array(),
            ParamType::Object => value.is_object(),
            ParamType::Any => true,
            ParamType::Union(members) => members.iter().any(|m| m.accepts(value)),
        }
    }

    pub fn is_connection(&self) -> bool {
        match self {
            ParamType::Connection => true,
            ParamType::Union(members) => members.iter().any(ParamType::is_connection),
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::String => f.write_str("string"),
            ParamType::Int => f.write_str("int"),
            ParamType::Double => f.write_str("double"),
            ParamType::Bool => f.write_str("bool"),
            ParamType::List => f.write_str("list"),
            ParamType::Object => f.write_str("object"),
            ParamType::Any => f.write_str("any"),
            ParamType::Connection => f.write_str("connection"),
            ParamType::Union(members) => {
                let names: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                write!(f, "{}", names.join(" | "))
            }
        }
    }
}

/// A declared tool parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub ty: ParamType,
    /// Parameters with a default are optional
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Name, parameters and cacheable marker of a tool
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSignature {
    pub name: String,
    pub params: BTreeMap<String, ParamSpec>,
    pub cacheable: bool,
}

impl ToolSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
            cacheable: false,
        }
    }

    /// Add a required parameter
    pub fn param(mut self, name: impl Into<String>, ty: ParamType) -> Self {
        self.params
            .insert(name.into(), ParamSpec { ty, default: None });
        self
    }

    /// Add an optional parameter with a default value
    pub fn optional(mut self, name: impl Into<String>, ty: ParamType, default: Value) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                ty,
                default: Some(default),
            },
        );
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn required_params(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|(_, spec)| spec.is_required())
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_union_accepts_any_member() {
        let ty = ParamType::Union(vec![ParamType::Int, ParamType::String]);
        assert!(ty.accepts(&json!(3)));
        assert!(ty.accepts(&json!("three")));
        assert!(!ty.accepts(&json!([3])));
        assert_eq!(ty.to_string(), "int | string");
    }

    #[test]
    fn test_double_accepts_integers() {
        assert!(ParamType::Double.accepts(&json!(2)));
        assert!(!ParamType::Int.accepts(&json!(2.5)));
    }

    #[test]
    fn test_signature_builder() {
        let sig = ToolSignature::new("llm")
            .param("prompt", ParamType::String)
            .param("connection", ParamType::Connection)
            .optional("temperature", ParamType::Double, json!(0.7))
            .cacheable();

        assert!(sig.cacheable);
        let required: Vec<&str> = sig.required_params().collect();
        assert_eq!(required, vec!["connection", "prompt"]);
        assert!(sig.get("connection").unwrap().ty.is_connection());
        assert_eq!(sig.get("temperature").unwrap().default, Some(json!(0.7)));
    }
}
