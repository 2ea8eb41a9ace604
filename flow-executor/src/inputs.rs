// Input Mapping
// Maps batch rows onto flow inputs and coerces values to their declared types

use crate::error::{ExecutorError, ExecutorResult};
use crate::parser::models::{apply_path, InputDefinition};

use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One row of batch input, keyed by column name
pub type Row = BTreeMap<String, Value>;

/// Build the flow inputs of one row.
///
/// Each declared input takes its mapping entry, or `${data.<input name>}` when it has
/// none. A string of the form `${data.COLUMN[.path]}` reads the row; anything else is a
/// literal. A column missing from the row is left out when the input has a default.
pub fn apply_inputs_mapping(
    declared: &BTreeMap<String, InputDefinition>,
    mapping: &BTreeMap<String, Value>,
    row: &Row,
    line_number: usize,
) -> ExecutorResult<BTreeMap<String, Value>> {
    for key in mapping.keys() {
        if !declared.contains_key(key) {
            warn!(input = %key, "inputs mapping names an undeclared flow input, ignoring");
        }
    }

    let mut inputs = BTreeMap::new();
    for (name, definition) in declared {
        let source = match mapping.get(name) {
            Some(source) => source.clone(),
            None => Value::String(format!("${{data.{}}}", name)),
        };

        match column_reference(&source)? {
            Some(path) => match lookup(row, &path) {
                Some(value) => {
                    inputs.insert(name.clone(), value);
                }
                None if definition.default.is_some() => {
                    debug!(input = %name, line = line_number, "column missing, using the input default");
                }
                None => {
                    return Err(ExecutorError::InputMapping {
                        message: format!(
                            "line {}: flow input '{}' is mapped to column '{}', which the row does not have; available columns: {}",
                            line_number,
                            name,
                            path.join("."),
                            row.keys().cloned().collect::<Vec<_>>().join(", ")
                        ),
                    })
                }
            },
            None => {
                inputs.insert(name.clone(), source);
            }
        }
    }
    Ok(inputs)
}

/// Column path of a `${data.COLUMN}` reference, `None` for literals
fn column_reference(source: &Value) -> ExecutorResult<Option<Vec<String>>> {
    let Some(text) = source.as_str() else {
        return Ok(None);
    };
    let Some(inner) = text
        .trim()
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(None);
    };

    let mut parts = inner.split('.').map(str::trim);
    match parts.next() {
        Some("data") => {
            let path: Vec<String> = parts.map(str::to_string).collect();
            if path.is_empty() || path.iter().any(String::is_empty) {
                return Err(ExecutorError::InputMapping {
                    message: format!("'{}' does not name a column", text),
                });
            }
            Ok(Some(path))
        }
        _ => Err(ExecutorError::InputMapping {
            message: format!("unsupported reference '{}', expected ${{data.COLUMN}}", text),
        }),
    }
}

fn lookup(row: &Row, path: &[String]) -> Option<Value> {
    let (column, rest) = path.split_first()?;
    apply_path(row.get(column)?, rest)
}

/// Fill defaults and coerce each declared input; undeclared values are dropped
pub fn coerce_inputs(
    declared: &BTreeMap<String, InputDefinition>,
    values: &BTreeMap<String, Value>,
) -> ExecutorResult<BTreeMap<String, Value>> {
    let mut coerced = BTreeMap::new();
    for (name, definition) in declared {
        let value = match (values.get(name), &definition.default) {
            (Some(value), _) => definition
                .value_type
                .coerce(value)
                .map_err(|message| ExecutorError::InputType {
                    input: name.clone(),
                    message,
                })?,
            (None, Some(default)) => default.clone(),
            (None, None) => {
                return Err(ExecutorError::InputType {
                    input: name.clone(),
                    message: "no value provided and the input has no default".to_string(),
                })
            }
        };
        coerced.insert(name.clone(), value);
    }

    for name in values.keys().filter(|name| !declared.contains_key(*name)) {
        debug!(input = %name, "dropping undeclared flow input");
    }
    Ok(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::ValueType;
    use serde_json::json;

    fn declared() -> BTreeMap<String, InputDefinition> {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "question".to_string(),
            InputDefinition {
                value_type: ValueType::String,
                ..Default::default()
            },
        );
        inputs.insert(
            "count".to_string(),
            InputDefinition {
                value_type: ValueType::Int,
                default: Some(json!(1)),
                description: None,
            },
        );
        inputs
    }

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_default_mapping_reads_same_named_columns() {
        let inputs = apply_inputs_mapping(
            &declared(),
            &BTreeMap::new(),
            &row(json!({"question": "why?", "count": "3", "extra": 1})),
            0,
        )
        .unwrap();

        assert_eq!(inputs["question"], json!("why?"));
        assert_eq!(inputs["count"], json!("3"));
        assert!(!inputs.contains_key("extra"));
    }

    #[test]
    fn test_explicit_mapping_and_literals() {
        let mut mapping = BTreeMap::new();
        mapping.insert("question".to_string(), json!("${data.item.text}"));
        mapping.insert("count".to_string(), json!(5));

        let inputs =
            apply_inputs_mapping(&declared(), &mapping, &row(json!({"item": {"text": "hi"}})), 0)
                .unwrap();
        assert_eq!(inputs["question"], json!("hi"));
        assert_eq!(inputs["count"], json!(5));
    }

    #[test]
    fn test_missing_column_without_default() {
        let err = apply_inputs_mapping(&declared(), &BTreeMap::new(), &row(json!({"count": 2})), 7)
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InputMapping { .. }));
        assert!(err.to_string().contains("line 7"));

        // count has a default, so only question is required
        let inputs =
            apply_inputs_mapping(&declared(), &BTreeMap::new(), &row(json!({"question": "q"})), 0)
                .unwrap();
        assert!(!inputs.contains_key("count"));
    }

    #[test]
    fn test_unsupported_reference() {
        let mut mapping = BTreeMap::new();
        mapping.insert("question".to_string(), json!("${run.outputs.answer}"));
        let err = apply_inputs_mapping(&declared(), &mapping, &row(json!({})), 0).unwrap_err();
        assert!(err.to_string().contains("unsupported reference"));
    }

    #[test]
    fn test_coerce_inputs() {
        let values = row(json!({"question": 42, "count": "3"}));
        let coerced = coerce_inputs(&declared(), &values).unwrap();
        assert_eq!(coerced["question"], json!("42"));
        assert_eq!(coerced["count"], json!(3));

        let coerced = coerce_inputs(&declared(), &row(json!({"question": "q"}))).unwrap();
        assert_eq!(coerced["count"], json!(1));

        let err = coerce_inputs(&declared(), &row(json!({"question": "q", "count": "three"})))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InputType { ref input, .. } if input == "count"));
    }
}
