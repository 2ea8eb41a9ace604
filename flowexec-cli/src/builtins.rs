// Built-in Tools
// Demonstration tools available to flows run from the command line

use flow_executor::{AsyncFnTool, FnTool, ParamType, ToolError, ToolOutput, ToolRegistry, ToolSignature};

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;

/// Registry with every built-in tool
pub fn registry() -> ToolRegistry {
    ToolRegistry::new()
        .with(FnTool::new(
            ToolSignature::new("echo").param("value", ParamType::Any),
            |args, _ctx| Ok(args.require("value")?.clone()),
        ))
        .with(FnTool::new(
            ToolSignature::new("upper").param("text", ParamType::String).cacheable(),
            |args, _ctx| Ok(json!(args.str("text")?.to_uppercase())),
        ))
        .with(FnTool::new(
            ToolSignature::new("length").param("value", ParamType::Any).cacheable(),
            |args, _ctx| length(args.require("value")?).map(|n| json!(n)),
        ))
        .with(FnTool::new(
            ToolSignature::new("concat")
                .param("left", ParamType::String)
                .param("right", ParamType::String)
                .optional("separator", ParamType::String, json!(" ")),
            |args, _ctx| {
                Ok(json!(format!(
                    "{}{}{}",
                    args.str("left")?,
                    args.str("separator")?,
                    args.str("right")?
                )))
            },
        ))
        .with(FnTool::new(
            ToolSignature::new("words").param("text", ParamType::String),
            |args, _ctx| {
                let words: Vec<Value> = args
                    .str("text")?
                    .split_whitespace()
                    .map(|w| json!(format!("{} ", w)))
                    .collect();
                Ok(ToolOutput::Stream(stream::iter(words).boxed()))
            },
        ))
        .with(AsyncFnTool::new(
            ToolSignature::new("delay")
                .param("value", ParamType::Any)
                .optional("ms", ParamType::Int, json!(100)),
            |args, _ctx| async move {
                let ms = args.i64("ms")?.max(0) as u64;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<Value, ToolError>(args.require("value")?.clone())
            },
        ))
        .with(FnTool::new(
            ToolSignature::new("mean").param("values", ParamType::List),
            |args, ctx| {
                let numbers: Vec<f64> = args
                    .list("values")?
                    .iter()
                    .filter_map(Value::as_f64)
                    .collect();
                let mean = if numbers.is_empty() {
                    0.0
                } else {
                    numbers.iter().sum::<f64>() / numbers.len() as f64
                };
                ctx.log_metric("mean", mean);
                ctx.log_metric("count", numbers.len());
                Ok(json!(mean))
            },
        ))
}

fn length(value: &Value) -> Result<usize, ToolError> {
    match value {
        Value::String(s) => Ok(s.chars().count()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(ToolError::failed(format!("cannot take the length of {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_executor::FlowExecutor;
    use std::collections::BTreeMap;

    const FLOW: &str = r#"
name: words
inputs:
  text: { type: string }
outputs:
  shout:
    reference: ${shout.output}
  size:
    reference: ${size.output}
  joined:
    reference: ${split.output}
nodes:
  - name: shout
    tool: upper
    inputs:
      text: ${inputs.text}
  - name: size
    tool: length
    inputs:
      value: ${inputs.text}
  - name: split
    tool: words
    inputs:
      text: ${shout.output}
  - name: average
    tool: mean
    aggregation: true
    inputs:
      values: ${size.output}
"#;

    #[test]
    fn test_registry_names() {
        assert_eq!(
            registry().names(),
            vec!["concat", "delay", "echo", "length", "mean", "upper", "words"]
        );
    }

    #[test]
    fn test_length_rejects_numbers() {
        assert_eq!(length(&json!("héllo")).unwrap(), 5);
        assert_eq!(length(&json!([1, 2])).unwrap(), 2);
        assert!(length(&json!(3)).is_err());
    }

    #[tokio::test]
    async fn test_builtins_in_batch() {
        let executor = FlowExecutor::from_yaml(FLOW, &registry()).unwrap();
        let rows = vec![
            serde_json::from_value(json!({"text": "ab cd"})).unwrap(),
            serde_json::from_value(json!({"text": "xyz"})).unwrap(),
        ];

        let result = executor.run_batch(rows, &BTreeMap::new()).await.unwrap();
        let first = &result.line_results[0];
        assert_eq!(first.output["shout"], json!("AB CD"));
        assert_eq!(first.output["size"], json!(5));
        assert_eq!(first.output["joined"], json!("AB CD "));
        assert_eq!(result.aggregation.outputs["average"], json!(4.0));
        assert_eq!(result.aggregation.metrics["count"], json!(2));
    }
}
