// Test Tools
// Small tool set shared by the unit tests, with per-tool call counters

use crate::tools::{
    AsyncFnTool, FnTool, ParamType, ToolError, ToolRegistry, ToolSignature,
};

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Registry factory that counts how often each tool body runs
#[derive(Clone, Default)]
pub struct TestTools {
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().get(tool).copied().unwrap_or(0)
    }

    fn counter(&self, tool: &'static str) -> impl Fn() -> usize + Send + Sync + 'static {
        let calls = self.calls.clone();
        move || {
            let mut calls = calls.lock().unwrap();
            let count = calls.entry(tool.to_string()).or_insert(0);
            *count += 1;
            *count
        }
    }

    pub fn registry(&self) -> ToolRegistry {
        let mut registry = ToolRegistry::new();

        let count = self.counter("double");
        registry.register(FnTool::new(
            ToolSignature::new("double").param("x", ParamType::Int),
            move |args, _ctx| {
                count();
                Ok(json!(args.i64("x")? * 2))
            },
        ));

        let count = self.counter("square");
        registry.register(FnTool::new(
            ToolSignature::new("square").param("x", ParamType::Int),
            move |args, _ctx| {
                count();
                let x = args.i64("x")?;
                Ok(json!(x * x))
            },
        ));

        registry.register(FnTool::new(
            ToolSignature::new("collect")
                .param("double", ParamType::Any)
                .param("square", ParamType::Any),
            |args, ctx| {
                let inputs = json!({ "double": args.require("double")?, "square": args.require("square")? });
                ctx.tracer()
                    .trace("combine", inputs.clone(), || Ok::<Value, ToolError>(inputs.clone()))
            },
        ));

        registry.register(FnTool::new(
            ToolSignature::new("echo").param("value", ParamType::Any),
            |args, _ctx| Ok(args.require("value")?.clone()),
        ));

        registry.register(FnTool::new(
            ToolSignature::new("add")
                .param("a", ParamType::Int)
                .optional("b", ParamType::Int, json!(0)),
            |args, _ctx| Ok(json!(args.i64("a")? + args.i64("b")?)),
        ));

        registry.register(FnTool::new(
            ToolSignature::new("sum").param("values", ParamType::List),
            |args, ctx| {
                let values = args.list("values")?;
                let total: f64 = values.iter().filter_map(Value::as_f64).sum();
                ctx.log_metric("total", total);
                ctx.log_metric("count", values.len() as u64);
                Ok(json!(total))
            },
        ));

        let count = self.counter("counted");
        registry.register(FnTool::new(
            ToolSignature::new("counted").param("value", ParamType::Any),
            move |args, _ctx| {
                count();
                Ok(args.require("value")?.clone())
            },
        ));

        registry.register(FnTool::new(
            ToolSignature::new("fail").param("message", ParamType::String),
            |args, _ctx| -> Result<Value, ToolError> { Err(ToolError::failed(args.str("message")?)) },
        ));

        let count = self.counter("flaky");
        registry.register(FnTool::new(
            ToolSignature::new("flaky").param("failures", ParamType::Int),
            move |args, _ctx| {
                let attempt = count() as i64;
                if attempt <= args.i64("failures")? {
                    Err(ToolError::failed(format!("transient failure {}", attempt)))
                } else {
                    Ok(json!(attempt))
                }
            },
        ));

        registry.register(FnTool::new(
            ToolSignature::new("stream_words").param("count", ParamType::Int),
            |args, _ctx| {
                let count = args.i64("count")?.max(0);
                let words: BoxStream<'static, Value> =
                    stream::iter((0..count).map(|i| json!(format!("word{} ", i)))).boxed();
                Ok(words)
            },
        ));

        let count = self.counter("sleep");
        registry.register(AsyncFnTool::new(
            ToolSignature::new("sleep").param("ms", ParamType::Int),
            move |args, _ctx| {
                count();
                let ms = args.i64("ms").map(|ms| ms.max(0) as u64);
                async move {
                    let ms = ms?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<Value, ToolError>(json!(ms))
                }
            },
        ));

        registry.register(FnTool::new(
            ToolSignature::new("connected").param("connection", ParamType::Connection),
            |args, _ctx| {
                let connection = args.connection("connection")?;
                Ok(json!({
                    "name": connection.name,
                    "kind": connection.kind,
                    "key": connection.secret("api_key"),
                }))
            },
        ));

        registry
    }
}

/// Registry with the shared test tools and throwaway counters
pub fn test_registry() -> ToolRegistry {
    TestTools::new().registry()
}
