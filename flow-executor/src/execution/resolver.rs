// Dependency Resolver
// Decides which pending nodes can run, must be bypassed, or fail because of upstream failures

use crate::error::ExecutorError;
use crate::execution::context::FlowExecutionContext;
use crate::execution::graph::{FlowGraph, Node};
use crate::execution::run_info::Status;
use crate::parser::models::{apply_path, Binding};

use serde_json::Value;
use std::collections::BTreeMap;

/// What to do with a node whose dependencies are all terminal
#[derive(Debug)]
pub enum Decision<'g> {
    Run(&'g Node),
    Bypass(&'g Node),
    Fail(&'g Node, ExecutorError),
}

/// Demand-driven scheduling state over a set of nodes
pub struct DependencyResolver<'g> {
    graph: &'g FlowGraph,
    /// Not yet decided, in declaration order
    pending: Vec<&'g Node>,
}

impl<'g> DependencyResolver<'g> {
    pub fn new(graph: &'g FlowGraph, nodes: Vec<&'g Node>) -> Self {
        Self {
            graph,
            pending: nodes,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending.iter().map(|n| n.name.clone()).collect()
    }

    /// Remove and return a decision for every pending node whose dependencies are terminal
    pub fn pop_ready(&mut self, ctx: &FlowExecutionContext) -> Vec<Decision<'g>> {
        let mut decisions = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());

        for node in self.pending.drain(..) {
            let ready = node
                .dependencies()
                .iter()
                .all(|dep| ctx.status(dep).is_terminal());
            if ready {
                decisions.push(classify(self.graph, node, ctx));
            } else {
                still_pending.push(node);
            }
        }

        self.pending = still_pending;
        decisions
    }

    /// Resolve a node's bindings into tool arguments, filling parameter defaults
    pub fn resolve_inputs(
        &self,
        node: &Node,
        ctx: &FlowExecutionContext,
    ) -> Result<BTreeMap<String, Value>, ExecutorError> {
        let signature = node.signature();
        let mut resolved = BTreeMap::new();

        for (param, binding) in &node.inputs {
            let value = match resolve_binding(self.graph, node, binding, ctx)? {
                Resolved::Value(value) => value,
                Resolved::Bypassed(Some(value)) => value,
                Resolved::Bypassed(None) if has_default(node, param) => continue,
                Resolved::Bypassed(None) => Value::Null,
                Resolved::Failed(_) => continue,
            };
            resolved.insert(param.clone(), value);
        }

        for (param, spec) in &signature.params {
            if !resolved.contains_key(param) {
                if let Some(default) = &spec.default {
                    resolved.insert(param.clone(), default.clone());
                }
            }
        }

        Ok(resolved)
    }
}

/// Resolution of a single binding against the context
enum Resolved {
    Value(Value),
    /// Upstream bypassed; carries its bypass value if configured
    Bypassed(Option<Value>),
    /// Upstream failed or was canceled
    Failed(String),
}

fn resolve_binding(
    graph: &FlowGraph,
    node: &Node,
    binding: &Binding,
    ctx: &FlowExecutionContext,
) -> Result<Resolved, ExecutorError> {
    match binding {
        Binding::Literal(value) => Ok(Resolved::Value(value.clone())),
        Binding::FlowInput(name) => {
            let key = format!("inputs.{}", name);
            if let Some(list) = ctx.aggregated_list(&key, &[], node.failed_lines) {
                return Ok(Resolved::Value(list));
            }
            Ok(Resolved::Value(
                ctx.inputs.get(name).cloned().unwrap_or(Value::Null),
            ))
        }
        Binding::NodeOutput { node: dep, path } => {
            if let Some(list) = ctx.aggregated_list(dep, path, node.failed_lines) {
                return Ok(Resolved::Value(list));
            }
            match ctx.status(dep) {
                Status::Completed => {
                    let output = ctx.output(dep).unwrap_or(&Value::Null);
                    apply_path(output, path)
                        .map(Resolved::Value)
                        .ok_or_else(|| ExecutorError::InputResolution {
                            node: node.name.clone(),
                            message: format!("output of '{}' has no property '{}'", dep, path.join(".")),
                        })
                }
                Status::Bypassed => {
                    let bypass_value = bypass_value(graph, dep)
                        .map(|v| apply_path(v, path).unwrap_or(Value::Null));
                    Ok(Resolved::Bypassed(bypass_value))
                }
                Status::Failed | Status::Canceled => Ok(Resolved::Failed(dep.clone())),
                Status::NotStarted | Status::Running => Err(ExecutorError::InputResolution {
                    node: node.name.clone(),
                    message: format!("node '{}' has not finished", dep),
                }),
            }
        }
    }
}

fn bypass_value<'a>(graph: &'a FlowGraph, node: &str) -> Option<&'a Value> {
    graph.node(node).and_then(|n| n.bypass_value.as_ref())
}

fn has_default(node: &Node, param: &str) -> bool {
    node.signature()
        .get(param)
        .map(|spec| spec.default.is_some())
        .unwrap_or(false)
}

fn classify<'g>(graph: &FlowGraph, node: &'g Node, ctx: &FlowExecutionContext) -> Decision<'g> {
    if let Some(condition) = &node.activate {
        match resolve_binding(graph, node, &condition.when, ctx) {
            Ok(Resolved::Value(actual)) if values_match(&actual, &condition.is) => {}
            Ok(Resolved::Value(_)) | Ok(Resolved::Bypassed(_)) => return Decision::Bypass(node),
            Ok(Resolved::Failed(upstream)) => {
                return Decision::Fail(
                    node,
                    ExecutorError::UpstreamFailed {
                        node: node.name.clone(),
                        upstream,
                    },
                )
            }
            Err(e) => return Decision::Fail(node, e),
        }
    }

    for (param, binding) in &node.inputs {
        if let Some(dep) = binding.node_reference() {
            let failed = matches!(ctx.status(dep), Status::Failed | Status::Canceled);
            if failed && !has_default(node, param) && !ctx.is_aggregated(dep) {
                return Decision::Fail(
                    node,
                    ExecutorError::UpstreamFailed {
                        node: node.name.clone(),
                        upstream: dep.to_string(),
                    },
                );
            }
        }
    }

    let refs = node.input_dependencies();
    let all_bypassed = !refs.is_empty()
        && refs
            .iter()
            .all(|dep| ctx.status(dep) == Status::Bypassed);
    if all_bypassed {
        let unresolvable = node.inputs.iter().any(|(param, binding)| {
            binding
                .node_reference()
                .map(|dep| bypass_value(graph, dep).is_none() && !has_default(node, param))
                .unwrap_or(false)
        });
        if unresolvable {
            return Decision::Bypass(node);
        }
    }

    Decision::Run(node)
}

/// Activation comparison; numbers compare by value so `1` matches `1.0`
fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}
