// Flow Graph (DAG) Builder
// Validates a flow definition against the tool registry and builds the node graph

use crate::parser::models::{
    Binding, FailedLinePolicy, FlowDefinition, InputDefinition, NodeDefinition, RetryPolicy,
};
use crate::parser::FlowParser;
use crate::tools::{Tool, ToolRegistry, ToolSignature};

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Error type for graph validation
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Two nodes share a name
    DuplicateNode,
    /// Binding references a node that does not exist
    UnknownNode,
    /// Binding references a flow input that is not declared
    UnknownInput,
    /// Circular dependency detected
    CyclicDependency,
    /// A per-line node consumes an aggregation node
    InvalidAggregationReference,
    /// Node names a tool missing from the registry
    UnknownTool,
    /// Malformed `${...}` reference
    InvalidBinding,
    /// Flow output cannot be resolved per line
    InvalidOutput,
    /// Bindings do not fit the tool signature
    ParameterMismatch,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph validation error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn new(kind: GraphErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn cyclic(message: impl Into<String>) -> Self {
        Self::new(GraphErrorKind::CyclicDependency, message)
    }

    pub fn unknown_node(message: impl Into<String>) -> Self {
        Self::new(GraphErrorKind::UnknownNode, message)
    }

    pub fn parameter_mismatch(message: impl Into<String>) -> Self {
        Self::new(GraphErrorKind::ParameterMismatch, message)
    }
}

/// Activation condition with a parsed binding
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateCondition {
    pub when: Binding,
    pub is: Value,
}

/// A validated node with its tool resolved
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub tool_name: String,
    pub tool: Arc<dyn Tool>,
    pub inputs: BTreeMap<String, Binding>,
    pub activate: Option<ActivateCondition>,
    pub aggregation: bool,
    /// Tool cacheable marker, possibly overridden by `enable_cache`
    pub enable_cache: bool,
    pub bypass_value: Option<Value>,
    pub failed_lines: FailedLinePolicy,
    pub retry: RetryPolicy,
}

impl Node {
    pub fn signature(&self) -> &ToolSignature {
        self.tool.signature()
    }

    /// Distinct nodes referenced by inputs and the activate condition
    pub fn dependencies(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.inputs
            .values()
            .chain(self.activate.iter().map(|a| &a.when))
            .filter_map(Binding::node_reference)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Distinct nodes referenced by inputs only
    pub fn input_dependencies(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.inputs
            .values()
            .filter_map(Binding::node_reference)
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("tool", &self.tool_name)
            .field("inputs", &self.inputs)
            .field("activate", &self.activate)
            .field("aggregation", &self.aggregation)
            .finish_non_exhaustive()
    }
}

/// Validated flow graph
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub name: String,
    pub inputs: BTreeMap<String, InputDefinition>,
    pub outputs: BTreeMap<String, Binding>,
    nodes: Vec<Node>,
    /// Quick lookup of node index by name
    indices: HashMap<String, usize>,
    /// Direct dependents of each node
    dependents: HashMap<String, Vec<String>>,
}

impl FlowGraph {
    /// Validate a definition and resolve its tools
    pub fn load(definition: &FlowDefinition, registry: &ToolRegistry) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(definition.nodes.len());
        let mut indices = HashMap::new();

        for (i, node_def) in definition.nodes.iter().enumerate() {
            if indices.insert(node_def.name.clone(), i).is_some() {
                return Err(GraphError::new(
                    GraphErrorKind::DuplicateNode,
                    format!("duplicate node name '{}'", node_def.name),
                ));
            }
            nodes.push(Self::build_node(node_def, registry)?);
        }

        let mut outputs = BTreeMap::new();
        for (name, output) in &definition.outputs {
            let binding = Binding::parse(&output.reference).map_err(|e| {
                GraphError::new(
                    GraphErrorKind::InvalidBinding,
                    format!("flow output '{}': {}", name, e),
                )
            })?;
            outputs.insert(name.clone(), binding);
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            for dep in node.dependencies() {
                dependents
                    .entry(dep.to_string())
                    .or_default()
                    .push(node.name.clone());
            }
        }

        let graph = Self {
            name: definition.name.clone().unwrap_or_else(|| "flow".to_string()),
            inputs: definition.inputs.clone(),
            outputs,
            nodes,
            indices,
            dependents,
        };

        graph.validate()?;
        Ok(graph)
    }

    /// Parse YAML and load it
    pub fn from_yaml(content: &str, registry: &ToolRegistry) -> crate::ExecutorResult<Self> {
        let definition = FlowParser::parse(content)?;
        Ok(Self::load(&definition, registry)?)
    }

    fn build_node(def: &NodeDefinition, registry: &ToolRegistry) -> Result<Node, GraphError> {
        let tool = registry.get(&def.tool).ok_or_else(|| {
            GraphError::new(
                GraphErrorKind::UnknownTool,
                format!(
                    "node '{}' uses unknown tool '{}', registered tools: {}",
                    def.name,
                    def.tool,
                    registry.names().join(", ")
                ),
            )
        })?;

        let parse = |raw: &Value, what: &str| {
            Binding::parse(raw).map_err(|e| {
                GraphError::new(
                    GraphErrorKind::InvalidBinding,
                    format!("node '{}' {}: {}", def.name, what, e),
                )
            })
        };

        let mut inputs = BTreeMap::new();
        for (param, raw) in &def.inputs {
            inputs.insert(param.clone(), parse(raw, &format!("input '{}'", param))?);
        }

        let activate = match &def.activate {
            Some(condition) => Some(ActivateCondition {
                when: parse(&condition.when, "activate condition")?,
                is: condition.is.clone(),
            }),
            None => None,
        };

        let node = Node {
            name: def.name.clone(),
            tool_name: def.tool.clone(),
            enable_cache: def.enable_cache.unwrap_or(tool.signature().cacheable),
            tool,
            inputs,
            activate,
            aggregation: def.aggregation,
            bypass_value: def.bypass_value.clone(),
            failed_lines: def.failed_lines,
            retry: def.retry.clone().unwrap_or_default(),
        };

        Self::check_signature(&node)?;
        Ok(node)
    }

    /// Check bindings against the tool's parameter schema
    fn check_signature(node: &Node) -> Result<(), GraphError> {
        let signature = node.signature();

        for (param, binding) in &node.inputs {
            let spec = signature.get(param).ok_or_else(|| {
                GraphError::parameter_mismatch(format!(
                    "node '{}' binds '{}', which tool '{}' does not declare",
                    node.name, param, node.tool_name
                ))
            })?;

            if spec.ty.is_connection() && !matches!(binding, Binding::Literal(Value::String(_))) {
                return Err(GraphError::parameter_mismatch(format!(
                    "node '{}' parameter '{}' must be bound to a connection name",
                    node.name, param
                )));
            }

            if let Binding::Literal(value) = binding {
                if !spec.ty.accepts(value) {
                    return Err(GraphError::parameter_mismatch(format!(
                        "node '{}' parameter '{}' expects {}, got literal {}",
                        node.name, param, spec.ty, value
                    )));
                }
            }
        }

        for param in signature.required_params() {
            if !node.inputs.contains_key(param) {
                return Err(GraphError::parameter_mismatch(format!(
                    "node '{}' does not bind required parameter '{}' of tool '{}'",
                    node.name, param, node.tool_name
                )));
            }
        }

        Ok(())
    }

    /// Validate references, aggregation boundaries and acyclicity
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in &self.nodes {
            let bindings = node
                .inputs
                .values()
                .chain(node.activate.iter().map(|a| &a.when));
            for binding in bindings {
                self.check_reference(binding, &format!("node '{}'", node.name))?;
                if let Some(dep) = binding.node_reference() {
                    if !node.aggregation && self.nodes[self.indices[dep]].aggregation {
                        return Err(GraphError::new(
                            GraphErrorKind::InvalidAggregationReference,
                            format!(
                                "node '{}' cannot reference aggregation node '{}'",
                                node.name, dep
                            ),
                        ));
                    }
                }
            }
        }

        for (name, binding) in &self.outputs {
            self.check_reference(binding, &format!("flow output '{}'", name))?;
            if let Some(dep) = binding.node_reference() {
                if self.nodes[self.indices[dep]].aggregation {
                    return Err(GraphError::new(
                        GraphErrorKind::InvalidOutput,
                        format!(
                            "flow output '{}' cannot reference aggregation node '{}'",
                            name, dep
                        ),
                    ));
                }
            }
        }

        self.detect_cycles()
    }

    fn check_reference(&self, binding: &Binding, owner: &str) -> Result<(), GraphError> {
        match binding {
            Binding::FlowInput(input) if !self.inputs.contains_key(input) => Err(GraphError::new(
                GraphErrorKind::UnknownInput,
                format!("{} references undefined flow input '{}'", owner, input),
            )),
            Binding::NodeOutput { node, .. } if !self.indices.contains_key(node) => Err(
                GraphError::unknown_node(format!("{} references unknown node '{}'", owner, node)),
            ),
            _ => Ok(()),
        }
    }

    /// Detect cycles in node dependencies using DFS
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(node.name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected between nodes: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a Node,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        let name = node.name.as_str();
        visited.insert(name);
        rec_stack.insert(name);

        for dep in node.dependencies() {
            if !visited.contains(dep) {
                if let Some(next) = self.node(dep) {
                    if let Some(mut cycle) = self.dfs_cycle(next, visited, rec_stack) {
                        cycle.insert(0, name.to_string());
                        return Some(cycle);
                    }
                }
            } else if rec_stack.contains(dep) {
                return Some(vec![name.to_string(), dep.to_string()]);
            }
        }

        rec_stack.remove(name);
        None
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.indices.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    /// Per-line nodes in declaration order
    pub fn line_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.aggregation)
    }

    pub fn aggregation_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.aggregation)
    }

    pub fn has_aggregation(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }

    /// Nodes depending directly on `name`
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Per-line values that aggregation nodes consume: node names and `inputs.NAME` keys
    pub fn aggregation_inputs(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        for node in self.aggregation_nodes() {
            let bindings = node
                .inputs
                .values()
                .chain(node.activate.iter().map(|a| &a.when));
            for binding in bindings {
                match binding {
                    Binding::FlowInput(input) => {
                        keys.insert(format!("inputs.{}", input));
                    }
                    Binding::NodeOutput { node: dep, .. } if !self.is_aggregation(dep) => {
                        keys.insert(dep.clone());
                    }
                    _ => {}
                }
            }
        }
        keys
    }

    pub fn is_aggregation(&self, name: &str) -> bool {
        self.node(name).map(|n| n.aggregation).unwrap_or(false)
    }

    /// A stream from `name` may reach the caller unmaterialized: no node consumes it and
    /// exactly one flow output reads it whole
    pub fn can_hand_off_stream(&self, name: &str) -> bool {
        if !self.dependents(name).is_empty() {
            return false;
        }
        let readers: Vec<&Binding> = self
            .outputs
            .values()
            .filter(|b| b.node_reference() == Some(name))
            .collect();
        matches!(
            readers.as_slice(),
            [Binding::NodeOutput { path, .. }] if path.is_empty()
        )
    }

    /// Per-line nodes in topological order (Kahn's algorithm, declaration order on ties)
    pub fn topological_order(&self) -> Vec<&Node> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for node in self.line_nodes() {
            in_degree.insert(&node.name, node.dependencies().len());
        }

        let mut queue: VecDeque<&Node> = self
            .line_nodes()
            .filter(|n| in_degree.get(n.name.as_str()) == Some(&0))
            .collect();

        let mut result = Vec::new();
        while let Some(node) = queue.pop_front() {
            result.push(node);

            for dependent in self.dependents(&node.name) {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        if let Some(next) = self.node(dependent) {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        result
    }
}
