// Flow YAML Parser
// Parses flow definition files into FlowDefinition models

use crate::parser::error::{ParseError, ParseErrorKind, ParseResult};
use crate::parser::models::FlowDefinition;

use std::fs;
use std::path::Path;

/// Flow definition parser
pub struct FlowParser;

impl FlowParser {
    /// Parse a flow definition from a YAML string
    pub fn parse(content: &str) -> ParseResult<FlowDefinition> {
        let flow: FlowDefinition =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;

        Self::check_node_names(&flow, content)?;
        Ok(flow)
    }

    /// Parse a flow definition from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<FlowDefinition> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ParseError::new(
                format!("failed to read flow file '{}': {}", path.display(), e),
                0,
                0,
            )
            .with_kind(ParseErrorKind::IoError)
        })?;

        Self::parse(&content)
    }

    /// Node names must be non-empty; duplicates are reported by graph validation
    fn check_node_names(flow: &FlowDefinition, content: &str) -> ParseResult<()> {
        for node in &flow.nodes {
            if node.name.trim().is_empty() {
                let line = Self::find_line(content, "name:").unwrap_or(1);
                return Err(ParseError::new("node name must not be empty", line, 1)
                    .with_source_context(content, 2)
                    .with_suggestion("give every node a unique 'name:'"));
            }
        }
        Ok(())
    }

    fn find_line(content: &str, needle: &str) -> Option<usize> {
        content
            .lines()
            .position(|line| {
                let trimmed = line.trim_start().trim_start_matches("- ");
                trimmed.starts_with(needle)
                    && trimmed[needle.len()..].trim().trim_matches('"').is_empty()
            })
            .map(|idx| idx + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{FailedLinePolicy, ValueType};
    use serde_json::json;
    use std::io::Write;

    const FLOW: &str = r#"
name: arithmetic
inputs:
  input1:
    type: int
outputs:
  result:
    reference: ${collect.output}
nodes:
  - name: double
    tool: double
    inputs:
      x: ${inputs.input1}
  - name: square
    tool: square
    inputs:
      x: ${inputs.input1}
  - name: collect
    tool: collect
    inputs:
      double: ${double.output}
      square: ${square.output}
  - name: total
    tool: sum
    aggregation: true
    failed_lines: "null"
    inputs:
      values: ${double.output}
"#;

    #[test]
    fn test_parse_flow() {
        let flow = FlowParser::parse(FLOW).unwrap();
        assert_eq!(flow.name.as_deref(), Some("arithmetic"));
        assert_eq!(flow.nodes.len(), 4);
        assert_eq!(flow.inputs["input1"].value_type, ValueType::Int);
        assert_eq!(flow.outputs["result"].reference, json!("${collect.output}"));
        assert!(flow.nodes[3].aggregation);
        assert_eq!(flow.nodes[3].failed_lines, FailedLinePolicy::Null);
    }

    #[test]
    fn test_parse_unknown_field_reports_location() {
        let content = "nodes:\n  - name: a\n    tool: echo\n    activation:\n      when: x\n";
        let err = FlowParser::parse(content).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnknownField);
        assert!(err.message.contains("activation"));
        assert_eq!(err.suggestion, Some("did you mean 'activate'?".to_string()));
    }

    #[test]
    fn test_parse_missing_tool() {
        let err = FlowParser::parse("nodes:\n  - name: a\n").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidSchema);
        assert!(err.message.contains("tool"));
    }

    #[test]
    fn test_parse_empty_node_name() {
        let err = FlowParser::parse("nodes:\n  - name: \"\"\n    tool: echo\n").unwrap_err();
        assert!(err.message.contains("must not be empty"));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_parse_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FLOW.as_bytes()).unwrap();

        let flow = FlowParser::parse_file(file.path()).unwrap();
        assert_eq!(flow.nodes[0].name, "double");
    }

    #[test]
    fn test_parse_missing_file() {
        let err = FlowParser::parse_file("/nonexistent/flow.yaml").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::IoError);
    }
}
