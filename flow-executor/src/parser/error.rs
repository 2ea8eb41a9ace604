// Flow parser error types
// Location-aware parse errors with source excerpts and fix suggestions

use std::fmt;

/// Parse error pointing at a line and column of the flow file
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// 1-indexed
    pub line: usize,
    /// 1-indexed
    pub column: usize,
    /// Excerpt of the surrounding source, the offending line marked with `>`
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    YamlSyntax,
    /// Wrong value types or missing required fields
    InvalidSchema,
    UnknownField,
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach `radius` lines of source on each side of the error line
    pub fn with_source_context(mut self, source: &str, radius: usize) -> Self {
        let first = self.line.saturating_sub(radius).max(1);
        let last = self.line + radius;

        self.context = source
            .lines()
            .enumerate()
            .map(|(i, text)| (i + 1, text))
            .filter(|(number, _)| (first..=last).contains(number))
            .map(|(number, text)| {
                let marker = if number == self.line { '>' } else { ' ' };
                let mut row = format!("{} {:>4} | {}\n", marker, number, text);
                if number == self.line && self.column > 0 {
                    row.push_str(&format!("       | {:>width$}\n", "^", width = self.column));
                }
                row
            })
            .collect();
        self
    }

    /// Translate a serde_yaml error into a located flow parse error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));
        let raw = err.to_string();
        let offending = source.lines().nth(line.saturating_sub(1)).unwrap_or_default();

        let mut parsed = ParseError::new(readable_message(&raw), line, column)
            .with_kind(classify(&raw))
            .with_source_context(source, 2);
        parsed.suggestion = suggest_fix(&raw, offending);
        parsed
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line {}:{})", self.message, self.line, self.column)?;
        if !self.context.is_empty() {
            write!(f, "\n\n{}", self.context)?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

fn classify(raw: &str) -> ParseErrorKind {
    if raw.contains("unknown field") {
        ParseErrorKind::UnknownField
    } else if raw.contains("missing field") || raw.contains("invalid type") || raw.contains("unknown variant") {
        ParseErrorKind::InvalidSchema
    } else {
        ParseErrorKind::YamlSyntax
    }
}

/// Text between the first backtick pair following `marker`
fn quoted_after<'a>(raw: &'a str, marker: &str) -> Option<&'a str> {
    let rest = &raw[raw.find(marker)? + marker.len()..];
    let rest = rest.strip_prefix('`')?;
    rest.split('`').next()
}

fn readable_message(raw: &str) -> String {
    // serde_yaml appends " at line N column M", which the error already carries
    let body = raw.split(" at line ").next().unwrap_or(raw);

    if let Some(field) = quoted_after(body, "missing field ") {
        return format!("missing required field '{}'", field);
    }
    if let Some(field) = quoted_after(body, "unknown field ") {
        return format!("unknown field '{}'", field);
    }
    body.to_string()
}

/// Flow-specific hints for common mistakes
fn suggest_fix(raw: &str, offending: &str) -> Option<String> {
    match quoted_after(raw, "missing field ") {
        Some("tool") => return Some("every node needs a 'tool:' naming a registered tool".to_string()),
        Some("name") => return Some("every node needs a unique 'name:'".to_string()),
        Some("reference") => {
            return Some("flow outputs are declared as 'reference: ${node.output}'".to_string())
        }
        _ => {}
    }

    if offending.starts_with('\t') {
        return Some("indent with spaces, YAML does not allow tabs".to_string());
    }

    const RENAMES: [(&str, &str); 5] = [
        ("activation", "activate"),
        ("enablecache", "enable_cache"),
        ("cache:", "enable_cache"),
        ("bypass:", "bypass_value"),
        ("retries", "retry"),
    ];
    let lowered = offending.to_lowercase();
    RENAMES
        .iter()
        .find(|(typo, _)| lowered.contains(typo))
        .map(|(_, correct)| format!("did you mean '{}'?", correct))
}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_display() {
        let err = ParseError::new("missing required field 'tool'", 10, 5)
            .with_suggestion("every node needs a 'tool:' naming a registered tool");

        let output = format!("{}", err);
        assert!(output.starts_with("missing required field 'tool' (line 10:5)"));
        assert!(output.contains("help: every node needs"));
    }

    #[test]
    fn test_source_context_marks_error_line() {
        let source = "name: demo\ninputs:\n  x:\n    type: int\nnodes:\n  - name: double\n    inputs:\n      x: ${inputs.x}";

        let err = ParseError::new("missing required field 'tool'", 6, 5).with_source_context(source, 2);

        let lines: Vec<&str> = err.context.lines().collect();
        assert_eq!(lines[0], "     4 |     type: int");
        assert_eq!(lines[2], ">    6 |   - name: double");
        assert_eq!(lines[3], "       |     ^");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_readable_message() {
        assert_eq!(
            readable_message("nodes[0]: missing field `tool` at line 2 column 5"),
            "missing required field 'tool'"
        );
        assert_eq!(
            readable_message("unknown field `activation`, expected one of `name`, `tool` at line 4 column 5"),
            "unknown field 'activation'"
        );
        assert_eq!(readable_message("did not find expected key"), "did not find expected key");
    }

    #[test]
    fn test_typo_suggestion() {
        let raw = "unknown field `enableCache`";
        assert_eq!(
            suggest_fix(raw, "    enableCache: true"),
            Some("did you mean 'enable_cache'?".to_string())
        );
        assert_eq!(
            suggest_fix("missing field `tool`", "  - name: a"),
            Some("every node needs a 'tool:' naming a registered tool".to_string())
        );
        assert_eq!(suggest_fix("unknown field `zzz`", "    zzz: 1"), None);
    }
}
