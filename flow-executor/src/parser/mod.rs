// Parser module for flow definitions
// Provides YAML parsing and the binding syntax used by node inputs

pub mod error;
pub mod flow;
pub mod models;

pub use error::{ParseError, ParseErrorKind, ParseResult};
pub use flow::FlowParser;
pub use models::*;
