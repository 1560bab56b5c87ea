//! Record-level validation and the domain rules that turn a parsed record
//! into a statistics update.

pub mod entity_id;
pub mod parse;
pub mod processor;
pub mod reader;
pub mod validator;

pub use entity_id::EntityIdPattern;
pub use parse::parse_non_negative;
pub use processor::RecordProcessor;
pub use reader::read_delimited;
pub use validator::{BatchSchema, ColumnStats, RecordValidator, ValidationIssue, ValidationReport};
