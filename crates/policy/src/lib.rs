pub mod evaluate;
pub mod guard;
pub mod json_path;
pub mod redact;
pub mod validate;

pub use evaluate::{EvalRequest, evaluate};
pub use redact::redact;
pub use validate::{ValidationIssue, parse_validated, validate_spec};
