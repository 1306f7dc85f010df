//! Schema registration and lenient validation for structured output.

pub mod policy;
pub mod registry;
pub mod validate;

pub use policy::{PolicyStore, SchemaPolicy};
pub use registry::{sanitize_label, SchemaEntry, SchemaRegistry, DEFAULT_LABEL, MAX_LABEL_LEN};
pub use validate::{SchemaValidator, Structured, Violations};
