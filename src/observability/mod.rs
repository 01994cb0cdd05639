// Structured logging and secret redaction
pub mod logging;

// Counter names and descriptions
pub mod metrics;

pub use logging::{init_logging, redact_secrets, SecretRedactor};
pub use metrics::describe_metrics;
