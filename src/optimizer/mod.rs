//! # Payload Optimizer Module
//!
//! Pure transforms that shrink outbound provider payloads. See [`PayloadOptimizer`].

pub mod payload;

pub use payload::{
    optimize_message, simplify_messages, summary_placeholder, OptimizerOptions, PayloadOptimizer, TRUNCATION_MARKER,
};
