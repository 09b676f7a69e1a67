//! Observability for the device transport
//!
//! Structured logging through `tracing`, with span macros for the transport
//! task and the provider's poll task.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::{provider_span, transport_span};
