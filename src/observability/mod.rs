//! Observability for the device transport
//!
//! Structured logging setup and span macros.

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};

pub use logging::{mqtt_span, session_span};
