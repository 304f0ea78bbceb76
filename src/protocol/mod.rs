//! Message model and topic encoding for IoT Hub device messaging
//!
//! This module holds the application-facing message types, the property
//! codec that embeds properties in routing topics, and the routing topics
//! themselves.

pub mod message;
pub mod properties;
pub mod topics;

pub use message::*;
pub use properties::*;
pub use topics::*;
