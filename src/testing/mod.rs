//! Testing utilities and mock implementations
//!
//! Deterministic stand-ins for the wire layer and the clock, so sessions can
//! be driven without a hub or real time.

pub mod mocks;

pub use mocks::*;
