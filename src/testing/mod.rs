//! Testing utilities and mock implementations
//!
//! Mocks for exercising credential renewal and connection supervision
//! without an MQTT broker or real key material.

pub mod mocks;

pub use mocks::*;
