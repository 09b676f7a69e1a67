//! Testing utilities and mock implementations
//!
//! This module provides mock collaborators for exercising the device
//! transport without an IoT Hub, an MQTT broker or real credentials.

pub mod mocks;

pub use mocks::*;
