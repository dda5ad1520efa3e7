//! Unified Stop-Loss Manager
//!
//! This is the root crate that provides benchmark and cross-crate
//! integration-test access to the internal modules. For actual
//! functionality, use `slm-core` directly.

pub use slm_core as core;
