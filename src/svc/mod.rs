//! # Services module
//!
//! This module provide services to interact with kubernetes and the
//! provisioning backends, the reconciliation lifecycle and helpers to do so.
pub mod cfg;
pub mod crd;
pub mod k8s;
pub mod lifecycle;
pub mod provider;
pub mod telemetry;
