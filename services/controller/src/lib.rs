//! edgeplane controller library.
//!
//! The crate ships the `edgeplane-controller` binary; the library surface
//! exists for integration testing.

pub mod cluster;
pub mod config;
pub mod crd;
pub mod geolookup;
pub mod handlers;
pub mod kube_api;
pub mod notify;
pub mod pinning;
pub mod resolver;
