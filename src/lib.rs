pub mod cdi;
pub mod claims;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod provisioning;
pub mod registration;
pub mod routes;
pub mod service;
pub mod testing;
pub mod tracing;
pub mod vf_sizing;
