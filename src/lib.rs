// Hub state change model and ingest record shape
pub mod event;

// Entity filter rules and glob matching
pub mod filter;

// Shipping counters and periodic reporting
pub mod diagnostics;

// Ingest endpoint client with bounded retry
pub mod ingest;

// Size/time bounded batching with a single delivery slot
pub mod batching;

// One-time project/table/transform setup via the config API
pub mod provisioning;

// Composition of filter, queue and ingest client
pub mod pipeline;

// TOML configuration and environment overrides
pub mod config;

pub use event::{HubStateChange, StateChangeEvent};
pub use pipeline::{Pipeline, PipelineSettings};
