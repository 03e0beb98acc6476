//! Provider Integration Module
//!
//! The boundary to the external data providers (token balance APIs, lending protocols,
//! AMM positions, lockers).
//!
//! ## Submodules
//! - **`registry`**: Maps provider ids to adapter closures and expands requests into work items.
//! - **`payload`**: The tagged provider payload union and its mapping to wallet items.
//! - **`error`**: Provider error taxonomy (permanent vs transient).
//! - **`http`**: An adapter for providers reachable over HTTP.

pub mod error;
pub mod http;
pub mod payload;
pub mod registry;

pub use error::ProviderError;
pub use payload::{PayloadMapper, ProviderPayload, ProviderRequest, ProviderResponse, StandardMapper};
pub use registry::ProviderRegistry;
