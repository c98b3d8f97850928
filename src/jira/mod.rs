//! Jira REST transport, cache key derivation and the cache-aware client.

pub mod api_types;
pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cached_client::{CachedJiraClient, CallError};
pub use client::{JiraClient, Transport, TransportError};
pub use types::{ApiResponse, OutboundRequest};
