//! Cache-aware, observable HTTP execution layer for the Jira REST API.
//!
//! Requests described by [`jira::OutboundRequest`] run through
//! [`jira::CachedJiraClient`], which revalidates cached reads with
//! conditional requests, invalidates on mutation and returns failures as
//! [`observability::ClassifiedError`]s.

pub mod cache;
pub mod config;
pub mod jira;
pub mod logging;
pub mod observability;
