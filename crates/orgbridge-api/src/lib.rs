//! Data API access for CRM orgs.
//!
//! This crate provides the [`OrgApi`] trait the migration pipeline talks to,
//! a REST implementation and an in-memory implementation.
//!
//! ## Features
//!
//! - **HTTP Client**: OAuth login, paged queries, composite batch writes,
//!   describe and binary downloads
//! - **Query**: typed filters rendered to SOQL
//! - **Memory org**: a fake org with failure injection for tests

mod client;
mod error;
pub mod memory;
mod org;
mod query;
mod types;

pub use client::{API_VERSION, COMPOSITE_LIMIT, OrgClient};
pub use error::ApiError;
pub use memory::MemoryOrg;
pub use org::OrgApi;
pub use query::{Filter, Query};
pub use types::*;
