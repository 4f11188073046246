//! Core data models for the edge.
//!
//! Objects and buckets map to database tables via `sqlx::FromRow`; the
//! download types travel to the accounting backend as JSON via `serde`.

pub mod bucket;
pub mod download;
pub mod object;
