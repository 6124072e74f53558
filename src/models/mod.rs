//! Core data models for the object metadata store.
//!
//! These entities represent object streams and their segments. They map to
//! database rows in the `objects` and `segments` tables and serialize
//! naturally as JSON via `serde`.

pub mod object;
pub mod segment;
