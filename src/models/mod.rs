//! Core data models for the S3-compatible object storage service.
//!
//! Every record kind is an explicit struct; the metadata store persists
//! them as tagged JSON via `serde`.

pub mod bucket;
pub mod multipart;
pub mod object;
