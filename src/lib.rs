//! S3-compatible object store whose multipart uploads live in per-bucket
//! shadow buckets, with envelope encryption of object data.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod keys;
pub mod kms;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
