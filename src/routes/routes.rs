//! Routes for the bucket and object operations.
//!
//! ## Structure
//! - **Service endpoints**
//!   - `GET    /` lists the requester's buckets
//!   - `GET    /healthz`, `GET /readyz`
//!
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}` creates a bucket
//!   - `DELETE /{bucket}` deletes a bucket
//!   - `POST   /{bucket}?delete` deletes many objects
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}` uploads an object or copies a part
//!   - `GET    /{bucket}/{*key}` downloads an object
//!   - `POST   /{bucket}/{*key}?uploads` initiates a multipart upload
//!   - `DELETE /{bucket}/{*key}` deletes an object, or aborts with `?uploadId=`
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{bucket_post, create_bucket, delete_bucket, list_buckets},
        health_handlers::{healthz, readyz},
        object_handlers::{get_object, object_delete, object_post, object_put},
    },
    services::StorageService,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router. Every handler shares the `StorageService` state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", get(list_buckets))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(object_put)
                .get(get_object)
                .post(object_post)
                .delete(object_delete),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            put(create_bucket).delete(delete_bucket).post(bucket_post),
        )
}
