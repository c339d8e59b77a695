use crate::{
    keys::KeyError,
    kms::KmsError,
    store::{DataError, MetadataError},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::fmt;
use thiserror::Error;

/// Outcomes of the core operations that callers can tell apart.
#[derive(Debug, Error)]
pub enum S3Error {
    #[error("the requested bucket name `{0}` is not available")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` already exists and is owned by you")]
    BucketAlreadyOwnedByYou(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("bucket `{0}` does not exist")]
    NoSuchBucket(String),
    #[error("key `{key}` does not exist in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },
    #[error("version `{0}` does not exist")]
    NoSuchVersion(String),
    #[error("upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("the requested range is not satisfiable")]
    InvalidRange,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("the XML you provided was not well-formed or did not validate")]
    MalformedXml,
    #[error("the Content-MD5 you specified did not match what we received")]
    BadDigest,
    #[error("request body is empty")]
    MissingRequestBody,
    #[error("at least one of the preconditions you specified did not hold")]
    PreconditionFailed,
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("your proposed upload exceeds the maximum allowed size")]
    EntityTooLarge,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Metadata(MetadataError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Kms(#[from] KmsError),
}

pub type S3Result<T> = Result<T, S3Error>;

impl S3Error {
    /// S3 error code string.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::BucketAlreadyExists(_) => "BucketAlreadyExists",
            S3Error::BucketAlreadyOwnedByYou(_) => "BucketAlreadyOwnedByYou",
            S3Error::BucketNotEmpty(_) => "BucketNotEmpty",
            S3Error::InvalidBucketName { .. } => "InvalidBucketName",
            S3Error::NoSuchBucket(_) => "NoSuchBucket",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::NoSuchVersion(_) => "NoSuchVersion",
            S3Error::NoSuchUpload(_) => "NoSuchUpload",
            S3Error::AccessDenied => "AccessDenied",
            S3Error::InvalidArgument(_) => "InvalidArgument",
            S3Error::InvalidRange => "InvalidRange",
            S3Error::InvalidRequest(_) => "InvalidRequest",
            S3Error::MalformedXml => "MalformedXML",
            S3Error::BadDigest => "BadDigest",
            S3Error::MissingRequestBody => "MissingRequestBodyError",
            S3Error::PreconditionFailed => "PreconditionFailed",
            S3Error::NotImplemented(_) => "NotImplemented",
            S3Error::EntityTooLarge => "EntityTooLarge",
            S3Error::Internal(_) | S3Error::Metadata(_) | S3Error::Data(_) | S3Error::Kms(_) => {
                "InternalError"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            S3Error::BucketAlreadyExists(_)
            | S3Error::BucketAlreadyOwnedByYou(_)
            | S3Error::BucketNotEmpty(_) => StatusCode::CONFLICT,
            S3Error::NoSuchBucket(_)
            | S3Error::NoSuchKey { .. }
            | S3Error::NoSuchVersion(_)
            | S3Error::NoSuchUpload(_) => StatusCode::NOT_FOUND,
            S3Error::AccessDenied => StatusCode::FORBIDDEN,
            S3Error::InvalidBucketName { .. }
            | S3Error::InvalidArgument(_)
            | S3Error::InvalidRequest(_)
            | S3Error::MalformedXml
            | S3Error::BadDigest
            | S3Error::MissingRequestBody
            | S3Error::EntityTooLarge => StatusCode::BAD_REQUEST,
            S3Error::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            S3Error::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            S3Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            S3Error::Internal(_) | S3Error::Metadata(_) | S3Error::Data(_) | S3Error::Kms(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<MetadataError> for S3Error {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NoSuchBucket(name) => S3Error::NoSuchBucket(name),
            MetadataError::NoSuchKey { bucket, key } => S3Error::NoSuchKey { bucket, key },
            MetadataError::BucketAlreadyExists(name) => S3Error::BucketAlreadyExists(name),
            other => S3Error::Metadata(other),
        }
    }
}

impl From<KeyError> for S3Error {
    fn from(err: KeyError) -> Self {
        S3Error::InvalidArgument(err.to_string())
    }
}

/// A lightweight wrapper for errors leaving the HTTP layer.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let xml = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<Error><Code>{}</Code><Message>{}</Message></Error>"#
            ),
            self.code,
            xml_escape(&self.message)
        );
        let mut response = Response::new(Body::from(xml));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        );
        *response.status_mut() = self.status;
        response
    }
}

impl From<S3Error> for AppError {
    fn from(err: S3Error) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        AppError::new(status, err.code(), err.to_string())
    }
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
