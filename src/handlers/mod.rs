//! HTTP handlers. They translate requests into core calls and render the
//! S3 XML responses; authentication happens upstream.

pub mod bucket_handlers;
pub mod health_handlers;
pub mod object_handlers;

use crate::{errors::AppError, models::multipart::Initiator};
use axum::{
    body::Body,
    extract::FromRequestParts,
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::Response,
};

pub(crate) const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

const CANONICAL_ID_HEADER: &str = "x-amz-canonical-id";
const DISPLAY_NAME_HEADER: &str = "x-amz-display-name";

/// Authenticated caller, as asserted by the fronting proxy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requester(pub Initiator);

impl<S: Send + Sync> FromRequestParts<S> for Requester {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_str(&parts.headers, CANONICAL_ID_HEADER)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::new(StatusCode::FORBIDDEN, "AccessDenied", "Access Denied"))?;
        let display_name = header_str(&parts.headers, DISPLAY_NAME_HEADER).unwrap_or(id);
        Ok(Requester(Initiator {
            id: id.to_string(),
            display_name: display_name.to_string(),
        }))
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn xml_response(status: StatusCode, xml: String) -> Response {
    let mut response = Response::new(Body::from(xml));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    response
}
