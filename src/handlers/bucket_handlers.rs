//! Bucket-level handlers: create, delete, list owned buckets, and the
//! multi-object delete POST.

use super::{Requester, S3_XMLNS, header_str, xml_response};
use crate::{
    errors::{AppError, S3Error, xml_escape},
    models::bucket::{Acl, SseConfig},
    services::{
        StorageService,
        bucket_service::CreateBucketRequest,
        multi_delete::{DeleteEntry, DeleteRequest, MultiDeleteOutcome},
    },
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use chrono::SecondsFormat;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

const ACL_HEADER: &str = "x-amz-acl";
const SSE_HEADER: &str = "x-amz-server-side-encryption";
const SSE_KMS_KEY_HEADER: &str = "x-amz-server-side-encryption-aws-kms-key-id";

/// PUT `/{bucket}`: create a bucket owned by the requester.
pub async fn create_bucket(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let acl = header_str(&headers, ACL_HEADER)
        .map(Acl::canned)
        .unwrap_or_default();
    let algorithm = header_str(&headers, SSE_HEADER)
        .map(str::to_string)
        .or_else(|| service.options.default_bucket_sse.clone());
    let sse = SseConfig {
        mandatory: algorithm.is_some(),
        algorithm,
        master_key_id: header_str(&headers, SSE_KMS_KEY_HEADER).map(str::to_string),
    };

    service
        .buckets
        .create_bucket(CreateBucketRequest {
            canonical_id: requester.id,
            display_name: requester.display_name,
            name: bucket.clone(),
            acl,
            sse,
        })
        .await?;

    let mut response = Response::new(Body::empty());
    if let Ok(location) = HeaderValue::from_str(&format!("/{bucket}")) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

/// DELETE `/{bucket}`.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.buckets.delete_bucket(&requester.id, &bucket).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/`: buckets owned by the requester.
pub async fn list_buckets(
    State(service): State<StorageService>,
    Requester(requester): Requester,
) -> Result<Response, AppError> {
    let buckets = service.buckets.list_owned_buckets(&requester.id).await?;

    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListAllMyBucketsResult xmlns="{S3_XMLNS}">"#
    );
    xml.push_str(&format!(
        "<Owner><ID>{}</ID><DisplayName>{}</DisplayName></Owner><Buckets>",
        xml_escape(&requester.id),
        xml_escape(&requester.display_name)
    ));
    for bucket in &buckets {
        xml.push_str(&format!(
            "<Bucket><Name>{}</Name><CreationDate>{}</CreationDate></Bucket>",
            xml_escape(&bucket.name),
            bucket
                .creation_date
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
    }
    xml.push_str("</Buckets></ListAllMyBucketsResult>");
    Ok(xml_response(StatusCode::OK, xml))
}

/// POST `/{bucket}?delete`: multi-object delete.
pub async fn bucket_post(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if !query.contains_key("delete") {
        return Err(S3Error::NotImplemented("bucket POST without ?delete".into()).into());
    }
    let request = parse_delete_request(&body, header_str(&headers, "content-md5"))?;
    debug!(bucket, entries = request.entries.len(), quiet = request.quiet, "multi-object delete");

    let outcome = service
        .multi_delete
        .delete_objects(&requester, &bucket, request)
        .await?;
    Ok(xml_response(StatusCode::OK, render_delete_result(&outcome)))
}

#[derive(Debug, Deserialize)]
struct DeleteXml {
    #[serde(rename = "Quiet", default)]
    quiet: bool,
    #[serde(rename = "Object", default)]
    objects: Vec<ObjectIdentifierXml>,
}

#[derive(Debug, Deserialize)]
struct ObjectIdentifierXml {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "VersionId", default)]
    version_id: Option<String>,
}

/// Verify the body digest and parse a `<Delete>` document.
pub fn parse_delete_request(body: &[u8], content_md5: Option<&str>) -> Result<DeleteRequest, S3Error> {
    if body.is_empty() {
        return Err(S3Error::MissingRequestBody);
    }
    let digest = general_purpose::STANDARD.encode(md5::compute(body).0);
    if content_md5.map(str::trim) != Some(digest.as_str()) {
        return Err(S3Error::BadDigest);
    }

    let text = std::str::from_utf8(body).map_err(|_| S3Error::MalformedXml)?;
    let parsed: DeleteXml = quick_xml::de::from_str(text).map_err(|err| {
        debug!(error = %err, "unparsable delete request");
        S3Error::MalformedXml
    })?;
    Ok(DeleteRequest {
        quiet: parsed.quiet,
        entries: parsed
            .objects
            .into_iter()
            .map(|object| DeleteEntry {
                key: object.key,
                version_id: object.version_id.filter(|v| !v.is_empty()),
            })
            .collect(),
    })
}

/// `<DeleteResult>`; quiet responses list errors only.
pub fn render_delete_result(outcome: &MultiDeleteOutcome) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><DeleteResult xmlns="{S3_XMLNS}">"#
    );
    if !outcome.quiet {
        for deleted in &outcome.deleted {
            xml.push_str("<Deleted>");
            xml.push_str(&format!("<Key>{}</Key>", xml_escape(&deleted.key)));
            if let Some(version) = &deleted.version_id {
                xml.push_str(&format!("<VersionId>{}</VersionId>", xml_escape(version)));
            }
            if deleted.delete_marker {
                xml.push_str("<DeleteMarker>true</DeleteMarker>");
                if let Some(marker) = &deleted.delete_marker_version_id {
                    xml.push_str(&format!(
                        "<DeleteMarkerVersionId>{}</DeleteMarkerVersionId>",
                        xml_escape(marker)
                    ));
                }
            }
            xml.push_str("</Deleted>");
        }
    }
    for error in &outcome.errors {
        xml.push_str("<Error>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&error.key)));
        xml.push_str(&format!("<Code>{}</Code>", error.code));
        if let Some(version) = &error.version_id {
            xml.push_str(&format!("<VersionId>{}</VersionId>", xml_escape(version)));
        }
        xml.push_str(&format!("<Message>{}</Message>", xml_escape(&error.message)));
        xml.push_str("</Error>");
    }
    xml.push_str("</DeleteResult>");
    xml
}
