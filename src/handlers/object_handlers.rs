//! HTTP handlers for object operations and multipart uploads.
//! Object bodies stream through without being buffered in memory.

use super::{Requester, S3_XMLNS, header_str, xml_response};
use crate::{
    errors::{AppError, S3Error, xml_escape},
    keys::PartNumber,
    models::{multipart::Initiator, object::ObjectMetadataRecord},
    services::{
        StorageService,
        copy_part::{CopyConditions, CopyPartRequest, parse_copy_source_range},
        multi_delete::{DeleteEntry, DeleteRequest},
        object_service::PutObjectRequest,
    },
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::SecondsFormat;
use futures::StreamExt;
use std::{collections::HashMap, io};

const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";
const COPY_SOURCE_RANGE_HEADER: &str = "x-amz-copy-source-range";
const VERSION_ID_HEADER: &str = "x-amz-version-id";

type QueryMap = HashMap<String, String>;

/// PUT `/{bucket}/{*key}`: upload an object, or copy a part when the
/// request names an upload, a part number and a copy source.
pub async fn object_put(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<QueryMap>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let copy_source = header_str(&headers, COPY_SOURCE_HEADER).map(str::to_string);
    match (query.get("uploadId"), query.get("partNumber"), copy_source.as_deref()) {
        (Some(upload_id), Some(part_number), Some(source)) => {
            let (source_bucket, source_key, source_version_id) = parse_copy_source(source)?;
            let range = header_str(&headers, COPY_SOURCE_RANGE_HEADER)
                .map(parse_copy_source_range)
                .transpose()?;
            let request = CopyPartRequest {
                requester,
                source_bucket,
                source_key,
                source_version_id,
                range,
                conditions: copy_conditions(&headers),
                dest_bucket: bucket,
                dest_key: key,
                upload_id: upload_id.clone(),
                part_number: PartNumber::parse(part_number).map_err(S3Error::from)?,
            };
            copy_part(service, request).await
        }
        (Some(_), Some(_), None) => Err(S3Error::NotImplemented("UploadPart".into()).into()),
        (_, _, Some(_)) => Err(S3Error::NotImplemented("CopyObject".into()).into()),
        _ => upload_object(service, requester, bucket, key, headers, body).await,
    }
}

async fn upload_object(
    service: StorageService,
    requester: Initiator,
    bucket: String,
    key: String,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let content_length = header_str(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok());
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let out = service
        .objects
        .put_object(PutObjectRequest {
            bucket,
            key,
            requester,
            content_type: header_str(&headers, header::CONTENT_TYPE.as_str()).map(str::to_string),
            content_length,
            content_md5: header_str(&headers, "content-md5").map(str::to_string),
            body: stream,
        })
        .await?;

    let mut response = Response::new(Body::empty());
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", out.etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    if let Some(version) = out.version_id.as_deref() {
        insert_header(response.headers_mut(), VERSION_ID_HEADER, version);
    }
    Ok(response)
}

async fn copy_part(service: StorageService, request: CopyPartRequest) -> Result<Response, AppError> {
    let out = service.copy_part.copy_part(request).await?;
    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<CopyPartResult xmlns="{}">"#,
            r#"<LastModified>{}</LastModified>"#,
            r#"<ETag>"{}"</ETag>"#,
            r#"</CopyPartResult>"#
        ),
        S3_XMLNS,
        out.last_modified.to_rfc3339_opts(SecondsFormat::Millis, true),
        out.etag
    );
    let mut response = xml_response(StatusCode::OK, xml);
    let headers = response.headers_mut();
    if let Some(version) = out.source_version_id.as_deref() {
        insert_header(headers, "x-amz-copy-source-version-id", version);
    }
    if let Some(sse) = &out.sse {
        insert_header(headers, "x-amz-server-side-encryption", &sse.algorithm);
    }
    Ok(response)
}

/// GET `/{bucket}/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<QueryMap>,
) -> Result<Response, AppError> {
    let version = query.get("versionId").map(String::as_str);
    let (meta, stream) = service
        .objects
        .get_object(&requester.id, &bucket, &key, version)
        .await?;

    let mut response = Response::new(Body::from_stream(stream));
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// POST `/{bucket}/{*key}?uploads`: start a multipart upload.
pub async fn object_post(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<QueryMap>,
) -> Result<Response, AppError> {
    if !query.contains_key("uploads") {
        return Err(S3Error::NotImplemented("object POST without ?uploads".into()).into());
    }
    let overview = service
        .objects
        .initiate_multipart_upload(&bucket, &key, requester)
        .await?;

    let xml = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<InitiateMultipartUploadResult xmlns="{}">"#,
            r#"<Bucket>{}</Bucket><Key>{}</Key><UploadId>{}</UploadId>"#,
            r#"</InitiateMultipartUploadResult>"#
        ),
        S3_XMLNS,
        xml_escape(&bucket),
        xml_escape(&key),
        xml_escape(&overview.upload_id)
    );
    Ok(xml_response(StatusCode::OK, xml))
}

/// DELETE `/{bucket}/{*key}`: abort an upload with `?uploadId=`, otherwise
/// delete the object (or the version named by `?versionId=`).
pub async fn object_delete(
    State(service): State<StorageService>,
    Requester(requester): Requester,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<QueryMap>,
) -> Result<Response, AppError> {
    if let Some(upload_id) = query.get("uploadId") {
        service
            .objects
            .abort_multipart_upload(&bucket, &key, upload_id, &requester.id)
            .await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let request = DeleteRequest {
        quiet: false,
        entries: vec![DeleteEntry {
            key,
            version_id: query.get("versionId").cloned(),
        }],
    };
    let mut outcome = service
        .multi_delete
        .delete_objects(&requester, &bucket, request)
        .await?;
    if let Some(failed) = outcome.errors.pop() {
        return Err(AppError::new(failed.status, failed.code, failed.message));
    }

    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Some(deleted) = outcome.deleted.pop() {
        let headers = response.headers_mut();
        if deleted.delete_marker {
            insert_header(headers, "x-amz-delete-marker", "true");
        }
        if let Some(version) = deleted
            .delete_marker_version_id
            .as_deref()
            .or(deleted.version_id.as_deref())
        {
            insert_header(headers, VERSION_ID_HEADER, version);
        }
    }
    Ok(response)
}

/// Split `x-amz-copy-source` (`[/]bucket/key[?versionId=id]`) into its parts.
pub fn parse_copy_source(raw: &str) -> Result<(String, String, Option<String>), S3Error> {
    let source = raw.strip_prefix('/').unwrap_or(raw);
    let (path, version_id) = match source.split_once('?') {
        Some((path, query)) => (
            path,
            query
                .split('&')
                .find_map(|param| param.strip_prefix("versionId="))
                .map(str::to_string),
        ),
        None => (source, None),
    };
    let invalid = || S3Error::InvalidArgument(format!("invalid copy source `{raw}`"));
    let (bucket, key) = path.split_once('/').ok_or_else(invalid)?;
    if bucket.is_empty() || key.is_empty() {
        return Err(invalid());
    }
    let key = percent_encoding::percent_decode_str(key)
        .decode_utf8()
        .map_err(|_| invalid())?
        .into_owned();
    Ok((bucket.to_string(), key, version_id))
}

fn copy_conditions(headers: &HeaderMap) -> CopyConditions {
    let get = |name: &str| header_str(headers, name).map(str::to_string);
    CopyConditions {
        if_match: get("x-amz-copy-source-if-match"),
        if_none_match: get("x-amz-copy-source-if-none-match"),
        if_modified_since: get("x-amz-copy-source-if-modified-since"),
        if_unmodified_since: get("x-amz-copy-source-if-unmodified-since"),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn set_object_headers(headers: &mut HeaderMap, meta: &ObjectMetadataRecord) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.content_length));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.content_md5)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    if let Some(version) = meta.version_id.as_deref() {
        insert_header(headers, VERSION_ID_HEADER, version);
    }
    if let Some(sse) = &meta.sse {
        insert_header(headers, "x-amz-server-side-encryption", &sse.algorithm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_forms() {
        assert_eq!(
            parse_copy_source("/src/dir/my%20file.txt").unwrap(),
            ("src".into(), "dir/my file.txt".into(), None)
        );
        assert_eq!(
            parse_copy_source("src/k?versionId=abc").unwrap(),
            ("src".into(), "k".into(), Some("abc".into()))
        );
        for bad in ["src", "/src/", "/k"] {
            assert!(parse_copy_source(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn copy_condition_headers_are_collected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-copy-source-if-match", HeaderValue::from_static("\"abc\""));
        let conditions = copy_conditions(&headers);
        assert_eq!(conditions.if_match.as_deref(), Some("\"abc\""));
        assert!(conditions.if_none_match.is_none());
    }
}
