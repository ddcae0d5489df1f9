//! Generic file delivery with `Content-Disposition: attachment`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::infra::content::ContentFile;

use super::{HttpError, HttpState};

pub async fn download(
    State(state): State<HttpState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Response {
    match state.content.read(&path).await {
        Ok(file) => attachment_response(file, &headers),
        Err(err) => HttpError::from(err).into_response(),
    }
}

fn attachment_response(file: ContentFile, request_headers: &HeaderMap) -> Response {
    let modified = file.modified.map(truncate_to_seconds);
    if let Some(modified) = modified
        && not_modified_since(request_headers, modified)
    {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        insert_last_modified(response.headers_mut(), modified);
        return response;
    }

    let mime = mime_guess::from_path(&file.path).first_or_octet_stream();
    let disposition = content_disposition(file.file_name().unwrap_or("download"));
    let length = file.bytes.len();

    let mut response = Response::new(Body::from(file.bytes));
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&length.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(modified) = modified {
        insert_last_modified(headers, modified);
    }
    response
}

/// `attachment; filename="<name>"` with quotes and non-ASCII replaced.
fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

fn not_modified_since(headers: &HeaderMap, modified: SystemTime) -> bool {
    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .is_some_and(|since| since >= modified)
}

fn insert_last_modified(headers: &mut HeaderMap, modified: SystemTime) {
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(modified)) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}

/// HTTP dates carry whole seconds.
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| UNIX_EPOCH + Duration::from_secs(elapsed.as_secs()))
        .unwrap_or(UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bytes::Bytes;

    use super::*;

    fn file(modified: Option<SystemTime>) -> ContentFile {
        ContentFile {
            path: PathBuf::from("reports/q3 \"final\".pdf"),
            bytes: Bytes::from_static(b"%PDF"),
            modified,
        }
    }

    #[test]
    fn attachments_carry_disposition_and_type() {
        let response = attachment_response(file(None), &HeaderMap::new());
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(
            headers.get(header::CONTENT_DISPOSITION),
            Some(&HeaderValue::from_static(
                "attachment; filename=\"q3 _final_.pdf\""
            ))
        );
        assert_eq!(
            headers.get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/pdf"))
        );
        assert_eq!(
            headers.get(header::CONTENT_LENGTH),
            Some(&HeaderValue::from_static("4"))
        );
    }

    #[test]
    fn if_modified_since_yields_304() {
        let modified = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut request = HeaderMap::new();
        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 14 Nov 2023 22:13:20 GMT"),
        );
        let response = attachment_response(file(Some(modified)), &request);
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        request.insert(
            header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Tue, 14 Nov 2023 22:13:19 GMT"),
        );
        let response = attachment_response(file(Some(modified)), &request);
        assert_eq!(response.status(), StatusCode::OK);
    }
}
