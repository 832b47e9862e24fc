//! tus 1.0.0 header vocabulary and response interpretation

use super::ClientError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

/// Protocol version sent in every request
pub const TUS_VERSION: &str = "1.0.0";

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_METADATA: &str = "upload-metadata";

/// Content type required for PATCH bodies
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Encode `Upload-Metadata`: comma separated `key base64(value)` pairs
pub fn encode_metadata<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(key, value)| format!("{} {}", key, STANDARD.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

/// Read the `Upload-Offset` header
pub fn parse_offset(headers: &HeaderMap) -> Result<u64, ClientError> {
    let raw = headers
        .get(UPLOAD_OFFSET)
        .ok_or_else(|| ClientError::ProtocolError("Missing Upload-Offset header".into()))?;

    raw.to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| ClientError::ProtocolError(format!("Invalid Upload-Offset header: {:?}", raw)))
}

/// Map an unexpected response status to an error
///
/// `404`/`410` mean the resource is gone. `409`, `423`, `429` and `5xx` are
/// transient. Any other client error is a permanent rejection.
pub fn classify_status(status: StatusCode, context: &str) -> ClientError {
    match status.as_u16() {
        404 | 410 => ClientError::ResourceNotFound(format!("{} returned {}", context, status)),
        409 | 423 | 429 => {
            ClientError::TransportError(format!("{} returned {}", context, status))
        }
        400..=499 => ClientError::ServerRejected {
            status: status.as_u16(),
            message: format!("{} rejected", context),
        },
        500..=599 => ClientError::TransportError(format!("{} returned {}", context, status)),
        _ => ClientError::ProtocolError(format!("{} returned unexpected {}", context, status)),
    }
}
