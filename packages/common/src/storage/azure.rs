use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::error::StorageError;
use super::traits::{BoxReader, ObjectInfo, ObjectStore, validate_key};

/// Azure Blob Storage REST API version used for signing.
const API_VERSION: &str = "2021-08-06";

/// Azure-Blob-backed object store for production deployments.
///
/// Talks the Blob REST API directly with SharedKey request signing;
/// `presign` issues a read-only service SAS. Works against Azurite when
/// `endpoint` points at the emulator.
pub struct AzureObjectStore {
    account: String,
    key: Vec<u8>,
    container: String,
    endpoint: String,
    client: reqwest::Client,
}

impl AzureObjectStore {
    /// Create a store from account credentials.
    ///
    /// `key` is the base64-encoded account key as shown in the portal;
    /// `endpoint` is the blob endpoint without a trailing slash, e.g.
    /// `https://{account}.blob.core.windows.net` or an Azurite URL.
    pub fn new(
        account: impl Into<String>,
        key: &str,
        container: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let key = BASE64
            .decode(key)
            .map_err(|e| StorageError::PermissionDenied(format!("invalid account key: {e}")))?;

        Ok(Self {
            account: account.into(),
            key,
            container: container.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.container, key)
    }

    fn canonicalized_resource(&self, key: &str) -> String {
        format!("/{}/{}/{}", self.account, self.container, key)
    }

    fn hmac_base64(&self, string_to_sign: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .expect("HMAC accepts any key length");
        mac.update(string_to_sign.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    /// Build the SharedKey `Authorization` header value for a blob request.
    fn authorization(
        &self,
        method: &Method,
        content_length: u64,
        content_type: &str,
        x_ms_headers: &[(&str, &str)],
        key: &str,
    ) -> String {
        let string_to_sign = shared_key_string_to_sign(
            method,
            content_length,
            content_type,
            x_ms_headers,
            &self.canonicalized_resource(key),
        );
        format!("SharedKey {}:{}", self.account, self.hmac_base64(&string_to_sign))
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        content_length: u64,
        content_type: &str,
        body: Option<reqwest::Body>,
    ) -> Result<reqwest::Response, StorageError> {
        validate_key(key)?;

        let date = now_rfc1123();
        let mut x_ms: Vec<(&str, &str)> = vec![("x-ms-date", &date), ("x-ms-version", API_VERSION)];
        if method == Method::PUT && body.is_some() {
            x_ms.insert(0, ("x-ms-blob-type", "BlockBlob"));
        }
        x_ms.sort_by(|a, b| a.0.cmp(b.0));

        let auth = self.authorization(&method, content_length, content_type, &x_ms, key);

        let mut headers = HeaderMap::new();
        for (name, value) in &x_ms {
            headers.insert(
                *name,
                HeaderValue::from_str(value)
                    .map_err(|e| StorageError::Unavailable(format!("bad header: {e}")))?,
            );
        }
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|e| StorageError::Unavailable(format!("bad header: {e}")))?,
        );
        if !content_type.is_empty() {
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .map_err(|e| StorageError::Unavailable(format!("bad header: {e}")))?,
            );
        }

        let mut request = self
            .client
            .request(method, self.blob_url(key))
            .headers(headers);
        if let Some(body) = body {
            request = request
                .header(reqwest::header::CONTENT_LENGTH, content_length)
                .body(body);
        }

        request
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("blob request failed: {e}")))
    }
}

/// Assemble the SharedKey string-to-sign for a blob operation.
///
/// Unused standard headers sign as empty lines per the Blob REST contract.
fn shared_key_string_to_sign(
    method: &Method,
    content_length: u64,
    content_type: &str,
    x_ms_headers: &[(&str, &str)],
    canonicalized_resource: &str,
) -> String {
    let length_field = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let canonicalized_headers: String = x_ms_headers
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();

    format!(
        "{verb}\n\n\n{length}\n\n{content_type}\n\n\n\n\n\n\n{headers}{resource}",
        verb = method.as_str(),
        length = length_field,
        content_type = content_type,
        headers = canonicalized_headers,
        resource = canonicalized_resource,
    )
}

/// Assemble the service-SAS string-to-sign for a read-only blob grant.
fn sas_string_to_sign(
    canonicalized_resource: &str,
    start: &str,
    expiry: &str,
) -> String {
    // Fields in signing order: sp, st, se, canonicalized resource, si, sip,
    // spr, sv, sr, snapshot, ses, rscc, rscd, rsce, rscl, rsct.
    format!(
        "r\n{start}\n{expiry}\n{canonicalized_resource}\n\n\nhttps\n{API_VERSION}\nb\n\n\n\n\n\n"
    )
}

fn now_rfc1123() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn map_status(status: StatusCode, key: &str) -> StorageError {
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(key.to_string()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            StorageError::Conflict(format!("{key}: {status}"))
        }
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
            StorageError::PermissionDenied(format!("{key}: {status}"))
        }
        StatusCode::INSUFFICIENT_STORAGE => {
            StorageError::QuotaExceededUpstream(format!("{key}: {status}"))
        }
        other => StorageError::Unavailable(format!("{key}: unexpected status {other}")),
    }
}

#[async_trait]
impl ObjectStore for AzureObjectStore {
    async fn put(
        &self,
        key: &str,
        reader: BoxReader,
        length: u64,
        mime_hint: Option<&str>,
    ) -> Result<(), StorageError> {
        let content_type = mime_hint.unwrap_or("application/octet-stream");
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));

        let response = self
            .send(Method::PUT, key, length, content_type, Some(body))
            .await?;

        if response.status() == StatusCode::CREATED {
            debug!(key, length, "uploaded blob");
            Ok(())
        } else {
            Err(map_status(response.status(), key))
        }
    }

    async fn get(&self, key: &str) -> Result<BoxReader, StorageError> {
        let response = self.send(Method::GET, key, 0, "", None).await?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), key));
        }

        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let response = self.send(Method::DELETE, key, 0, "", None).await?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            other => Err(map_status(other, key)),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectInfo, StorageError> {
        let response = self.send(Method::HEAD, key, 0, "", None).await?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), key));
        }

        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let modified = headers
            .get(reqwest::header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let etag = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(ObjectInfo {
            size,
            modified,
            etag,
        })
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        validate_key(key)?;

        let start = Utc::now() - chrono::Duration::minutes(5);
        let expiry = Utc::now()
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StorageError::InvalidKey(format!("ttl out of range: {e}")))?;
        let start = start.to_rfc3339_opts(SecondsFormat::Secs, true);
        let expiry = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);

        let canonicalized = format!("/blob/{}/{}/{}", self.account, self.container, key);
        let signature = self.hmac_base64(&sas_string_to_sign(&canonicalized, &start, &expiry));

        Ok(format!(
            "{url}?sv={API_VERSION}&spr=https&st={st}&se={se}&sr=b&sp=r&sig={sig}",
            url = self.blob_url(key),
            st = urlencode(&start),
            se = urlencode(&expiry),
            sig = urlencode(&signature),
        ))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let date = now_rfc1123();
        let mut x_ms: Vec<(&str, &str)> = vec![("x-ms-date", &date), ("x-ms-version", API_VERSION)];
        x_ms.sort_by(|a, b| a.0.cmp(b.0));

        // List Blobs signs the container resource plus the query parameters
        // in canonical order.
        let resource = format!(
            "/{}/{}\ncomp:list\nprefix:{}\nrestype:container",
            self.account, self.container, prefix
        );
        let string_to_sign =
            shared_key_string_to_sign(&Method::GET, 0, "", &x_ms, &resource);
        let auth = format!("SharedKey {}:{}", self.account, self.hmac_base64(&string_to_sign));

        let url = format!(
            "{}/{}?restype=container&comp=list&prefix={}",
            self.endpoint,
            self.container,
            urlencode(prefix)
        );

        let response = self
            .client
            .get(url)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header(reqwest::header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(format!("list request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(map_status(response.status(), prefix));
        }

        let body = response
            .text()
            .await
            .map_err(|e| StorageError::Unavailable(format!("list body read failed: {e}")))?;

        Ok(parse_blob_names(&body))
    }
}

/// Pull `<Name>` values out of a List Blobs XML response.
///
/// The response shape is stable and flat enough that a scanner beats
/// pulling in an XML dependency.
fn parse_blob_names(xml: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<Name>") {
        let after = &rest[start + "<Name>".len()..];
        let Some(end) = after.find("</Name>") else {
            break;
        };
        names.push(after[..end].to_string());
        rest = &after[end..];
    }
    names
}

/// Percent-encode a query value (RFC 3986 unreserved set).
fn urlencode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}
