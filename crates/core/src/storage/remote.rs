//! Object-store adapter: issues ranged HTTP requests against an
//! S3-compatible endpoint and treats the remote `ETag` as the freshness
//! token. Listing uses the S3 `ListObjectsV2` XML contract with
//! `delimiter` passed straight through.

use super::{validate_key, FreshnessToken, SeekableStream, StorageAdapter};
use crate::error::{EngineError, Result};
use crate::model::{Listing, StorageObject};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, ETAG, RANGE};
use reqwest::Client;

/// Configuration for one bucket on an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

pub struct ObjectStoreAdapter {
    client: Client,
    config: ObjectStoreConfig,
}

impl ObjectStoreAdapter {
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.config.endpoint.trim_end_matches('/'), self.config.bucket, key)
    }

    /// Minimal SigV4-free auth: many S3-compatible endpoints used behind an
    /// internal proxy accept a static bearer credential. Real deployments
    /// swap this for a signing layer; the `StorageAdapter` contract above
    /// this function is unaffected either way.
    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.config.access_key.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.config.access_key, Some(&self.config.secret_key))
        }
    }
}

#[async_trait]
impl StorageAdapter for ObjectStoreAdapter {
    async fn list(&self, prefix: &str, delimiter: &str) -> Result<Listing> {
        validate_key(if prefix.is_empty() { "_" } else { prefix })
            .or_else(|_| if prefix.is_empty() { Ok(()) } else { Err(EngineError::Forbidden(prefix.to_string())) })?;

        let url = format!("{}/{}", self.config.endpoint.trim_end_matches('/'), self.config.bucket);
        let req = self
            .client
            .get(&url)
            .query(&[("list-type", "2"), ("prefix", prefix), ("delimiter", delimiter)]);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::Unavailable(format!("list {prefix}: HTTP {}", resp.status())));
        }
        let body = resp.text().await.map_err(|e| EngineError::Unavailable(e.to_string()))?;
        parse_list_bucket_result(&body)
    }

    async fn open(&self, key: &str) -> Result<Box<dyn SeekableStream>> {
        validate_key(key)?;
        let url = self.object_url(key);
        let req = self.client.head(&url);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(key.to_string()));
        }
        if !resp.status().is_success() {
            return Err(EngineError::Unavailable(format!("head {key}: HTTP {}", resp.status())));
        }
        let len: u64 = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| EngineError::Unavailable(format!("{key}: missing content-length")))?;
        let token = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim_matches('"')
            .to_string();

        Ok(Box::new(RemoteStream {
            client: self.client.clone(),
            url,
            len,
            token,
            auth: (self.config.access_key.clone(), self.config.secret_key.clone()),
        }))
    }

    async fn freshness(&self, key: &str) -> Result<FreshnessToken> {
        validate_key(key)?;
        let url = self.object_url(key);
        let req = self.client.head(&url);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(key.to_string()));
        }
        Ok(resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim_matches('"')
            .to_string())
    }
}

struct RemoteStream {
    client: Client,
    url: String,
    len: u64,
    token: FreshnessToken,
    auth: (String, String),
}

#[async_trait]
impl SeekableStream for RemoteStream {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let end_inclusive = offset + length - 1;
        let mut req = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={offset}-{end_inclusive}"));
        if !self.auth.0.is_empty() {
            req = req.basic_auth(&self.auth.0, Some(&self.auth.1));
        }
        let resp = req.send().await.map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::NotFound(self.url.clone()));
        }
        if !resp.status().is_success() {
            return Err(EngineError::Unavailable(format!("range read: HTTP {}", resp.status())));
        }
        let current_etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .trim_matches('"')
            .to_string();
        if !current_etag.is_empty() && current_etag != self.token {
            return Err(EngineError::Stale);
        }
        resp.bytes().await.map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    fn token(&self) -> &str {
        &self.token
    }
}

/// Parse the subset of an S3 `ListBucketResult` XML body this adapter
/// needs: `<Contents><Key>/<Size>/<LastModified>/<ETag>` and
/// `<CommonPrefixes><Prefix>`. Hand-rolled rather than pulling in a full
/// XML crate — the schema is fixed and small.
fn parse_list_bucket_result(body: &str) -> Result<Listing> {
    let mut listing = Listing::default();

    for prefix_block in tag_bodies(body, "CommonPrefixes") {
        if let Some(p) = tag_body(&prefix_block, "Prefix") {
            listing.folders.push(p);
        }
    }

    for content_block in tag_bodies(body, "Contents") {
        let key = tag_body(&content_block, "Key").unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        let size = tag_body(&content_block, "Size").and_then(|s| s.parse().ok()).unwrap_or(0);
        let last_modified_unix_ms = tag_body(&content_block, "LastModified")
            .and_then(|s| httpdate_or_rfc3339_to_ms(&s))
            .unwrap_or(0);
        let etag = tag_body(&content_block, "ETag").unwrap_or_default().trim_matches('"').to_string();
        listing.files.push(StorageObject { key, size, last_modified_unix_ms, etag });
    }

    Ok(listing)
}

fn tag_bodies(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        if let Some(end) = after.find(&close) {
            out.push(after[..end].to_string());
            rest = &after[end + close.len()..];
        } else {
            break;
        }
    }
    out
}

fn tag_body(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

fn httpdate_or_rfc3339_to_ms(s: &str) -> Option<i64> {
    // S3 reports RFC3339 timestamps; we only need a monotonically
    // comparable millisecond value, not a display format, so a coarse
    // parse (seconds resolution) is sufficient here.
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_list_bucket_result() {
        let xml = r#"
            <ListBucketResult>
                <CommonPrefixes><Prefix>data/</Prefix></CommonPrefixes>
                <Contents>
                    <Key>data/sample.h5</Key>
                    <Size>2048</Size>
                    <LastModified>2026-01-01T00:00:00.000Z</LastModified>
                    <ETag>"abc123"</ETag>
                </Contents>
            </ListBucketResult>
        "#;
        let listing = parse_list_bucket_result(xml).unwrap();
        assert_eq!(listing.folders, vec!["data/".to_string()]);
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].key, "data/sample.h5");
        assert_eq!(listing.files[0].etag, "abc123");
    }
}
