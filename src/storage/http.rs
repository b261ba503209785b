//! HTTP object store
//!
//! Path-style access to an S3-compatible endpoint using reqwest. A single
//! PUT replaces an object atomically on such stores.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ObjectStore;
use crate::error::{BspError, Result};

/// Configuration for the HTTP store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpStoreConfig {
    /// Endpoint URL
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Attempts for idempotent reads
    pub read_retries: u32,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".into(),
            bucket: "bsp-checkpoints".into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(300),
            read_retries: 3,
        }
    }
}

/// Object store over HTTP
pub struct HttpObjectStore {
    client: Client,
    config: HttpStoreConfig,
}

fn storage_error(op: &str, key: &str, detail: impl std::fmt::Display) -> BspError {
    BspError::StorageError {
        message: format!("{} failed for {}: {}", op, key, detail),
    }
}

/// Text of every `<tag>` element in a listing response
fn element_values(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    body.split(open.as_str())
        .skip(1)
        .filter_map(|part| part.find(close.as_str()).map(|end| part[..end].to_string()))
        .collect()
}

impl HttpObjectStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| BspError::StorageError {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client, config })
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), self.config.bucket)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_url(), key.trim_start_matches('/'))
    }

    async fn get_once(&self, key: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get(self.object_url(key))
            .send()
            .await
            .map_err(|e| storage_error("Get object", key, e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(BspError::ObjectNotFound { key: key.into() });
        }
        if !resp.status().is_success() {
            return Err(storage_error("Get object", key, resp.status()));
        }
        resp.bytes()
            .await
            .map_err(|e| storage_error("Read body", key, e))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let retries = self.config.read_retries.max(1);
        let mut attempt = 0;
        loop {
            match self.get_once(key).await {
                Ok(data) => return Ok(data),
                Err(e @ BspError::ObjectNotFound { .. }) => return Err(e),
                Err(e) if attempt + 1 >= retries => return Err(e),
                Err(e) => {
                    warn!("Get attempt {}/{} for {} failed: {}", attempt + 1, retries, key, e);
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn put_object(&self, key: &str, data: Bytes) -> Result<()> {
        let len = data.len();
        let resp = self
            .client
            .put(self.object_url(key))
            .body(data)
            .send()
            .await
            .map_err(|e| storage_error("Put object", key, e))?;

        if !resp.status().is_success() {
            return Err(storage_error("Put object", key, resp.status()));
        }
        debug!("Put {} complete ({} bytes)", key, len);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.object_url(key))
            .send()
            .await
            .map_err(|e| storage_error("Delete object", key, e))?;

        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(storage_error("Delete object", key, resp.status()));
        }
        debug!("Deleted {}", key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut query = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(token) = continuation.as_deref() {
                query.push(("continuation-token", token));
            }
            let resp = self
                .client
                .get(self.bucket_url())
                .query(&query)
                .send()
                .await
                .map_err(|e| storage_error("List objects", prefix, e))?;

            if !resp.status().is_success() {
                return Err(storage_error("List objects", prefix, resp.status()));
            }
            let body = resp
                .text()
                .await
                .map_err(|e| storage_error("Read list response", prefix, e))?;

            keys.extend(element_values(&body, "Key"));
            let truncated = element_values(&body, "IsTruncated")
                .first()
                .is_some_and(|value| value.trim() == "true");
            if !truncated {
                break;
            }
            match element_values(&body, "NextContinuationToken").into_iter().next() {
                Some(token) => {
                    debug!("List {} continues after {} keys", prefix, keys.len());
                    continuation = Some(token);
                }
                None => {
                    return Err(storage_error(
                        "List objects",
                        prefix,
                        "truncated listing without a continuation token",
                    ))
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.object_url(key))
            .send()
            .await
            .map_err(|e| storage_error("Head object", key, e))?;
        Ok(resp.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> HttpObjectStore {
        HttpObjectStore::new(HttpStoreConfig {
            endpoint: server.uri(),
            bucket: "ckpt".into(),
            read_retries: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ckpt/job/4.finalized"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 0, 0, 1]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ckpt/job/5.finalized"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = store_for(&server);
        let data = store.get_object("job/4.finalized").await.unwrap();
        assert_eq!(data.as_ref(), &[0, 0, 0, 1]);
        let missing = store.get_object("job/5.finalized").await;
        assert!(matches!(missing, Err(BspError::ObjectNotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_parses_keys() {
        let server = MockServer::start().await;
        let body = "<ListBucketResult><Contents><Key>job/9.finalized</Key></Contents>\
                    <Contents><Key>job/2.finalized</Key></Contents></ListBucketResult>";
        Mock::given(method("GET"))
            .and(path("/ckpt"))
            .and(query_param("prefix", "job/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let keys = store_for(&server).list_objects("job/").await.unwrap();
        assert_eq!(keys, vec!["job/2.finalized", "job/9.finalized"]);
    }

    #[tokio::test]
    async fn test_list_follows_continuation_token() {
        let server = MockServer::start().await;
        let first = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                     <Contents><Key>job/4.finalized</Key></Contents>\
                     <NextContinuationToken>page-2</NextContinuationToken></ListBucketResult>";
        let second = "<ListBucketResult><IsTruncated>false</IsTruncated>\
                      <Contents><Key>job/0.finalized</Key></Contents>\
                      <Contents><Key>job/2.finalized</Key></Contents></ListBucketResult>";
        Mock::given(method("GET"))
            .and(path("/ckpt"))
            .and(query_param("continuation-token", "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(second))
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ckpt"))
            .and(query_param("prefix", "job/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first))
            .expect(1)
            .mount(&server)
            .await;

        let keys = store_for(&server).list_objects("job/").await.unwrap();
        assert_eq!(
            keys,
            vec!["job/0.finalized", "job/2.finalized", "job/4.finalized"]
        );
    }

    #[tokio::test]
    async fn test_truncated_list_without_token_fails() {
        let server = MockServer::start().await;
        let body = "<ListBucketResult><IsTruncated>true</IsTruncated>\
                    <Contents><Key>job/4.finalized</Key></Contents></ListBucketResult>";
        Mock::given(method("GET"))
            .and(path("/ckpt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let result = store_for(&server).list_objects("job/").await;
        assert!(matches!(result, Err(BspError::StorageError { .. })));
    }

    #[tokio::test]
    async fn test_put_failure_is_storage_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = store_for(&server)
            .put_object("job/1.finalized", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(BspError::StorageError { .. })));
    }
}
