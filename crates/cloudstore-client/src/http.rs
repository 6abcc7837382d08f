//! S3 REST transport over reqwest

use crate::error::extract_xml_element;
use crate::transport::{ByteRange, ByteStream, Lister, Transport};
use crate::types::{CompletedPart, MultipartHandle, ObjectSummary, RemoteObject};
use crate::{ClientError, Config, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, Body, Client, Method, Response};
use std::collections::HashMap;
use tracing::{debug, instrument};
use url::Url;

/// Transport speaking the S3 REST API with bearer-token auth
pub struct S3HttpTransport {
    config: Config,
    http: Client,
}

impl S3HttpTransport {
    /// Create a transport with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let user_agent = config
            .user_agent
            .parse()
            .map_err(|_| ClientError::Config(format!("invalid user agent '{}'", config.user_agent)))?;
        headers.insert(header::USER_AGENT, user_agent);

        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self { config, http })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn url(&self, bucket: &str, key: Option<&str>) -> Result<Url> {
        let mut url = Url::parse(self.config.base_url())
            .map_err(|e| ClientError::Config(format!("invalid endpoint: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::Config("endpoint cannot be a base URL".to_string()))?;
            segments.pop_if_empty().push(bucket);
            if let Some(key) = key {
                segments.extend(key.split('/'));
            }
        }
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        headers: HashMap<String, String>,
        body: Option<Body>,
    ) -> Result<Response> {
        let mut req = self.http.request(method.clone(), url.clone());

        if !query.is_empty() {
            req = req.query(query);
        }

        if let Some(token) = &self.config.access_token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        for (k, v) in headers {
            req = req.header(k, v);
        }

        if let Some(body) = body {
            req = req.body(body);
        }

        debug!("Sending {} request to {}", method, url);
        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::from_s3_xml(&text, status.as_u16()));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for S3HttpTransport {
    #[instrument(skip(self, metadata))]
    async fn initiate_multipart(
        &self,
        bucket: &str,
        key: &str,
        metadata: &HashMap<String, String>,
        acl: Option<&str>,
    ) -> Result<MultipartHandle> {
        let mut headers: HashMap<String, String> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k), v.clone()))
            .collect();
        if let Some(acl) = acl {
            headers.insert("x-amz-acl".to_string(), acl.to_string());
        }

        let url = self.url(bucket, Some(key))?;
        let response = self
            .request(Method::POST, url, &[("uploads", String::new())], headers, None)
            .await?;
        let text = response.text().await?;

        let upload_id = extract_xml_element(&text, "UploadId")
            .ok_or_else(|| ClientError::InvalidResponse("Missing UploadId".to_string()))?;

        Ok(MultipartHandle {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            initiated: Utc::now(),
        })
    }

    #[instrument(skip(self, body), fields(upload_id = %handle.upload_id))]
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        body: ByteStream,
        length: u64,
    ) -> Result<String> {
        let url = self.url(&handle.bucket, Some(&handle.key))?;
        let query = [
            ("partNumber", part_number.to_string()),
            ("uploadId", handle.upload_id.clone()),
        ];
        let mut headers = HashMap::new();
        headers.insert(header::CONTENT_LENGTH.to_string(), length.to_string());

        let response = self
            .request(Method::PUT, url, &query, headers, Some(Body::wrap_stream(body)))
            .await?;

        etag_header(&response).ok_or_else(|| ClientError::InvalidResponse("Missing ETag".to_string()))
    }

    #[instrument(skip(self, parts), fields(upload_id = %handle.upload_id, parts = parts.len()))]
    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<String> {
        let mut xml = String::from("<CompleteMultipartUpload>");
        for part in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>\"{}\"</ETag></Part>",
                part.part_number, part.etag
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");

        let url = self.url(&handle.bucket, Some(&handle.key))?;
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/xml".to_string());
        let response = self
            .request(
                Method::POST,
                url,
                &[("uploadId", handle.upload_id.clone())],
                headers,
                Some(Body::from(xml)),
            )
            .await?;
        let text = response.text().await?;

        // Completion can fail after a 200 status line
        if text.contains("<Error>") {
            return Err(ClientError::from_s3_xml(&text, 500));
        }

        extract_xml_element(&text, "ETag")
            .map(|s| unquote_etag(&s))
            .ok_or_else(|| ClientError::InvalidResponse("Missing ETag".to_string()))
    }

    #[instrument(skip(self), fields(upload_id = %handle.upload_id))]
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<()> {
        let url = self.url(&handle.bucket, Some(&handle.key))?;
        self.request(
            Method::DELETE,
            url,
            &[("uploadId", handle.upload_id.clone())],
            HashMap::new(),
            None,
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteStream> {
        let url = self.url(bucket, Some(key))?;
        let mut headers = HashMap::new();
        if let Some((start, end)) = range {
            headers.insert(header::RANGE.to_string(), format!("bytes={}-{}", start, end));
        }
        let response = self.request(Method::GET, url, &[], headers, None).await?;
        Ok(response.bytes_stream().map_err(ClientError::Http).boxed())
    }

    #[instrument(skip(self))]
    async fn get_metadata(&self, bucket: &str, key: &str) -> Result<RemoteObject> {
        let url = self.url(bucket, Some(key))?;
        let response = match self
            .request(Method::HEAD, url, &[], HashMap::new(), None)
            .await
        {
            Err(e) if e.is_not_found() => {
                return Err(ClientError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            other => other?,
        };

        let headers = response.headers();
        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
            .map(|d| d.with_timezone(&Utc));

        let mut metadata = HashMap::new();
        for (name, value) in headers.iter() {
            if let Some(key) = name.as_str().strip_prefix("x-amz-meta-") {
                if let Ok(v) = value.to_str() {
                    metadata.insert(key.to_string(), v.to_string());
                }
            }
        }

        Ok(RemoteObject {
            metadata,
            content_length,
            etag: etag_header(&response),
            last_modified,
        })
    }

    #[instrument(skip(self), fields(upload_id = %dest.upload_id))]
    async fn copy_part_range(
        &self,
        source_bucket: &str,
        source_key: &str,
        dest: &MultipartHandle,
        part_number: u32,
        range: Option<ByteRange>,
    ) -> Result<String> {
        let source = self.url(source_bucket, Some(source_key))?;
        let mut headers = HashMap::new();
        headers.insert("x-amz-copy-source".to_string(), source.path().to_string());
        if let Some((start, end)) = range {
            headers.insert(
                "x-amz-copy-source-range".to_string(),
                format!("bytes={}-{}", start, end),
            );
        }

        let url = self.url(&dest.bucket, Some(&dest.key))?;
        let query = [
            ("partNumber", part_number.to_string()),
            ("uploadId", dest.upload_id.clone()),
        ];
        let response = self.request(Method::PUT, url, &query, headers, None).await?;
        let text = response.text().await?;
        extract_xml_element(&text, "ETag")
            .map(|s| unquote_etag(&s))
            .ok_or_else(|| ClientError::InvalidResponse("Missing ETag".to_string()))
    }

    #[instrument(skip(self))]
    async fn list_pending_multipart(
        &self,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<MultipartHandle>> {
        let mut handles = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut query = vec![("uploads", String::new())];
            if let Some(prefix) = prefix {
                query.push(("prefix", prefix.to_string()));
            }
            if let Some(marker) = &key_marker {
                query.push(("key-marker", marker.clone()));
            }
            if let Some(marker) = &upload_id_marker {
                query.push(("upload-id-marker", marker.clone()));
            }

            let url = self.url(bucket, None)?;
            let response = self
                .request(Method::GET, url, &query, HashMap::new(), None)
                .await?;
            let text = response.text().await?;
            handles.extend(parse_pending_uploads(&text, bucket));

            let truncated = extract_xml_element(&text, "IsTruncated").as_deref() == Some("true");
            if !truncated {
                return Ok(handles);
            }
            key_marker = extract_xml_element(&text, "NextKeyMarker");
            upload_id_marker = extract_xml_element(&text, "NextUploadIdMarker");
            if key_marker.is_none() {
                return Ok(handles);
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let url = self.url(bucket, Some(key))?;
        self.request(Method::DELETE, url, &[], HashMap::new(), None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Lister for S3HttpTransport {
    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2".to_string()), ("prefix", prefix.to_string())];
            if !recursive {
                query.push(("delimiter", "/".to_string()));
            }
            if let Some(token) = &token {
                query.push(("continuation-token", token.clone()));
            }

            let url = self.url(bucket, None)?;
            let response = self
                .request(Method::GET, url, &query, HashMap::new(), None)
                .await?;
            let text = response.text().await?;
            objects.extend(parse_list_objects(&text));

            token = extract_xml_element(&text, "NextContinuationToken");
            let truncated = extract_xml_element(&text, "IsTruncated").as_deref() == Some("true");
            if !truncated || token.is_none() {
                return Ok(objects);
            }
        }
    }
}

// ==================== Response Parsers ====================

fn unquote_etag(raw: &str) -> String {
    raw.replace("&quot;", "").trim_matches('"').to_string()
}

fn etag_header(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(unquote_etag)
}

/// Split an XML document into the bodies of every `<tag>...</tag>` element
fn xml_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut pos = 0;
    while let Some(start) = xml[pos..].find(&open) {
        let start = pos + start + open.len();
        match xml[start..].find(&close) {
            Some(end) => {
                blocks.push(&xml[start..start + end]);
                pos = start + end + close.len();
            }
            None => break,
        }
    }
    blocks
}

fn parse_rfc3339(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn parse_pending_uploads(xml: &str, bucket: &str) -> Vec<MultipartHandle> {
    xml_blocks(xml, "Upload")
        .into_iter()
        .filter_map(|block| {
            Some(MultipartHandle {
                bucket: bucket.to_string(),
                key: extract_xml_element(block, "Key")?,
                upload_id: extract_xml_element(block, "UploadId")?,
                initiated: parse_rfc3339(extract_xml_element(block, "Initiated"))?,
            })
        })
        .collect()
}

fn parse_list_objects(xml: &str) -> Vec<ObjectSummary> {
    xml_blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| {
            Some(ObjectSummary {
                key: extract_xml_element(block, "Key")?,
                size: extract_xml_element(block, "Size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                etag: extract_xml_element(block, "ETag").map(|s| unquote_etag(&s)),
                last_modified: parse_rfc3339(extract_xml_element(block, "LastModified")),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> S3HttpTransport {
        S3HttpTransport::new(Config::new(server.uri()).with_token("secret")).unwrap()
    }

    #[test]
    fn test_parse_pending_uploads() {
        let xml = r#"<ListMultipartUploadsResult>
  <Bucket>b</Bucket>
  <Upload><Key>logs/a</Key><UploadId>u1</UploadId><Initiated>2024-01-02T03:04:05.000Z</Initiated></Upload>
  <Upload><Key>logs/b</Key><UploadId>u2</UploadId><Initiated>2024-02-02T03:04:05.000Z</Initiated></Upload>
</ListMultipartUploadsResult>"#;
        let handles = parse_pending_uploads(xml, "b");
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].key, "logs/a");
        assert_eq!(handles[1].upload_id, "u2");
    }

    #[test]
    fn test_parse_list_objects() {
        let xml = r#"<ListBucketResult>
  <Contents><Key>a.txt</Key><Size>12</Size><ETag>&quot;abc&quot;</ETag></Contents>
  <Contents><Key>b.txt</Key><Size>3</Size></Contents>
</ListBucketResult>"#;
        let objects = parse_list_objects(xml);
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].etag.as_deref(), Some("abc"));
        assert_eq!(objects[1].size, 3);
    }

    #[tokio::test]
    async fn test_initiate_sends_metadata_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bucket/dir/file.bin"))
            .and(query_param("uploads", ""))
            .and(header_is("authorization", "Bearer secret"))
            .and(header_is("x-amz-meta-s3tool-version", "0.2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<InitiateMultipartUploadResult><UploadId>up-1</UploadId></InitiateMultipartUploadResult>",
            ))
            .mount(&server)
            .await;

        let mut metadata = HashMap::new();
        metadata.insert("s3tool-version".to_string(), "0.2".to_string());
        let handle = transport(&server)
            .initiate_multipart("bucket", "dir/file.bin", &metadata, None)
            .await
            .unwrap();
        assert_eq!(handle.upload_id, "up-1");
        assert_eq!(handle.key, "dir/file.bin");
    }

    #[tokio::test]
    async fn test_upload_part_returns_unquoted_etag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/key"))
            .and(query_param("partNumber", "2"))
            .and(query_param("uploadId", "up-1"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"d41d8cd98f00b204e9800998ecf8427e\""))
            .mount(&server)
            .await;

        let handle = MultipartHandle {
            bucket: "bucket".into(),
            key: "key".into(),
            upload_id: "up-1".into(),
            initiated: Utc::now(),
        };
        let body = futures::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        let etag = transport(&server)
            .upload_part(&handle, 2, body, 3)
            .await
            .unwrap();
        assert_eq!(etag, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test_log::test(tokio::test)]
    async fn test_get_range_sends_range_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/key"))
            .and(header_is("range", "bytes=10-19"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"0123456789".to_vec()))
            .mount(&server)
            .await;

        let stream = transport(&server)
            .get_range("bucket", "key", Some((10, 19)))
            .await
            .unwrap();
        let chunks: Vec<Result<Bytes>> = stream.collect().await;
        let body: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn test_slow_down_maps_to_throttling() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(503).set_body_string(
                "<Error><Code>SlowDown</Code><Message>Please reduce your request rate.</Message></Error>",
            ))
            .mount(&server)
            .await;

        let err = transport(&server).delete_object("b", "k").await.unwrap_err();
        assert!(err.is_throttling());
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test]
    async fn test_head_missing_object_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = transport(&server).get_metadata("b", "k").await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound { .. }));
    }
}
