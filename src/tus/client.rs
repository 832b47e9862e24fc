//! HTTP implementation of the tus wire protocol

use super::protocol::{
    classify_status, encode_metadata, parse_offset, OFFSET_OCTET_STREAM, TUS_RESUMABLE,
    TUS_VERSION, UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
};
use super::{ClientError, ProgressCallback, RangeHandle, RetryPolicy, Transport, UploadResource};
use crate::config::TusConfig;
use crate::metrics;
use crate::store::StoredResource;
use crate::upload::UploadableFile;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// tus client configuration
#[derive(Debug, Clone)]
pub struct TusClientConfig {
    pub endpoint: String,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub progress_step: usize,
    pub headers: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
}

impl TusClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::from(&TusConfig::with_endpoint(endpoint))
    }
}

impl From<&TusConfig> for TusClientConfig {
    fn from(config: &TusConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            chunk_size: config.chunk_size,
            retry: RetryPolicy::from_millis(&config.retry_delays_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            progress_step: config.progress_step_bytes,
            headers: config.headers.clone(),
            metadata: config.metadata.clone(),
        }
    }
}

/// tus HTTP client
///
/// Cheap to clone; each range transfer runs on a task holding its own clone.
#[derive(Clone)]
pub struct TusClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: TusClientConfig,
    endpoint: Url,
    default_headers: HeaderMap,
    http: reqwest::Client,
}

impl TusClient {
    /// Create a new tus client
    pub fn new(config: TusClientConfig) -> Result<Self, ClientError> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            ClientError::ConfigError(format!("Invalid endpoint '{}': {}", config.endpoint, e))
        })?;

        if config.chunk_size == 0 || config.progress_step == 0 {
            return Err(ClientError::ConfigError(
                "chunk_size and progress_step must be greater than zero".into(),
            ));
        }

        let mut default_headers = HeaderMap::new();
        default_headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::ConfigError(format!("Invalid header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::ConfigError(format!("Invalid header value: {}", e)))?;
            default_headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::ConfigError(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                endpoint,
                default_headers,
                http,
            }),
        })
    }

    pub fn config(&self) -> &TusClientConfig {
        &self.inner.config
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.inner
            .http
            .request(method, url)
            .headers(self.inner.default_headers.clone())
    }

    fn resource_url(resource: &UploadResource) -> Result<Url, ClientError> {
        Url::parse(&resource.url).map_err(|e| {
            ClientError::ProtocolError(format!("Invalid resource URL '{}': {}", resource.url, e))
        })
    }

    /// Create a new upload resource for `file`
    #[tracing::instrument(
        name = "tus.create",
        skip(self, file),
        fields(
            upload.file = %file.name(),
            upload.bytes = file.size(),
            tus.location = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn create(&self, file: &dyn UploadableFile) -> Result<UploadResource, ClientError> {
        let mut metadata: Vec<(&str, &str)> =
            vec![("filename", file.name()), ("filetype", file.mime_type())];
        metadata.extend(
            self.inner
                .config
                .metadata
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let upload_metadata = encode_metadata(metadata);
        let size = file.size();

        let response = self
            .inner
            .config
            .retry
            .run("tus.create", |_| {
                let request = self
                    .request(Method::POST, self.inner.endpoint.clone())
                    .header(UPLOAD_LENGTH, size)
                    .header(UPLOAD_METADATA, upload_metadata.as_str())
                    .header(CONTENT_LENGTH, 0);
                send_checked(request, &[StatusCode::CREATED, StatusCode::OK], "POST")
            })
            .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::ProtocolError("Missing Location header".into()))?;

        let url = self.inner.endpoint.join(location).map_err(|e| {
            ClientError::ProtocolError(format!("Invalid Location header '{}': {}", location, e))
        })?;

        let span = tracing::Span::current();
        span.record("tus.location", url.as_str());
        span.record("http.status_code", response.status().as_u16());

        tracing::info!(location = %url, bytes = size, "Created upload resource");

        Ok(UploadResource {
            url: url.to_string(),
            received_bytes: 0,
        })
    }

    /// Query the server offset of `resource`
    #[tracing::instrument(
        name = "tus.head",
        skip(self, resource),
        fields(
            tus.resource = %resource.url,
            tus.offset = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    pub async fn head(&self, resource: &UploadResource) -> Result<u64, ClientError> {
        let url = Self::resource_url(resource)?;

        let response = self
            .inner
            .config
            .retry
            .run("tus.head", |_| {
                let request = self.request(Method::HEAD, url.clone());
                async move {
                    let response = request.send().await?;
                    match response.status() {
                        StatusCode::OK | StatusCode::NO_CONTENT => Ok(response),
                        // Some servers answer 403 for uploads they no longer hold
                        StatusCode::FORBIDDEN => Err(ClientError::ResourceNotFound(
                            "HEAD returned 403 Forbidden".into(),
                        )),
                        status => Err(classify_status(status, "HEAD")),
                    }
                }
            })
            .await?;

        let offset = parse_offset(response.headers())?;

        let span = tracing::Span::current();
        span.record("tus.offset", offset);
        span.record("http.status_code", response.status().as_u16());

        Ok(offset)
    }

    /// Ask the server to delete `resource` (termination extension)
    #[tracing::instrument(
        name = "tus.delete",
        skip(self, resource),
        fields(tus.resource = %resource.url, http.status_code = tracing::field::Empty),
        err
    )]
    pub async fn delete(&self, resource: &UploadResource) -> Result<(), ClientError> {
        let url = Self::resource_url(resource)?;
        let response = self.request(Method::DELETE, url).send().await?;
        let status = response.status();
        tracing::Span::current().record("http.status_code", status.as_u16());

        match status {
            StatusCode::NO_CONTENT | StatusCode::OK => Ok(()),
            // Already gone
            StatusCode::NOT_FOUND | StatusCode::GONE => Ok(()),
            status => Err(classify_status(status, "DELETE")),
        }
    }

    /// Send `[from, from + chunk)` of `file`, retrying transient failures
    async fn transfer_range(
        &self,
        resource: UploadResource,
        file: Arc<dyn UploadableFile>,
        from: u64,
        progress: ProgressCallback,
    ) -> Result<u64, ClientError> {
        let total = file.size();
        if from >= total {
            return Err(ClientError::ProtocolError(format!(
                "Nothing to send from offset {} of {}",
                from, total
            )));
        }

        let len = self.inner.config.chunk_size.min(total - from);
        let body = file.read_range(from, len).await?;
        let url = Self::resource_url(&resource)?;

        let start_time = Instant::now();
        let result = self
            .inner
            .config
            .retry
            .run("tus.patch", |_| {
                let attempt = self.patch(url.clone(), body.clone(), from, total, progress.clone());
                async move {
                    let result = attempt.await;
                    metrics::record_range_request(match &result {
                        Ok(_) => "success",
                        Err(e) => error_label(e),
                    });
                    result
                }
            })
            .await;
        metrics::record_range_duration(start_time.elapsed().as_secs_f64());

        if let Ok(offset) = &result {
            metrics::record_bytes_acknowledged(offset - from);
        }
        result
    }

    /// One PATCH attempt
    #[tracing::instrument(
        name = "tus.patch",
        skip(self, url, body, progress),
        fields(
            tus.resource = %url,
            tus.from_offset = from,
            upload.bytes = body.len(),
            tus.offset = tracing::field::Empty,
            http.status_code = tracing::field::Empty
        ),
        err
    )]
    async fn patch(
        &self,
        url: Url,
        body: Bytes,
        from: u64,
        total: u64,
        progress: ProgressCallback,
    ) -> Result<u64, ClientError> {
        let len = body.len();
        let step = self.inner.config.progress_step;

        // Slices are handed to the connection lazily; each one reports progress
        let mut sent = 0u64;
        let slices = (0..len)
            .step_by(step)
            .map(|start| body.slice(start..(start + step).min(len)))
            .collect::<Vec<_>>()
            .into_iter()
            .map(move |slice| {
                sent += slice.len() as u64;
                progress(from + sent, total);
                Ok::<Bytes, std::io::Error>(slice)
            });
        let stream_body = reqwest::Body::wrap_stream(futures::stream::iter(slices));

        let response = self
            .request(Method::PATCH, url)
            .header(UPLOAD_OFFSET, from)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .header(CONTENT_LENGTH, len)
            .body(stream_body)
            .send()
            .await?;

        let status = response.status();
        let span = tracing::Span::current();
        span.record("http.status_code", status.as_u16());

        if status != StatusCode::NO_CONTENT && status != StatusCode::OK {
            return Err(classify_status(status, "PATCH"));
        }

        let offset = parse_offset(response.headers())?;
        span.record("tus.offset", offset);

        if offset <= from || offset > total {
            return Err(ClientError::ProtocolError(format!(
                "Server offset {} after PATCH from {} is outside ({}, {}]",
                offset, from, from, total
            )));
        }

        tracing::debug!(from = from, offset = offset, "Range acknowledged");

        Ok(offset)
    }
}

fn error_label(e: &ClientError) -> &'static str {
    match e {
        ClientError::TransportError(_) => "transport_error",
        ClientError::ResourceNotFound(_) => "not_found",
        ClientError::ServerRejected { .. } => "rejected",
        ClientError::ProtocolError(_) => "protocol_error",
        ClientError::ConfigError(_) => "config_error",
        ClientError::FileError(_) => "file_error",
        ClientError::Aborted => "aborted",
    }
}

/// Send a request and accept only the listed statuses
async fn send_checked(
    request: reqwest::RequestBuilder,
    accepted: &[StatusCode],
    context: &str,
) -> Result<reqwest::Response, ClientError> {
    let response = request.send().await?;
    if accepted.contains(&response.status()) {
        Ok(response)
    } else {
        Err(classify_status(response.status(), context))
    }
}

#[async_trait]
impl Transport for TusClient {
    fn endpoint(&self) -> String {
        self.inner.config.endpoint.clone()
    }

    async fn create_or_locate(
        &self,
        file: Arc<dyn UploadableFile>,
        prior: Option<StoredResource>,
    ) -> Result<UploadResource, ClientError> {
        if let Some(prior) = prior.filter(|p| p.size == file.size()) {
            let mut resource = UploadResource {
                url: prior.url,
                received_bytes: 0,
            };

            match self.head(&resource).await {
                Ok(offset) if offset <= file.size() => {
                    tracing::info!(
                        location = %resource.url,
                        offset = offset,
                        "Located previous upload resource"
                    );
                    resource.received_bytes = offset;
                    return Ok(resource);
                }
                Ok(offset) => {
                    tracing::warn!(
                        location = %resource.url,
                        offset = offset,
                        size = file.size(),
                        "Previous upload resource is larger than the file, creating a new one"
                    );
                }
                Err(ClientError::ResourceNotFound(_)) => {
                    tracing::info!(
                        location = %resource.url,
                        "Previous upload resource expired, creating a new one"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        self.create(file.as_ref()).await
    }

    async fn query_received_bytes(&self, resource: &UploadResource) -> Result<u64, ClientError> {
        self.head(resource).await
    }

    fn send_range(
        &self,
        resource: &UploadResource,
        file: Arc<dyn UploadableFile>,
        from_offset: u64,
        progress: ProgressCallback,
    ) -> RangeHandle {
        let client = self.clone();
        let resource = resource.clone();
        RangeHandle::spawn(from_offset, async move {
            client
                .transfer_range(resource, file, from_offset, progress)
                .await
        })
    }

    async fn terminate(&self, resource: &UploadResource) -> Result<(), ClientError> {
        self.delete(resource).await
    }
}
