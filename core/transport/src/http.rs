//! reqwest-backed transport.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::collections::BTreeMap;
use tracing::debug;
use url::Url;

use tether_common::{ApiRequest, ApiResponse, Error, HttpMethod, Result};

use crate::transport::HttpTransport;

/// Default User-Agent sent with every request.
const DEFAULT_USER_AGENT: &str = concat!("Tether/", env!("CARGO_PKG_VERSION"));

/// HTTP transport built on a shared reqwest client.
///
/// Relative request URLs (e.g. `/api/locations`) are resolved against the
/// configured base URL.
pub struct ReqwestTransport {
    http: Client,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    /// Create a transport with the default User-Agent and no base URL.
    pub fn new() -> Result<Self> {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    /// Create a transport with a custom User-Agent.
    pub fn with_user_agent(user_agent: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: None,
        })
    }

    /// Set the base URL used to resolve relative request URLs.
    ///
    /// # Errors
    /// - Returns error if `base` is not an absolute URL
    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let base = Url::parse(base)
            .map_err(|e| Error::InvalidInput(format!("Invalid base URL {}: {}", base, e)))?;
        self.base_url = Some(base);
        Ok(self)
    }

    /// Resolve a request URL to an absolute URL.
    fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    Error::InvalidInput(format!("Relative URL without base URL: {}", url))
                })?;
                base.join(url)
                    .map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", url, e)))
            }
            Err(e) => Err(Error::InvalidInput(format!("Invalid URL {}: {}", url, e))),
        }
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let url = self.resolve(&request.url)?;
        debug!("{} {}", request.method, url);

        let mut builder = self.http.request(Self::method(request.method), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} {} failed: {}", request.method, request.url, e)))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("Failed to read response body: {}", e)))?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
