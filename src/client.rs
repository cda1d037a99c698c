//! HTTP implementations of [`Transport`] and [`AuthBackend`] built on reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client as ReqwestClient;
use serde_json::json;
use url::Url;

use crate::auth::AuthBackend;
use crate::clock::Clock;
use crate::config::{CoreConfig, EndpointPaths};
use crate::transport::{HttpResponse, Method, RequestSpec, ResponseBody, Transport};
use crate::{CredentialBundle, Error, LoginCredentials, Result, TokenGrant};

/// Sends requests to the backend over HTTP.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ReqwestClient,
    base_url: Url,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Creates a transport for `base_url`.
    ///
    /// `timeout` bounds requests that cannot stream.  Streaming requests run until the server
    /// closes the body or the caller cancels.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{base_url}/"))?
        };
        let client = ReqwestClient::builder()
            .default_headers(Self::default_headers())
            .build()
            .map_err(|e| {
                Error::http_client(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Creates a transport from the resolved configuration.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout)
    }

    /// Returns the base URL every path is resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(concat!("chatline/", env!("CARGO_PKG_VERSION"))),
        );
        headers
    }

    /// Sends `request`, with `bearer` as its access token when given.
    pub async fn send(&self, request: &RequestSpec, bearer: Option<&str>) -> Result<HttpResponse> {
        let url = self.base_url.join(request.path.trim_start_matches('/'))?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, request.accept.header_value());
        if let Some(bearer) = bearer {
            builder = builder.bearer_auth(bearer);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if !request.accept.may_stream() {
            builder = builder.timeout(self.timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::timeout(
                    format!("Request timed out: {e}"),
                    Some(self.timeout.as_secs_f64()),
                )
            } else if e.is_connect() {
                Error::connection(format!("Connection error: {e}"), Some(Box::new(e)))
            } else {
                Error::http_client(format!("Request failed: {e}"), Some(Box::new(e)))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let content_type = header_str(headers, header::CONTENT_TYPE.as_str());
        let request_id = header_str(headers, "x-request-id");
        let retry_after =
            header_str(headers, header::RETRY_AFTER.as_str()).and_then(|v| v.parse().ok());
        let body = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| {
                Error::streaming(format!("Failed to read response body: {e}"), Some(Box::new(e)))
            })
        });

        tracing::debug!(status, content_type = ?content_type, "response received");
        Ok(HttpResponse {
            request_id,
            retry_after,
            ..HttpResponse::new(status, content_type, ResponseBody::Stream(Box::pin(body)))
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: &RequestSpec, bearer: &str) -> Result<HttpResponse> {
        self.send(request, Some(bearer)).await
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|val| val.to_str().ok())
        .map(String::from)
}

/// The backend's login, refresh, and logout endpoints over HTTP.
pub struct HttpAuthBackend {
    transport: ReqwestTransport,
    clock: Arc<dyn Clock>,
    endpoints: EndpointPaths,
}

impl HttpAuthBackend {
    /// Creates a backend using `transport` and the default endpoint paths.
    pub fn new(transport: ReqwestTransport, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            clock,
            endpoints: EndpointPaths::default(),
        }
    }

    /// Sets the endpoint paths.
    pub fn with_endpoints(mut self, endpoints: EndpointPaths) -> Self {
        self.endpoints = endpoints;
        self
    }

    async fn exchange(&self, request: RequestSpec) -> Result<TokenGrant> {
        let response = self.transport.send(&request, None).await?;
        if !response.is_success() {
            return Err(response.into_error().await);
        }
        response.json_body::<TokenGrant>().await
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn login(&self, credentials: &LoginCredentials) -> Result<CredentialBundle> {
        let body = serde_json::to_value(credentials)?;
        let grant = self
            .exchange(RequestSpec::post(&self.endpoints.login, body))
            .await?;
        let bundle = grant.into_bundle(self.clock.now())?;
        tracing::info!(username = %credentials.username, "signed in");
        Ok(bundle)
    }

    async fn refresh(&self, session_id: &str, refresh_token: &str) -> Result<CredentialBundle> {
        let body = json!({
            "session_id": session_id,
            "refresh_token": refresh_token,
        });
        let grant = self
            .exchange(RequestSpec::post(&self.endpoints.refresh, body))
            .await?;
        let mut bundle = grant.into_bundle(self.clock.now())?;
        if bundle.refresh_token.is_empty() {
            bundle.refresh_token = refresh_token.to_string();
        }
        Ok(bundle)
    }

    async fn logout(&self, bundle: &CredentialBundle) -> Result<()> {
        let request = RequestSpec::post(
            &self.endpoints.logout,
            json!({"session_id": bundle.session_id}),
        );
        let response = self
            .transport
            .send(&request, Some(&bundle.access_token))
            .await?;
        if !response.is_success() {
            return Err(response.into_error().await);
        }
        Ok(())
    }
}
