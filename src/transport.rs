//! Transport-neutral request and response types.
//!
//! The gateway issues a [`RequestSpec`] through a [`Transport`] and gets an [`HttpResponse`]
//! back.  A request spec is a plain value so the exact same request can be issued a second time
//! after a token refresh.

use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{Error, Result};

/// MIME type of the chat event stream.
pub const EVENT_STREAM: &str = "text/event-stream";

/// A stream of body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
        }
    }
}

/// Response representation the caller is prepared to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accept {
    /// A single JSON document.
    Json,
    /// An event stream.
    EventStream,
    /// Either; the server picks by content type.
    Negotiate,
}

impl Accept {
    /// Returns the `Accept` header value.
    pub fn header_value(&self) -> &'static str {
        match self {
            Accept::Json => "application/json",
            Accept::EventStream => EVENT_STREAM,
            Accept::Negotiate => "text/event-stream, application/json",
        }
    }

    /// Returns true if the response may be a long-lived stream.
    pub fn may_stream(&self) -> bool {
        !matches!(self, Accept::Json)
    }
}

/// A request that can be issued any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the backend's base URL.
    pub path: String,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// Acceptable response representation.
    pub accept: Accept,
}

impl RequestSpec {
    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            body: None,
            accept: Accept::Json,
        }
    }

    /// Creates a POST request carrying a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body: Some(body),
            accept: Accept::Json,
        }
    }

    /// Sets the acceptable response representation.
    pub fn with_accept(mut self, accept: Accept) -> Self {
        self.accept = accept;
        self
    }
}

/// A response body.
pub enum ResponseBody {
    /// No body.
    Empty,
    /// A fully buffered body.
    Bytes(Bytes),
    /// A body still arriving from the network.
    Stream(ByteStream),
}

/// A response as seen by the gateway and its callers.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// The `content-type` header, if present.
    pub content_type: Option<String>,
    /// The `x-request-id` header, if present.
    pub request_id: Option<String>,
    /// The `retry-after` header in seconds, if present.
    pub retry_after: Option<u64>,
    /// Response body.
    pub body: ResponseBody,
    /// True if the response was produced locally rather than received from the network.
    pub synthesized: bool,
}

impl HttpResponse {
    /// Creates a response received from the network.
    pub fn new(status: u16, content_type: Option<String>, body: ResponseBody) -> Self {
        Self {
            status,
            content_type,
            request_id: None,
            retry_after: None,
            body,
            synthesized: false,
        }
    }

    /// Creates a buffered JSON response.
    pub fn json(status: u16, value: &Value) -> Self {
        Self::new(
            status,
            Some("application/json".to_string()),
            ResponseBody::Bytes(Bytes::from(value.to_string())),
        )
    }

    /// The 401 handed back when no usable token exists and no request was sent.
    pub fn local_unauthorized() -> Self {
        let body = serde_json::json!({
            "error": {
                "type": "authentication_error",
                "message": "no valid session; sign in again",
            }
        });
        Self {
            synthesized: true,
            ..Self::json(401, &body)
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Returns true if the response reports an authorization failure.
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    /// Returns true if the response body is an event stream.
    pub fn is_event_stream(&self) -> bool {
        self.content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(|mime| mime.trim().eq_ignore_ascii_case(EVENT_STREAM))
            .unwrap_or(false)
    }

    /// Converts the body into a chunk stream, whatever its current form.
    pub fn into_byte_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Empty => Box::pin(stream::empty()),
            ResponseBody::Bytes(bytes) => Box::pin(stream::once(async move { Ok(bytes) })),
            ResponseBody::Stream(stream) => stream,
        }
    }

    /// Reads the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            ResponseBody::Empty => Ok(Bytes::new()),
            ResponseBody::Bytes(bytes) => Ok(bytes),
            ResponseBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }

    /// Reads the whole body as JSON.
    pub async fn json_body<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            Error::serialization(
                format!("Failed to parse response: {e}"),
                Some(Box::new(e)),
            )
        })
    }

    /// Converts a non-success response into the matching [`Error`].
    pub async fn into_error(self) -> Error {
        let status_code = self.status;
        let request_id = self.request_id.clone();
        let retry_after = self.retry_after;

        let error_body = match self.bytes().await {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(e) => {
                return Error::http_client(
                    format!("Failed to read error response: {e}"),
                    Some(Box::new(e)),
                );
            }
        };

        let parsed = serde_json::from_str::<Value>(&error_body).ok();
        let detail = parsed.as_ref().and_then(|v| v.get("error"));
        let error_type = detail
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
            .map(String::from);
        let error_param = detail
            .and_then(|e| e.get("param"))
            .and_then(Value::as_str)
            .map(String::from);
        let error_message = detail
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str)
            .or_else(|| {
                parsed
                    .as_ref()
                    .and_then(|v| v.get("detail").or_else(|| v.get("message")))
                    .and_then(Value::as_str)
            })
            .map(String::from)
            .unwrap_or_else(|| error_body.clone());

        match status_code {
            400 => Error::bad_request(error_message, error_param),
            401 => Error::authentication(error_message),
            403 => Error::permission(error_message),
            404 => Error::not_found(error_message),
            408 => Error::timeout(error_message, None),
            429 => Error::rate_limit(error_message, retry_after),
            500 => Error::internal_server(error_message, request_id),
            502..=504 => Error::service_unavailable(error_message, retry_after),
            _ => Error::api(status_code, error_type, error_message, request_id),
        }
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::Empty => "empty".to_string(),
            ResponseBody::Bytes(bytes) => format!("{} bytes", bytes.len()),
            ResponseBody::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("request_id", &self.request_id)
            .field("body", &body)
            .field("synthesized", &self.synthesized)
            .finish()
    }
}

/// Issues requests against the backend.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` with `bearer` as its access token.
    ///
    /// Any status code, including 401, is a successful exchange; `Err` means no response was
    /// received.
    async fn execute(&self, request: &RequestSpec, bearer: &str) -> Result<HttpResponse>;
}
