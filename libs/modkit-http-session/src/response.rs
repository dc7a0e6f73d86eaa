use crate::error::BoxError;
use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime};

/// Status line and headers of a completed transport task.
///
/// The body is not part of the head; the engine buffers it separately so
/// every response consumer reads the same bytes.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Value of the `Retry-After` header, if present and in the future.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }
}

impl<B> From<&http::Response<B>> for ResponseHead {
    fn from(response: &http::Response<B>) -> Self {
        Self {
            status: response.status(),
            version: response.version(),
            headers: response.headers().clone(),
        }
    }
}

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" → 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" → duration until that time
///
/// Returns `None` if the header is missing, unparsable or in the past.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    let parsed = httpdate::parse_http_date(trimmed).ok()?;
    parsed.duration_since(SystemTime::now()).ok()
}

/// Turns the buffered bytes of a finished attempt into a typed value.
///
/// Serializers run off the root context (on tokio's blocking pool), once per
/// consumer per attempt. They only see successful attempts: terminal errors are
/// delivered to consumers directly. A serializer error is a failure source of
/// its own and is routed through the retry chain.
pub trait ResponseSerializer: Send + Sync + 'static {
    type Output: Send + 'static;

    /// # Errors
    /// Returns an error if the bytes cannot be interpreted.
    fn serialize(
        &self,
        request: Option<&http::Request<Bytes>>,
        response: Option<&ResponseHead>,
        data: Option<&Bytes>,
    ) -> Result<Self::Output, BoxError>;
}

/// Error returned by the built-in serializers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SerializeError {
    #[error("Response could not be serialized, input data was empty")]
    EmptyBody,

    #[error("String serialization failed: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Responses that legitimately carry no body: HEAD requests, 204 and 205.
fn empty_allowed(request: Option<&http::Request<Bytes>>, response: Option<&ResponseHead>) -> bool {
    let head = request.is_some_and(|r| r.method() == http::Method::HEAD);
    let status = response.is_some_and(|r| {
        r.status == StatusCode::NO_CONTENT || r.status == StatusCode::RESET_CONTENT
    });
    head || status
}

fn non_empty<'a>(
    request: Option<&http::Request<Bytes>>,
    response: Option<&ResponseHead>,
    data: Option<&'a Bytes>,
) -> Result<Option<&'a Bytes>, SerializeError> {
    match data {
        Some(bytes) if !bytes.is_empty() => Ok(Some(bytes)),
        _ if empty_allowed(request, response) => Ok(None),
        _ => Err(SerializeError::EmptyBody),
    }
}

/// Raw bytes. Empty bodies are only accepted for HEAD, 204 and 205.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl ResponseSerializer for BytesSerializer {
    type Output = Bytes;

    fn serialize(
        &self,
        request: Option<&http::Request<Bytes>>,
        response: Option<&ResponseHead>,
        data: Option<&Bytes>,
    ) -> Result<Bytes, BoxError> {
        Ok(non_empty(request, response, data)?
            .cloned()
            .unwrap_or_default())
    }
}

/// UTF-8 text.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl ResponseSerializer for StringSerializer {
    type Output = String;

    fn serialize(
        &self,
        request: Option<&http::Request<Bytes>>,
        response: Option<&ResponseHead>,
        data: Option<&Bytes>,
    ) -> Result<String, BoxError> {
        let Some(bytes) = non_empty(request, response, data)? else {
            return Ok(String::new());
        };
        String::from_utf8(bytes.to_vec())
            .map_err(SerializeError::from)
            .map_err(Into::into)
    }
}

/// JSON into any `DeserializeOwned` type.
pub struct JsonSerializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonSerializer<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSerializer")
            .field("output", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> ResponseSerializer for JsonSerializer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn serialize(
        &self,
        request: Option<&http::Request<Bytes>>,
        response: Option<&ResponseHead>,
        data: Option<&Bytes>,
    ) -> Result<T, BoxError> {
        // An allowed empty body still has to produce a `T`; `null` works for
        // `Option<_>` and `()`.
        let bytes = non_empty(request, response, data)?;
        let slice: &[u8] = bytes.map_or(b"null", |b| b.as_ref());
        serde_json::from_slice(slice)
            .map_err(SerializeError::from)
            .map_err(Into::into)
    }
}
