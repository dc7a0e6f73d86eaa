use crate::config::DEFAULT_USER_AGENT;
use crate::error::BoxError;
use crate::interceptor::Adapter;
use crate::session::SessionContext;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderValue;
use http::header::InvalidHeaderValue;

/// Adapter that adds a `User-Agent` header to requests that lack one
#[derive(Debug, Clone)]
pub struct UserAgentAdapter {
    user_agent: HeaderValue,
}

impl UserAgentAdapter {
    /// # Errors
    /// Returns an error if the user agent string is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, InvalidHeaderValue> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref())?;
        Ok(Self { user_agent })
    }
}

impl Default for UserAgentAdapter {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

#[async_trait]
impl Adapter for UserAgentAdapter {
    async fn adapt(
        &self,
        mut request: http::Request<Bytes>,
        _session: &SessionContext,
    ) -> Result<http::Request<Bytes>, BoxError> {
        // Only add User-Agent if not already present
        if !request.headers().contains_key(http::header::USER_AGENT) {
            request
                .headers_mut()
                .insert(http::header::USER_AGENT, self.user_agent.clone());
        }
        Ok(request)
    }
}
