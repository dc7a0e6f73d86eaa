//! Secure redirect policy for the hyper transport
//!
//! Protects against:
//! - SSRF via cross-origin redirects
//! - Credential leakage via `Authorization` header forwarding
//! - HTTPS downgrade attacks
//!
//! Every redirect the policy decides to follow is reported to the owning task
//! as a [`TaskEvent::Redirected`], so the session can forward it to monitors.

use crate::config::RedirectConfig;
use crate::transport::{TaskEvent, TaskEventSink};
use http::{Request, StatusCode, Uri, header};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Request extension linking a redirect chain to the task that started it.
///
/// The transport inserts one into the outgoing request; the policy picks it up
/// on the first `on_request` call, since follow-up requests do not carry the
/// original extensions.
#[derive(Debug, Clone)]
pub struct RedirectObserver {
    sink: TaskEventSink,
    followed: Arc<AtomicUsize>,
}

impl RedirectObserver {
    pub(crate) fn new(sink: TaskEventSink) -> Self {
        Self {
            sink,
            followed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn followed(&self) -> usize {
        self.followed.load(Ordering::Relaxed)
    }

    fn record(&self, from: &Uri, to: &Uri, status: StatusCode) {
        self.followed.fetch_add(1, Ordering::Relaxed);
        self.sink.send(TaskEvent::Redirected {
            from: from.clone(),
            to: to.clone(),
            status,
        });
    }
}

/// A security-hardened redirect policy
///
/// 1. **Same-origin enforcement**: by default only follows redirects to the same host
/// 2. **Header stripping**: removes `Authorization`, `Cookie` on cross-origin redirects
/// 3. **Downgrade protection**: blocks HTTPS → HTTP redirects
/// 4. **Host allow-list**: trusted redirect targets
#[derive(Debug, Clone)]
pub struct SecureRedirectPolicy {
    config: RedirectConfig,
    /// Resets per request via Clone
    redirect_count: usize,
    cross_origin_detected: bool,
    observer: Option<RedirectObserver>,
}

impl SecureRedirectPolicy {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            redirect_count: 0,
            cross_origin_detected: false,
            observer: None,
        }
    }

    /// Same scheme, host and port. Missing schemes count as "https".
    fn is_same_origin(original: &Uri, target: &Uri) -> bool {
        let orig_scheme = original.scheme_str().unwrap_or("https");
        let target_scheme = target.scheme_str().unwrap_or("https");

        let orig_port = original
            .port_u16()
            .unwrap_or_else(|| default_port(orig_scheme));
        let target_port = target
            .port_u16()
            .unwrap_or_else(|| default_port(target_scheme));

        orig_scheme == target_scheme
            && original.host().unwrap_or("") == target.host().unwrap_or("")
            && orig_port == target_port
    }

    fn is_https_downgrade(original: &Uri, target: &Uri) -> bool {
        original.scheme_str().unwrap_or("https") == "https"
            && target.scheme_str().unwrap_or("https") == "http"
    }

    fn is_allowed_host(&self, target: &Uri) -> bool {
        target
            .host()
            .is_some_and(|host| self.config.allowed_redirect_hosts.contains(host))
    }

    /// Decide whether to follow `original -> target`, updating per-chain state.
    fn decide(&mut self, original: &Uri, target: &Uri) -> Action {
        self.redirect_count += 1;
        if self.redirect_count > self.config.max_redirects {
            tracing::debug!(
                count = self.redirect_count,
                max = self.config.max_redirects,
                "redirect limit reached"
            );
            return Action::Stop;
        }

        if !self.config.allow_https_downgrade && Self::is_https_downgrade(original, target) {
            tracing::warn!(
                original = %original,
                target = %target,
                "blocking HTTPS to HTTP downgrade redirect"
            );
            return Action::Stop;
        }

        let is_same_origin = Self::is_same_origin(original, target);
        if self.config.same_origin_only && !is_same_origin && !self.is_allowed_host(target) {
            tracing::warn!(
                original = %original,
                target = %target,
                "blocking cross-origin redirect (same_origin_only=true)"
            );
            return Action::Stop;
        }

        if !is_same_origin {
            self.cross_origin_detected = true;
        }
        Action::Follow
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

impl<B: Clone, E> Policy<B, E> for SecureRedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        let original = attempt.previous();
        let target = attempt.location();
        let action = self.decide(original, target);

        if matches!(action, Action::Follow)
            && let Some(observer) = &self.observer
        {
            observer.record(original, target, attempt.status());
        }
        Ok(action)
    }

    fn on_request(&mut self, request: &mut Request<B>) {
        if self.observer.is_none() {
            self.observer = request.extensions().get::<RedirectObserver>().cloned();
        }

        if self.cross_origin_detected && self.config.strip_sensitive_headers {
            let headers = request.headers_mut();
            for header_name in SENSITIVE_HEADERS {
                if headers.remove(header_name).is_some() {
                    tracing::debug!(
                        header = %header_name,
                        "stripped sensitive header on cross-origin redirect"
                    );
                }
            }
        }
    }

    fn clone_body(&self, body: &B) -> Option<B> {
        // 307/308 preserve the request body
        Some(body.clone())
    }
}
