//! Per-exchange mutable state: the once-settled outcome of a single logical
//! operation, including its derived-redirect lineage.
//!
//! Success and failure are mutually exclusive, each settable at most once;
//! the completion signal fires exactly once, on whichever transition happens
//! first. A derived (redirect) context shares the cookie jar, the redirect
//! counter and the completion signal with its parent by reference, but
//! carries a new URL, method and message. That is continuity of one logical
//! operation, not a new one.
use std::{
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{HeaderMap, Method, header};
use tokio::sync::Notify;
use url::Url;
use uuid::Uuid;

/// A name/value pair accumulated from `Set-Cookie` response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

impl Cookie {
    /// Parse the leading name=value pair of a `Set-Cookie` header value;
    /// attributes after the first `;` are not retained.
    pub fn parse(raw: &str) -> Option<Self> {
        let pair = raw.split(';').next()?.trim();
        let (name, value) = pair.split_once('=')?;
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

/// The settled result of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Succeeded,
    /// Terminal failure with a cause string
    Failed(String),
}

/// State shared between a root context and every context derived from it.
struct ExchangeShared {
    id: Uuid,
    outcome: Mutex<Option<ExchangeOutcome>>,
    settled: Condvar,
    notify: Notify,
    redirect_count: AtomicU32,
    cookies: Mutex<Vec<Cookie>>,
}

/// The mutable state of one exchange attempt.
///
/// Cloning a context is cheap and yields a handle onto the same shared
/// exchange state; [`derive`](Self::derive) additionally replaces the
/// URL/method/message for a redirect hop.
#[derive(Clone)]
pub struct RequestContext {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
    timeout: Duration,
    started_at: Instant,
    follow_redirects: bool,
    max_redirects: u32,
    stream_id: Option<u64>,
    shared: Arc<ExchangeShared>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: Url,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
        timeout: Duration,
        follow_redirects: bool,
        max_redirects: u32,
    ) -> Self {
        Self {
            url,
            method,
            headers,
            body,
            timeout,
            started_at: Instant::now(),
            follow_redirects,
            max_redirects,
            stream_id: None,
            shared: Arc::new(ExchangeShared {
                id: Uuid::new_v4(),
                outcome: Mutex::new(None),
                settled: Condvar::new(),
                notify: Notify::new(),
                redirect_count: AtomicU32::new(0),
                cookies: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Derive the context for a redirect hop: new URL, method and message;
    /// shared cookie jar, redirect counter, completion signal and deadline.
    pub fn derive(&self, url: Url, method: Method, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            method,
            headers,
            body,
            timeout: self.timeout,
            started_at: self.started_at,
            follow_redirects: self.follow_redirects,
            max_redirects: self.max_redirects,
            stream_id: None,
            shared: self.shared.clone(),
        }
    }

    /// Stable identifier of the logical operation, shared by derived
    /// contexts; used in tracing spans.
    pub fn exchange_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn follow_redirects(&self) -> bool {
        self.follow_redirects
    }

    pub fn max_redirects(&self) -> u32 {
        self.max_redirects
    }

    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    /// Record the HTTP/2 stream identifier carrying this attempt.
    pub fn set_stream_id(&mut self, stream_id: u64) {
        self.stream_id = Some(stream_id);
    }

    /// Whether the exchange deadline has passed. Checked at dispatch time,
    /// before a pool permit is consumed.
    pub fn is_expired(&self) -> bool {
        Instant::now() > self.started_at + self.timeout
    }

    // --- settling -----------------------------------------------------

    /// Mark the exchange succeeded. Returns true iff this call settled it;
    /// a no-op after any prior settle.
    pub fn succeed(&self) -> bool {
        self.settle(ExchangeOutcome::Succeeded)
    }

    /// Mark the exchange failed with a cause. Returns true iff this call
    /// settled it.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        self.settle(ExchangeOutcome::Failed(cause.into()))
    }

    fn settle(&self, outcome: ExchangeOutcome) -> bool {
        let mut guard = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(outcome);
        self.shared.settled.notify_all();
        drop(guard);
        self.shared.notify.notify_waiters();
        true
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome(), Some(ExchangeOutcome::Succeeded))
    }

    pub fn failed(&self) -> bool {
        matches!(self.outcome(), Some(ExchangeOutcome::Failed(_)))
    }

    /// The failure cause, once failed.
    pub fn failure_cause(&self) -> Option<String> {
        match self.outcome() {
            Some(ExchangeOutcome::Failed(cause)) => Some(cause),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<ExchangeOutcome> {
        self.shared
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Block the calling thread until the exchange settles.
    pub fn wait(&self) -> ExchangeOutcome {
        let guard = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let guard = self
            .shared
            .settled
            .wait_while(guard, |outcome| outcome.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone().expect("settled outcome present after wait")
    }

    /// Block the calling thread until the exchange settles or the duration
    /// elapses. Returns the outcome when settled in time.
    pub fn wait_timeout(&self, duration: Duration) -> Option<ExchangeOutcome> {
        let guard = self
            .shared
            .outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _timeout) = self
            .shared
            .settled
            .wait_timeout_while(guard, duration, |outcome| outcome.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.clone()
    }

    /// Await exchange completion without blocking an I/O task.
    pub async fn completed(&self) -> ExchangeOutcome {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(outcome) = self.outcome() {
                return outcome;
            }
            notified.await;
        }
    }

    // --- redirect budget ----------------------------------------------

    pub fn redirect_count(&self) -> u32 {
        self.shared.redirect_count.load(Ordering::Acquire)
    }

    /// Consume one unit of the shared redirect budget. Returns false once
    /// the counter has reached `max_redirects`; the counter is shared across
    /// every derived context of this operation.
    pub fn try_take_redirect(&self) -> bool {
        self.shared
            .redirect_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < self.max_redirects).then_some(count + 1)
            })
            .is_ok()
    }

    // --- cookie jar ---------------------------------------------------

    /// Accumulate cookies from a response's `Set-Cookie` headers. A repeated
    /// name replaces the earlier value.
    pub fn accumulate_cookies(&self, headers: &HeaderMap) -> Vec<Cookie> {
        let mut added = Vec::new();
        for value in headers.get_all(header::SET_COOKIE) {
            if let Ok(raw) = value.to_str()
                && let Some(cookie) = Cookie::parse(raw)
            {
                added.push(cookie);
            }
        }
        if !added.is_empty() {
            let mut jar = self
                .shared
                .cookies
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for cookie in &added {
                jar.retain(|existing| existing.name != cookie.name);
                jar.push(cookie.clone());
            }
        }
        added
    }

    /// Snapshot of the accumulated cookie jar.
    pub fn cookies(&self) -> Vec<Cookie> {
        self.shared
            .cookies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The `Cookie` request header value replaying the jar, if non-empty.
    pub fn cookie_header(&self) -> Option<String> {
        let jar = self
            .shared
            .cookies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if jar.is_empty() {
            return None;
        }
        Some(
            jar.iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("exchange_id", &self.shared.id)
            .field("url", &self.url.as_str())
            .field("method", &self.method)
            .field("outcome", &self.outcome())
            .field("redirect_count", &self.redirect_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn context() -> RequestContext {
        RequestContext::new(
            Url::parse("http://example.com/a").unwrap(),
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_secs(30),
            true,
            3,
        )
    }

    #[test]
    fn test_success_then_fail_is_noop() {
        let ctx = context();
        assert!(ctx.succeed());
        assert!(!ctx.fail("late failure"));
        assert!(ctx.succeeded());
        assert!(!ctx.failed());
    }

    #[test]
    fn test_fail_then_success_is_noop() {
        let ctx = context();
        assert!(ctx.fail("boom"));
        assert!(!ctx.succeed());
        assert!(ctx.failed());
        assert_eq!(ctx.failure_cause().as_deref(), Some("boom"));
    }

    #[test]
    fn test_completion_fires_exactly_once_under_racing_settlers() {
        let ctx = context();
        let settled = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ctx = ctx.clone();
                let settled = settled.clone();
                std::thread::spawn(move || {
                    let won = if i % 2 == 0 {
                        ctx.succeed()
                    } else {
                        ctx.fail("race")
                    };
                    if won {
                        settled.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(settled.load(Ordering::SeqCst), 1);
        assert!(ctx.is_settled());
    }

    #[test]
    fn test_wait_observes_settlement_from_other_thread() {
        let ctx = context();
        let waiter = {
            let ctx = ctx.clone();
            std::thread::spawn(move || ctx.wait())
        };
        std::thread::sleep(Duration::from_millis(20));
        ctx.fail("channel inactive");
        assert_eq!(
            waiter.join().unwrap(),
            ExchangeOutcome::Failed("channel inactive".to_string())
        );
    }

    #[test]
    fn test_wait_timeout_returns_none_while_pending() {
        let ctx = context();
        assert!(ctx.wait_timeout(Duration::from_millis(10)).is_none());
        ctx.succeed();
        assert_eq!(
            ctx.wait_timeout(Duration::from_millis(10)),
            Some(ExchangeOutcome::Succeeded)
        );
    }

    #[tokio::test]
    async fn test_completed_resolves_after_settle() {
        let ctx = context();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.completed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.succeed();
        assert_eq!(waiter.await.unwrap(), ExchangeOutcome::Succeeded);
    }

    #[test]
    fn test_redirect_budget_is_shared_with_derived_contexts() {
        let ctx = context();
        let derived = ctx.derive(
            Url::parse("http://example.com/b").unwrap(),
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
        );

        assert!(ctx.try_take_redirect());
        assert!(derived.try_take_redirect());
        assert!(ctx.try_take_redirect());
        // Budget of 3 exhausted across the lineage.
        assert!(!derived.try_take_redirect());
        assert_eq!(ctx.redirect_count(), 3);
    }

    #[test]
    fn test_cookies_accumulate_across_lineage() {
        let ctx = context();
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, "session=abc; Path=/".parse().unwrap());
        headers.append(header::SET_COOKIE, "theme=dark".parse().unwrap());
        ctx.accumulate_cookies(&headers);

        let derived = ctx.derive(
            Url::parse("http://example.com/b").unwrap(),
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
        );
        let mut more = HeaderMap::new();
        more.append(header::SET_COOKIE, "session=def".parse().unwrap());
        derived.accumulate_cookies(&more);

        let header_value = ctx.cookie_header().unwrap();
        assert!(header_value.contains("session=def"));
        assert!(header_value.contains("theme=dark"));
        assert!(!header_value.contains("session=abc"));
    }

    #[test]
    fn test_cookie_parse_keeps_leading_pair_only() {
        let cookie = Cookie::parse("id=42; HttpOnly; Path=/").unwrap();
        assert_eq!(cookie.name, "id");
        assert_eq!(cookie.value, "42");
        assert!(Cookie::parse("; Path=/").is_none());
    }

    #[test]
    fn test_expiry_uses_shared_deadline() {
        let ctx = RequestContext::new(
            Url::parse("http://example.com/").unwrap(),
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_millis(0),
            false,
            0,
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.is_expired());
        let derived = ctx.derive(
            Url::parse("http://example.com/b").unwrap(),
            Method::GET,
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(derived.is_expired());
    }
}
