//! Expiry-aware token cache.
//!
//! One slot holds the default access token; identity tokens get one slot per
//! audience. Each slot has its own async mutex, so a refresh for one audience
//! never waits on another. A token is served from cache only while
//! `now < expires_at - SAFETY_MARGIN`; a failed refresh leaves the slot as it
//! was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{AccessTokenProvider, Clock, SystemClock, Token, TokenError, TokenFetcher};

/// Lead time before real expiry at which a cached token stops being served.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Longest lifetime a fetched token is trusted for; larger `expires_in`
/// values are clamped to it.
pub const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn usable_at(&self, now: Instant) -> Option<Token> {
        let deadline = self.expires_at.checked_sub(SAFETY_MARGIN)?;
        if now < deadline {
            Some(Token {
                value: self.value.clone(),
                ttl: self.expires_at.saturating_duration_since(now),
            })
        } else {
            None
        }
    }
}

type Slot = Arc<Mutex<Option<CachedToken>>>;

/// Caches tokens produced by a [`TokenFetcher`].
pub struct TokenCache {
    fetcher: Arc<dyn TokenFetcher>,
    clock: Arc<dyn Clock>,
    access: Slot,
    identity: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self::with_clock(fetcher, Arc::new(SystemClock))
    }

    pub fn with_clock(fetcher: Arc<dyn TokenFetcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            fetcher,
            clock,
            access: Arc::new(Mutex::new(None)),
            identity: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the default access token, fetching a new one when the cached
    /// value is missing or inside the safety margin.
    pub async fn access_token(&self) -> Result<Token, TokenError> {
        let fetcher = Arc::clone(&self.fetcher);
        self.get_or_refresh(&self.access, "access", || async move {
            fetcher.fetch_access_token().await
        })
        .await
    }

    /// Returns an identity token for `audience`, cached per audience.
    pub async fn identity_token(&self, audience: &str) -> Result<Token, TokenError> {
        let slot = {
            let mut slots = self.identity.lock().await;
            Arc::clone(slots.entry(audience.to_string()).or_default())
        };
        let fetcher = Arc::clone(&self.fetcher);
        let audience = audience.to_string();
        self.get_or_refresh(&slot, "identity", || async move {
            fetcher.fetch_identity_token(&audience).await
        })
        .await
    }

    async fn get_or_refresh<F, Fut>(
        &self,
        slot: &Mutex<Option<CachedToken>>,
        kind: &'static str,
        fetch: F,
    ) -> Result<Token, TokenError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Token, TokenError>>,
    {
        let mut guard = slot.lock().await;
        if let Some(token) = guard
            .as_ref()
            .and_then(|cached| cached.usable_at(self.clock.now()))
        {
            return Ok(token);
        }

        let mut fetched = fetch().await?;
        if fetched.value.is_empty() {
            return Err(TokenError::EmptyToken);
        }
        if fetched.ttl > MAX_TOKEN_LIFETIME {
            warn!(
                kind,
                expires_in = ?fetched.ttl,
                "token lifetime exceeds {:?}; clamping",
                MAX_TOKEN_LIFETIME
            );
            fetched.ttl = MAX_TOKEN_LIFETIME;
        }
        let now = self.clock.now();
        debug!(kind, expires_in = ?fetched.ttl, "refreshed token");
        // An unrepresentable deadline leaves the slot empty; the token is
        // still handed out once.
        *guard = now
            .checked_add(fetched.ttl)
            .map(|expires_at| CachedToken {
                value: fetched.value.clone(),
                expires_at,
            });
        Ok(fetched)
    }
}

#[async_trait]
impl AccessTokenProvider for TokenCache {
    async fn access_token(&self) -> Result<Token, TokenError> {
        TokenCache::access_token(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ManualClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    /// Fetcher returning scripted results and counting calls.
    #[derive(Default)]
    struct ScriptedFetcher {
        calls: AtomicUsize,
        identity_calls: AtomicUsize,
        responses: std::sync::Mutex<VecDeque<Result<Token, TokenError>>>,
    }

    impl ScriptedFetcher {
        fn push_ok(&self, value: &str, expires_in: u64) {
            self.responses.lock().unwrap().push_back(Ok(Token {
                value: value.to_string(),
                ttl: Duration::from_secs(expires_in),
            }));
        }

        fn push_err(&self) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(TokenError::EmptyToken));
        }

        fn next(&self) -> Result<Token, TokenError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TokenError::Unsupported("scripted")))
        }
    }

    #[async_trait]
    impl TokenFetcher for ScriptedFetcher {
        async fn fetch_access_token(&self) -> Result<Token, TokenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.next()
        }

        async fn fetch_identity_token(&self, audience: &str) -> Result<Token, TokenError> {
            self.identity_calls.fetch_add(1, Ordering::SeqCst);
            self.next().map(|token| Token {
                value: format!("{}@{audience}", token.value),
                ttl: token.ttl,
            })
        }
    }

    fn cache_with(fetcher: Arc<ScriptedFetcher>) -> (TokenCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = TokenCache::with_clock(fetcher, clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn reuses_token_within_safety_margin() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("ya29.first", 3599);
        let (cache, clock) = cache_with(fetcher.clone());

        let first = cache.access_token().await.expect("first");
        clock.advance(Duration::from_secs(3599 - 61));
        let second = cache.access_token().await.expect("second");

        assert_eq!(first.value, second.value);
        assert_eq!(second.ttl, Duration::from_secs(61));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetches_inside_safety_margin() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("ya29.first", 3599);
        fetcher.push_ok("ya29.second", 3599);
        let (cache, clock) = cache_with(fetcher.clone());

        cache.access_token().await.expect("first");
        clock.advance(Duration::from_secs(3599 - 59));
        let refreshed = cache.access_token().await.expect("refresh");

        assert_eq!(refreshed.value, "ya29.second");
        assert_eq!(refreshed.ttl, Duration::from_secs(3599));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("ya29.first", 3599);
        fetcher.push_err();
        fetcher.push_ok("ya29.third", 3599);
        let (cache, clock) = cache_with(fetcher.clone());

        cache.access_token().await.expect("first");
        clock.advance(Duration::from_secs(3560));
        assert!(cache.access_token().await.is_err());

        // The stale entry is still there but still inside the margin, so the
        // next call goes back to the network.
        let token = cache.access_token().await.expect("third");
        assert_eq!(token.value, "ya29.third");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn short_lived_tokens_are_never_cached() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("short", 30);
        fetcher.push_ok("short-again", 30);
        let (cache, _clock) = cache_with(fetcher.clone());

        assert_eq!(cache.access_token().await.expect("one").value, "short");
        assert_eq!(
            cache.access_token().await.expect("two").value,
            "short-again"
        );
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn absurd_lifetime_is_clamped_instead_of_overflowing() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("ya29.forever", u64::MAX);
        fetcher.push_ok("ya29.next", 3599);
        let (cache, clock) = cache_with(fetcher.clone());

        let token = cache.access_token().await.expect("clamped");
        assert_eq!(token.value, "ya29.forever");
        assert_eq!(token.ttl, MAX_TOKEN_LIFETIME);
        assert!(logs_contain("clamping"));

        clock.advance(MAX_TOKEN_LIFETIME - SAFETY_MARGIN - Duration::from_secs(1));
        assert_eq!(cache.access_token().await.expect("cached").value, "ya29.forever");
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.access_token().await.expect("refetched").value, "ya29.next");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn identity_tokens_are_cached_per_audience() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("id", 3599);
        fetcher.push_ok("id", 3599);
        let (cache, _clock) = cache_with(fetcher.clone());

        let a = cache.identity_token("https://a.example").await.expect("a");
        let b = cache.identity_token("https://b.example").await.expect("b");
        let a_again = cache.identity_token("https://a.example").await.expect("a2");

        assert_eq!(a.value, "id@https://a.example");
        assert_eq!(b.value, "id@https://b.example");
        assert_eq!(a, Token { ttl: a_again.ttl, ..a.clone() });
        assert_eq!(fetcher.identity_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_token_is_rejected_and_not_cached() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        fetcher.push_ok("", 3599);
        fetcher.push_ok("ya29.real", 3599);
        let (cache, _clock) = cache_with(fetcher.clone());

        assert!(matches!(
            cache.access_token().await,
            Err(TokenError::EmptyToken)
        ));
        assert_eq!(cache.access_token().await.expect("real").value, "ya29.real");
    }
}
