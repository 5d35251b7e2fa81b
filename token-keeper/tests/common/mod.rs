#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use token_keeper::clock::Clock;
use token_keeper::credentials::{OAuthClient, OAuthError, OAuthTokenResponse};

/// 2026-01-01T00:00:00Z
pub const START_MS: i64 = 1_767_225_600_000;

pub const HOUR_MS: i64 = 60 * 60 * 1000;

/// A clock that follows tokio time, so paused tests see cron and sleeps agree.
#[derive(Debug)]
pub struct TokioClock {
    base_ms: i64,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base_ms: i64) -> Self {
        Self {
            base_ms,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.base_ms + self.started.elapsed().as_millis() as i64
    }
}

/// How the fake provider answers.
#[derive(Debug, Clone)]
pub enum Reply {
    Issue { expires_in: i64 },
    Reject(&'static str),
    Unavailable,
}

/// Fake token endpoint that counts calls and can be slowed down.
pub struct FakeProvider {
    calls: AtomicU32,
    delay: Duration,
    reply: Mutex<Reply>,
    seen_refresh_tokens: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(reply: Reply) -> Arc<Self> {
        Self::with_delay(reply, Duration::ZERO)
    }

    pub fn with_delay(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            reply: Mutex::new(reply),
            seen_refresh_tokens: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    pub fn seen_refresh_tokens(&self) -> Vec<String> {
        self.seen_refresh_tokens.lock().clone()
    }
}

#[async_trait]
impl OAuthClient for FakeProvider {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokenResponse, OAuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_refresh_tokens.lock().push(refresh_token.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let reply = self.reply.lock().clone();
        match reply {
            Reply::Issue { expires_in } => Ok(OAuthTokenResponse {
                access_token: format!("access-{n}"),
                refresh_token: Some(format!("refresh-{n}")),
                expires_in: Some(expires_in),
                token_type: Some("Bearer".into()),
                scope: None,
            }),
            Reply::Reject(code) => Err(OAuthError::Status {
                status: 400,
                error: Some(code.to_string()),
                description: Some("refresh token revoked".into()),
            }),
            Reply::Unavailable => Err(OAuthError::Status {
                status: 503,
                error: None,
                description: None,
            }),
        }
    }
}
