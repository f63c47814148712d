//! Token resolver — background lookup of token metadata.
//!
//! The scanner offers every token address it sees through a [`TokenQueue`]
//! without ever blocking; a [`TokenResolver`] task fetches name, symbol and
//! decimals from the node and stores them. Failed lookups are retried with
//! exponential backoff, then marked failed until the token is offered again.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::LedgerError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sink::PersistenceSink;
use crate::source::ChainSource;
use crate::types::TokenInfo;

/// Resolution state of one token address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    Queued,
    Resolved,
    /// Waiting for the next attempt.
    Retrying { attempts: u32 },
    Failed { attempts: u32, last_error: String },
}

impl TokenStatus {
    /// Queued, retrying or already resolved.
    fn is_settled_or_in_flight(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

type StatusMap = Arc<RwLock<HashMap<String, TokenStatus>>>;

/// Non-blocking handle for offering token addresses.
#[derive(Clone)]
pub struct TokenQueue {
    tx: mpsc::Sender<String>,
    status: StatusMap,
}

impl TokenQueue {
    /// Offer `token` for resolution. Returns `true` if it was enqueued.
    ///
    /// Tokens already resolved or in flight are skipped; when the queue is
    /// full the offer is dropped and the token will be offered again the next
    /// time it is seen.
    pub fn offer(&self, token: &str) -> bool {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.get(token).is_some_and(TokenStatus::is_settled_or_in_flight) {
            return false;
        }
        match self.tx.try_send(token.to_string()) {
            Ok(()) => {
                status.insert(token.to_string(), TokenStatus::Queued);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(token, "token queue full, dropping offer");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(token, "token resolver stopped, dropping offer");
                false
            }
        }
    }

    pub fn status(&self, token: &str) -> Option<TokenStatus> {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(token)
            .cloned()
    }
}

struct Retry {
    due: Instant,
    token: String,
    attempts: u32,
}

/// The worker side of the token queue.
pub struct TokenResolver {
    rx: mpsc::Receiver<String>,
    source: Arc<dyn ChainSource>,
    sink: Arc<dyn PersistenceSink>,
    policy: RetryPolicy,
    status: StatusMap,
    retries: Vec<Retry>,
    cancel: CancellationToken,
}

/// Create a connected queue handle and resolver.
pub fn token_channel(
    capacity: usize,
    source: Arc<dyn ChainSource>,
    sink: Arc<dyn PersistenceSink>,
    retry: RetryConfig,
    cancel: CancellationToken,
) -> (TokenQueue, TokenResolver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let status: StatusMap = Arc::default();
    let queue = TokenQueue {
        tx,
        status: Arc::clone(&status),
    };
    let resolver = TokenResolver {
        rx,
        source,
        sink,
        policy: RetryPolicy::new(retry),
        status,
        retries: Vec::new(),
        cancel,
    };
    (queue, resolver)
}

impl TokenResolver {
    /// Run until cancelled, or until every queue handle is dropped and no
    /// retries remain.
    pub async fn run(mut self) {
        let mut open = true;
        loop {
            if !open && self.retries.is_empty() {
                debug!("token queue closed, resolver exiting");
                return;
            }
            let next_due = self.retries.iter().map(|r| r.due).min();
            let wake = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(pending_retries = self.retries.len(), "token resolver cancelled");
                    return;
                }
                next = self.rx.recv(), if open => match next {
                    Some(token) => self.attempt(token, 0).await,
                    None => open = false,
                },
                _ = tokio::time::sleep_until(wake), if next_due.is_some() => {
                    let now = Instant::now();
                    let (due, waiting): (Vec<_>, Vec<_>) =
                        std::mem::take(&mut self.retries).into_iter().partition(|r| r.due <= now);
                    self.retries = waiting;
                    for retry in due {
                        self.attempt(retry.token, retry.attempts).await;
                    }
                }
            }
        }
    }

    /// One lookup; `failed_before` is the number of earlier failed attempts.
    async fn attempt(&mut self, token: String, failed_before: u32) {
        match self.resolve(&token).await {
            Ok(Some(info)) => {
                info!(token = %token, name = %info.name, symbol = %info.symbol, decimals = info.decimals, "token resolved");
                self.set_status(&token, TokenStatus::Resolved);
            }
            Ok(None) => {
                debug!(token = %token, "token already stored");
                self.set_status(&token, TokenStatus::Resolved);
            }
            Err(e) => {
                let attempts = failed_before + 1;
                match self.policy.next_delay(attempts) {
                    Some(delay) => {
                        warn!(
                            token = %token,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "token lookup failed, retrying"
                        );
                        self.set_status(&token, TokenStatus::Retrying { attempts });
                        self.retries.push(Retry {
                            due: Instant::now() + delay,
                            token,
                            attempts,
                        });
                    }
                    None => {
                        error!(token = %token, attempts, error = %e, "token lookup failed, giving up");
                        self.set_status(
                            &token,
                            TokenStatus::Failed {
                                attempts,
                                last_error: e.to_string(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Fetch and store metadata. `Ok(None)` when the sink already has it.
    async fn resolve(&self, token: &str) -> Result<Option<TokenInfo>, LedgerError> {
        if self.sink.token(token).await?.is_some() {
            return Ok(None);
        }
        let name = self.source.token_name(token).await?;
        let symbol = self.source.token_symbol(token).await?;
        let decimals = self.source.token_decimals(token).await?;
        let info = TokenInfo {
            address: token.to_string(),
            name: clean_label(&name),
            symbol: clean_label(&symbol),
            decimals,
        };
        self.sink.save_token(info.clone()).await?;
        Ok(Some(info))
    }

    fn set_status(&self, token: &str, status: TokenStatus) {
        self.status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), status);
    }
}

/// Strip leading control characters and surrounding NUL/space padding.
pub fn clean_label(raw: &str) -> String {
    raw.trim_start_matches(|c: char| c.is_ascii_control())
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}
